//! Message types for actor communication.
//!
//! Commands are request/response messages sent to a specific actor via
//! its mpsc channel; queries carry a oneshot reply sender. The board's
//! color transitions are broadcast ([`crate::board::Transition`]) so any
//! number of subscribers can fan out.

use std::fmt;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::Color;
use crate::alert::ActiveAlert;
use crate::board::{BoardError, BoardSnapshot};
use crate::locator::{AssignOutcome, LocatorError, QueryResult, ServiceType, Stickiness};
use crate::proto::StatusReport;

/// Why an inbound submission was refused. Handled at the connection
/// boundary; never tears down shared state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    UnknownHost(String),
    UnknownTest { host: String, test: String },

    /// Another server owns this host for status ingestion; the caller
    /// should relay upstream instead of applying the update here.
    NotOwner { owner: Option<String> },

    /// Catch-all rejection with a terse reason
    Rejected(String),
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::UnknownHost(host) => write!(f, "unknown host '{host}'"),
            IngestError::UnknownTest { host, test } => {
                write!(f, "unknown test '{test}' for host '{host}'")
            }
            IngestError::NotOwner { owner: Some(owner) } => {
                write!(f, "not owner, host is handled by '{owner}'")
            }
            IngestError::NotOwner { owner: None } => write!(f, "not owner"),
            IngestError::Rejected(reason) => write!(f, "{reason}"),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<BoardError> for IngestError {
    fn from(err: BoardError) -> Self {
        match err {
            BoardError::UnknownHost(host) => IngestError::UnknownHost(host),
            BoardError::UnknownTest { host, test } => IngestError::UnknownTest { host, test },
            BoardError::HostExists(host) => {
                IngestError::Rejected(format!("host '{host}' already exists"))
            }
        }
    }
}

/// Cloneable view of one test record for query responses.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordView {
    pub color: Color,
    pub text: String,
    pub acked: bool,
    pub last_change: DateTime<Utc>,
}

/// Commands understood by the board actor.
#[derive(Debug)]
pub enum BoardCommand {
    /// Apply one status report (ownership-checked in distributed mode)
    Update {
        report: StatusReport,
        respond_to: oneshot::Sender<Result<(), IngestError>>,
    },

    Acknowledge {
        host: String,
        test: String,
        minutes: u32,
        message: String,
        author: String,
        respond_to: oneshot::Sender<Result<(), IngestError>>,
    },

    /// Store a raw OS-collector payload
    ClientData {
        host: String,
        os: String,
        payload: String,
        respond_to: oneshot::Sender<Result<(), IngestError>>,
    },

    Notes {
        host: String,
        text: String,
        respond_to: oneshot::Sender<Result<(), IngestError>>,
    },

    Drop {
        host: String,
        test: Option<String>,
    },

    Rename {
        old: String,
        new: String,
        respond_to: oneshot::Sender<Result<(), IngestError>>,
    },

    Query {
        host: String,
        test: String,
        respond_to: oneshot::Sender<Option<RecordView>>,
    },

    Snapshot {
        respond_to: oneshot::Sender<BoardSnapshot>,
    },

    /// Gracefully shut down the board actor
    Shutdown,
}

/// Commands understood by the alert actor.
#[derive(Debug)]
pub enum AlertCommand {
    Acknowledge {
        host: String,
        test: String,
        until: DateTime<Utc>,
    },

    Drop {
        host: String,
        test: Option<String>,
    },

    Rename {
        old: String,
        new: String,
    },

    GetAlert {
        host: String,
        test: String,
        respond_to: oneshot::Sender<Option<ActiveAlert>>,
    },

    /// Write the alert checkpoint now
    Save {
        respond_to: oneshot::Sender<()>,
    },

    /// Gracefully shut down the alert actor
    Shutdown,
}

/// Commands understood by the locator actor.
#[derive(Debug)]
pub enum LocatorCommand {
    Register {
        server: String,
        service: ServiceType,
        weight: u32,
        sticky: Stickiness,
        respond_to: oneshot::Sender<()>,
    },

    /// Resolve (and assign on first demand) the owner of a pair
    Resolve {
        host: String,
        service: ServiceType,
        respond_to: oneshot::Sender<Result<AssignOutcome, LocatorError>>,
    },

    /// Pure lookup, no side effects
    Query {
        host: String,
        service: ServiceType,
        respond_to: oneshot::Sender<QueryResult>,
    },

    ServerUp {
        server: String,
        service: ServiceType,
        respond_to: oneshot::Sender<Result<(), LocatorError>>,
    },

    ServerDown {
        server: String,
        service: ServiceType,
        respond_to: oneshot::Sender<Result<(), LocatorError>>,
    },

    Rename {
        service: ServiceType,
        old: String,
        new: String,
        respond_to: oneshot::Sender<Result<(), LocatorError>>,
    },

    /// Write the locator checkpoint now
    Save {
        respond_to: oneshot::Sender<()>,
    },

    /// Gracefully shut down the locator actor
    Shutdown,
}
