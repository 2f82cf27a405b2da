//! BoardActor - owns the status board.
//!
//! All ingestion flows through this actor, which gives every (host, test)
//! record a single writer. Color transitions are published on a broadcast
//! channel for the alert actor (and anything else that subscribes); the
//! staleness sweep runs on a fixed tick inside the actor so it takes the
//! same exclusivity as live updates - a fresh report arriving exactly at
//! the staleness deadline can never produce two conflicting transitions.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time;
use tracing::{debug, instrument, trace, warn};

use super::locator::LocatorAccess;
use super::messages::{BoardCommand, IngestError, RecordView};
use crate::board::{Board, BoardSnapshot, Transition};
use crate::locator::ServiceType;
use crate::proto::StatusReport;

/// Fixed sweep tick; bounds wake-ups instead of arming one timer per test.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Bounded wait for the ownership check. On expiry the update is refused,
/// never applied on a server that might not be authoritative.
const OWNERSHIP_TIMEOUT: Duration = Duration::from_secs(2);

/// Distributed-mode ownership check: this server only applies updates for
/// hosts the locator says it owns.
pub struct OwnershipCheck {
    pub locator: LocatorAccess,
    pub server: String,
}

pub struct BoardActor {
    board: Board,
    command_rx: mpsc::Receiver<BoardCommand>,
    event_tx: broadcast::Sender<Transition>,
    ownership: Option<OwnershipCheck>,
}

impl BoardActor {
    fn new(
        board: Board,
        command_rx: mpsc::Receiver<BoardCommand>,
        event_tx: broadcast::Sender<Transition>,
        ownership: Option<OwnershipCheck>,
    ) -> Self {
        Self {
            board,
            command_rx,
            event_tx,
            ownership,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting board actor");

        let mut sweep_tick = time::interval(SWEEP_INTERVAL);
        sweep_tick.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => {
                            warn!("command channel closed, shutting down");
                            break;
                        }
                    }
                }

                _ = sweep_tick.tick() => {
                    self.sweep();
                }
            }
        }

        debug!("board actor stopped");
    }

    fn sweep(&mut self) {
        let transitions = self.board.sweep(Utc::now());
        if !transitions.is_empty() {
            debug!("sweep found {} stale records", transitions.len());
        }
        for transition in transitions {
            let _ = self.event_tx.send(transition);
        }
    }

    async fn handle_command(&mut self, cmd: BoardCommand) -> bool {
        match cmd {
            BoardCommand::Update { report, respond_to } => {
                let result = self.apply_update(report).await;
                let _ = respond_to.send(result);
            }

            BoardCommand::Acknowledge {
                host,
                test,
                minutes,
                message,
                author,
                respond_to,
            } => {
                let until = Utc::now() + chrono::Duration::minutes(minutes as i64);
                let result = self
                    .board
                    .acknowledge(&host, &test, until, &message, &author)
                    .map_err(IngestError::from);
                let _ = respond_to.send(result);
            }

            BoardCommand::ClientData {
                host,
                os,
                payload,
                respond_to,
            } => {
                let result = self
                    .board
                    .set_client_data(&host, &os, &payload)
                    .map_err(IngestError::from);
                let _ = respond_to.send(result);
            }

            BoardCommand::Notes {
                host,
                text,
                respond_to,
            } => {
                let result = self.board.set_notes(&host, &text).map_err(IngestError::from);
                let _ = respond_to.send(result);
            }

            BoardCommand::Drop { host, test } => match test {
                Some(test) => {
                    self.board.drop_test(&host, &test);
                }
                None => {
                    self.board.drop_host(&host);
                }
            },

            BoardCommand::Rename {
                old,
                new,
                respond_to,
            } => {
                let result = self.board.rename_host(&old, &new).map_err(IngestError::from);
                let _ = respond_to.send(result);
            }

            BoardCommand::Query {
                host,
                test,
                respond_to,
            } => {
                let now = Utc::now();
                let view = self.board.get(&host, &test).map(|record| RecordView {
                    color: record.color,
                    text: record.text.clone(),
                    acked: record.ack.as_ref().is_some_and(|ack| ack.until > now),
                    last_change: record.last_change,
                });
                let _ = respond_to.send(view);
            }

            BoardCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.board.snapshot(Utc::now()));
            }

            BoardCommand::Shutdown => {
                debug!("received shutdown command");
                return false;
            }
        }
        true
    }

    async fn apply_update(&mut self, report: StatusReport) -> Result<(), IngestError> {
        if let Some(check) = &self.ownership {
            let resolved = time::timeout(
                OWNERSHIP_TIMEOUT,
                check.locator.resolve(&report.host, ServiceType::Client),
            )
            .await;

            match resolved {
                Ok(Ok(outcome)) if outcome.server() == check.server => {
                    trace!("{}: ownership confirmed", report.host);
                }
                Ok(Ok(outcome)) => {
                    return Err(IngestError::NotOwner {
                        owner: Some(outcome.server().to_string()),
                    });
                }
                // unsure of ownership: refuse rather than misapply
                Ok(Err(_)) | Err(_) => {
                    warn!("{}: ownership check failed, refusing update", report.host);
                    return Err(IngestError::NotOwner { owner: None });
                }
            }
        }

        let transition = self
            .board
            .update(&report, Utc::now())
            .map_err(IngestError::from)?;

        if let Some(transition) = transition {
            let _ = self.event_tx.send(transition);
        }
        Ok(())
    }
}

/// Handle for controlling the BoardActor
#[derive(Clone)]
pub struct BoardHandle {
    sender: mpsc::Sender<BoardCommand>,
    event_tx: broadcast::Sender<Transition>,
}

impl BoardHandle {
    /// Spawn a board actor. With an [`OwnershipCheck`], updates are only
    /// applied for hosts the locator assigns to this server.
    pub fn spawn(board: Board, ownership: Option<OwnershipCheck>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (event_tx, _) = broadcast::channel(256);

        let actor = BoardActor::new(board, cmd_rx, event_tx.clone(), ownership);
        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            event_tx,
        }
    }

    /// Subscribe to color transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.event_tx.subscribe()
    }

    pub async fn update(&self, report: StatusReport) -> Result<(), IngestError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(BoardCommand::Update {
                report,
                respond_to: tx,
            })
            .await
            .map_err(|_| IngestError::Rejected("board unavailable".to_string()))?;
        rx.await
            .map_err(|_| IngestError::Rejected("board unavailable".to_string()))?
    }

    pub async fn acknowledge(
        &self,
        host: &str,
        test: &str,
        minutes: u32,
        message: &str,
        author: &str,
    ) -> Result<(), IngestError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(BoardCommand::Acknowledge {
                host: host.to_string(),
                test: test.to_string(),
                minutes,
                message: message.to_string(),
                author: author.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| IngestError::Rejected("board unavailable".to_string()))?;
        rx.await
            .map_err(|_| IngestError::Rejected("board unavailable".to_string()))?
    }

    pub async fn client_data(&self, host: &str, os: &str, payload: &str) -> Result<(), IngestError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(BoardCommand::ClientData {
                host: host.to_string(),
                os: os.to_string(),
                payload: payload.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| IngestError::Rejected("board unavailable".to_string()))?;
        rx.await
            .map_err(|_| IngestError::Rejected("board unavailable".to_string()))?
    }

    pub async fn notes(&self, host: &str, text: &str) -> Result<(), IngestError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(BoardCommand::Notes {
                host: host.to_string(),
                text: text.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| IngestError::Rejected("board unavailable".to_string()))?;
        rx.await
            .map_err(|_| IngestError::Rejected("board unavailable".to_string()))?
    }

    pub async fn drop(&self, host: &str, test: Option<&str>) {
        let _ = self
            .sender
            .send(BoardCommand::Drop {
                host: host.to_string(),
                test: test.map(String::from),
            })
            .await;
    }

    pub async fn rename(&self, old: &str, new: &str) -> Result<(), IngestError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(BoardCommand::Rename {
                old: old.to_string(),
                new: new.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| IngestError::Rejected("board unavailable".to_string()))?;
        rx.await
            .map_err(|_| IngestError::Rejected("board unavailable".to_string()))?
    }

    pub async fn query(&self, host: &str, test: &str) -> Option<RecordView> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(BoardCommand::Query {
                host: host.to_string(),
                test: test.to_string(),
                respond_to: tx,
            })
            .await
            .ok()?;
        rx.await.ok()?
    }

    pub async fn snapshot(&self) -> Option<BoardSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(BoardCommand::Snapshot { respond_to: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(BoardCommand::Shutdown).await;
    }
}
