//! LocatorActor - owns the assignment directory.
//!
//! The directory itself is [`crate::locator::Locator`]; this actor gives
//! it the single-writer discipline and the checkpoint schedule. Both the
//! hub (embedded mode) and the standalone locator daemon run the same
//! actor; remote hubs reach it over the wire through [`LocatorAccess`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, instrument, warn};

use super::messages::LocatorCommand;
use crate::checkpoint;
use crate::locator::{AssignOutcome, Locator, LocatorError, QueryResult, ServiceType, Stickiness};
use crate::proto::{LocatorRequest, commafy};

/// Where and how often the locator persists its directory.
#[derive(Debug, Clone)]
pub struct LocatorCheckpoint {
    pub servers_path: PathBuf,
    pub hosts_path: PathBuf,
    pub interval: Duration,
}

pub struct LocatorActor {
    locator: Locator,
    command_rx: mpsc::Receiver<LocatorCommand>,
    checkpoint: Option<LocatorCheckpoint>,
}

impl LocatorActor {
    fn new(
        locator: Locator,
        command_rx: mpsc::Receiver<LocatorCommand>,
        checkpoint: Option<LocatorCheckpoint>,
    ) -> Self {
        Self {
            locator,
            command_rx,
            checkpoint,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting locator actor");

        let save_period = self
            .checkpoint
            .as_ref()
            .map(|cp| cp.interval)
            .unwrap_or(Duration::from_secs(3600));
        let mut save_tick = time::interval(save_period);
        save_tick.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd) {
                                break;
                            }
                        }
                        None => {
                            warn!("command channel closed, shutting down");
                            break;
                        }
                    }
                }

                _ = save_tick.tick(), if self.checkpoint.is_some() => {
                    self.save();
                }
            }
        }

        self.save();
        debug!("locator actor stopped");
    }

    fn handle_command(&mut self, cmd: LocatorCommand) -> bool {
        match cmd {
            LocatorCommand::Register {
                server,
                service,
                weight,
                sticky,
                respond_to,
            } => {
                self.locator.register(&server, service, weight, sticky);
                let _ = respond_to.send(());
            }

            LocatorCommand::Resolve {
                host,
                service,
                respond_to,
            } => {
                let _ = respond_to.send(self.locator.assign(&host, service));
            }

            LocatorCommand::Query {
                host,
                service,
                respond_to,
            } => {
                let _ = respond_to.send(self.locator.query(&host, service));
            }

            LocatorCommand::ServerUp {
                server,
                service,
                respond_to,
            } => {
                let _ = respond_to.send(self.locator.server_up(&server, service));
            }

            LocatorCommand::ServerDown {
                server,
                service,
                respond_to,
            } => {
                let _ = respond_to.send(self.locator.server_down(&server, service));
            }

            LocatorCommand::Rename {
                service,
                old,
                new,
                respond_to,
            } => {
                let _ = respond_to.send(self.locator.rename_host(service, &old, &new));
            }

            LocatorCommand::Save { respond_to } => {
                self.save();
                let _ = respond_to.send(());
            }

            LocatorCommand::Shutdown => {
                debug!("received shutdown command");
                return false;
            }
        }
        true
    }

    fn save(&self) {
        if let Some(cp) = &self.checkpoint {
            checkpoint::save_or_warn(&cp.servers_path, &self.locator.save_servers(), "locator servers");
            checkpoint::save_or_warn(&cp.hosts_path, &self.locator.save_hosts(), "locator hosts");
        }
    }
}

/// Handle for controlling the LocatorActor
#[derive(Clone)]
pub struct LocatorHandle {
    sender: mpsc::Sender<LocatorCommand>,
}

impl LocatorHandle {
    /// Spawn a locator actor owning `locator`. With a checkpoint config,
    /// the directory is snapshotted periodically and on shutdown.
    pub fn spawn(locator: Locator, checkpoint: Option<LocatorCheckpoint>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let actor = LocatorActor::new(locator, cmd_rx, checkpoint);
        tokio::spawn(actor.run());
        Self { sender: cmd_tx }
    }

    pub async fn register(
        &self,
        server: &str,
        service: ServiceType,
        weight: u32,
        sticky: Stickiness,
    ) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(LocatorCommand::Register {
                server: server.to_string(),
                service,
                weight,
                sticky,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.is_ok()
    }

    /// Resolve the owner of `(host, service)`, assigning one on first
    /// demand. A dead actor reports as "no server".
    pub async fn resolve(
        &self,
        host: &str,
        service: ServiceType,
    ) -> Result<AssignOutcome, LocatorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(LocatorCommand::Resolve {
                host: host.to_string(),
                service,
                respond_to: tx,
            })
            .await
            .map_err(|_| LocatorError::NoServer)?;
        rx.await.map_err(|_| LocatorError::NoServer)?
    }

    /// Side-effect-free lookup.
    pub async fn query(&self, host: &str, service: ServiceType) -> QueryResult {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(LocatorCommand::Query {
                host: host.to_string(),
                service,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return QueryResult::Unassigned;
        }
        rx.await.unwrap_or(QueryResult::Unassigned)
    }

    pub async fn server_up(&self, server: &str, service: ServiceType) -> Result<(), LocatorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(LocatorCommand::ServerUp {
                server: server.to_string(),
                service,
                respond_to: tx,
            })
            .await
            .map_err(|_| LocatorError::UnknownServer(server.to_string()))?;
        rx.await
            .map_err(|_| LocatorError::UnknownServer(server.to_string()))?
    }

    pub async fn server_down(&self, server: &str, service: ServiceType) -> Result<(), LocatorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(LocatorCommand::ServerDown {
                server: server.to_string(),
                service,
                respond_to: tx,
            })
            .await
            .map_err(|_| LocatorError::UnknownServer(server.to_string()))?;
        rx.await
            .map_err(|_| LocatorError::UnknownServer(server.to_string()))?
    }

    pub async fn rename_host(
        &self,
        service: ServiceType,
        old: &str,
        new: &str,
    ) -> Result<(), LocatorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(LocatorCommand::Rename {
                service,
                old: old.to_string(),
                new: new.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| LocatorError::UnknownHost(old.to_string()))?;
        rx.await.map_err(|_| LocatorError::UnknownHost(old.to_string()))?
    }

    pub async fn save_now(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(LocatorCommand::Save { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(LocatorCommand::Shutdown).await;
    }
}

/// Answer one locator wire request. Shared between the hub's listener
/// (embedded locator) and the standalone locator daemon.
pub async fn handle_request(handle: &LocatorHandle, request: LocatorRequest) -> String {
    match request {
        LocatorRequest::Register {
            server,
            service,
            weight,
            sticky,
        } => {
            if handle.register(&server, service, weight, sticky).await {
                "OK".to_string()
            } else {
                "FAILED".to_string()
            }
        }

        LocatorRequest::Query { service, host } => match handle.resolve(&host, service).await {
            Ok(AssignOutcome::Pinned(server)) => format!("!|{server}"),
            Ok(AssignOutcome::Fresh(server)) => format!("*|{server}"),
            Err(_) => "?".to_string(),
        },

        LocatorRequest::ServerUp { server, service } => {
            match handle.server_up(&server, service).await {
                Ok(()) => "OK".to_string(),
                Err(_) => "FAILED".to_string(),
            }
        }

        LocatorRequest::ServerDown { server, service } => {
            match handle.server_down(&server, service).await {
                Ok(()) => "OK".to_string(),
                Err(_) => "FAILED".to_string(),
            }
        }

        LocatorRequest::Rename { service, old, new } => {
            match handle.rename_host(service, &old, &new).await {
                Ok(()) => "OK".to_string(),
                Err(_) => "FAILED".to_string(),
            }
        }

        LocatorRequest::Ping => format!("PONG|{}", env!("CARGO_PKG_VERSION")),

        LocatorRequest::Save => {
            handle.save_now().await;
            "OK".to_string()
        }
    }
}

/// How a hub reaches the locator: the in-process actor, or a remote
/// daemon over the wire.
#[derive(Clone)]
pub enum LocatorAccess {
    Embedded(LocatorHandle),
    Remote { addr: SocketAddr, timeout: Duration },
}

impl LocatorAccess {
    /// Resolve ownership with a bounded wait. Every failure mode - dead
    /// actor, connect error, timeout, garbled response - comes back as an
    /// error, so callers that are unsure of ownership refuse the update
    /// instead of guessing.
    pub async fn resolve(
        &self,
        host: &str,
        service: ServiceType,
    ) -> Result<AssignOutcome, LocatorError> {
        match self {
            LocatorAccess::Embedded(handle) => handle.resolve(host, service).await,
            LocatorAccess::Remote { addr, timeout } => {
                match time::timeout(*timeout, remote_resolve(*addr, host, service)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("locator query to {addr} timed out");
                        Err(LocatorError::NoServer)
                    }
                }
            }
        }
    }
}

async fn remote_resolve(
    addr: SocketAddr,
    host: &str,
    service: ServiceType,
) -> Result<AssignOutcome, LocatorError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|_| LocatorError::NoServer)?;

    let request = format!("locator query|{}|{}\n\n", service, commafy(host));
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|_| LocatorError::NoServer)?;

    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .map_err(|_| LocatorError::NoServer)?;
    let response = response.trim();

    if let Some(server) = response.strip_prefix("!|") {
        Ok(AssignOutcome::Pinned(server.to_string()))
    } else if let Some(server) = response.strip_prefix("*|") {
        Ok(AssignOutcome::Fresh(server.to_string()))
    } else if response == "?" {
        Err(LocatorError::Unavailable)
    } else {
        Err(LocatorError::NoServer)
    }
}
