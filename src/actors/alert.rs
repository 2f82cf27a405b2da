//! AlertActor - drives the escalation engine.
//!
//! The actor subscribes to board transitions, runs the escalation timers
//! on a fixed tick and snapshots the alert state in the background.
//! Notification delivery is spawned off the actor loop: a slow or failing
//! channel delays nothing, the failure is logged and the recipient is
//! simply picked up again at its next scheduled reminder.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time;
use tracing::{debug, instrument, warn};

use super::messages::AlertCommand;
use crate::alert::{ActiveAlert, AlertEngine};
use crate::board::Transition;
use crate::checkpoint;
use crate::notify::{Notification, Notifier};

/// Escalation timers are checked on this tick.
const TIMER_INTERVAL: Duration = Duration::from_secs(10);

/// Where and how often the alert state is snapshotted.
#[derive(Debug, Clone)]
pub struct AlertCheckpoint {
    pub path: PathBuf,
    pub interval: Duration,
}

pub struct AlertActor {
    engine: AlertEngine,
    notifier: Arc<dyn Notifier>,
    command_rx: mpsc::Receiver<AlertCommand>,
    transition_rx: broadcast::Receiver<Transition>,
    checkpoint: Option<AlertCheckpoint>,
}

impl AlertActor {
    fn new(
        engine: AlertEngine,
        notifier: Arc<dyn Notifier>,
        command_rx: mpsc::Receiver<AlertCommand>,
        transition_rx: broadcast::Receiver<Transition>,
        checkpoint: Option<AlertCheckpoint>,
    ) -> Self {
        Self {
            engine,
            notifier,
            command_rx,
            transition_rx,
            checkpoint,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting alert actor");

        let mut timer_tick = time::interval(TIMER_INTERVAL);
        timer_tick.tick().await; // the first tick fires immediately

        let save_period = self
            .checkpoint
            .as_ref()
            .map(|cp| cp.interval)
            .unwrap_or(Duration::from_secs(3600));
        let mut save_tick = time::interval(save_period);
        save_tick.tick().await;

        loop {
            tokio::select! {
                result = self.transition_rx.recv() => {
                    match result {
                        Ok(transition) => {
                            let sent = self.engine.handle_transition(&transition, Utc::now());
                            self.dispatch(sent);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("alert actor lagged, skipped {skipped} transitions");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("transition channel closed, shutting down");
                            break;
                        }
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        AlertCommand::Acknowledge { host, test, until } => {
                            self.engine.acknowledge(&host, &test, until);
                        }

                        AlertCommand::Drop { host, test } => {
                            self.engine.drop_alert(&host, test.as_deref());
                        }

                        AlertCommand::Rename { old, new } => {
                            self.engine.rename_host(&old, &new);
                        }

                        AlertCommand::GetAlert { host, test, respond_to } => {
                            let _ = respond_to.send(self.engine.get(&host, &test).cloned());
                        }

                        AlertCommand::Save { respond_to } => {
                            self.save();
                            let _ = respond_to.send(());
                        }

                        AlertCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                _ = timer_tick.tick() => {
                    let sent = self.engine.check_timers(Utc::now());
                    self.dispatch(sent);
                }

                _ = save_tick.tick(), if self.checkpoint.is_some() => {
                    self.save();
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        self.save();
        debug!("alert actor stopped");
    }

    /// Hand notifications to the dispatcher off the actor loop.
    fn dispatch(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            let notifier = Arc::clone(&self.notifier);
            tokio::spawn(async move {
                if let Err(e) = notifier.send(&notification).await {
                    warn!(
                        "delivery to {} failed ({e}); retrying at the next scheduled reminder",
                        notification.target.address()
                    );
                }
            });
        }
    }

    /// Serialize first, write second: the engine is only borrowed for the
    /// in-memory copy, never across the file write.
    fn save(&self) {
        if let Some(cp) = &self.checkpoint {
            let contents = self.engine.save();
            checkpoint::save_or_warn(&cp.path, &contents, "alert state");
        }
    }
}

/// Handle for controlling the AlertActor
#[derive(Clone)]
pub struct AlertHandle {
    sender: mpsc::Sender<AlertCommand>,
}

impl AlertHandle {
    /// Spawn an alert actor around a prepared engine (rules compiled,
    /// checkpoint already loaded).
    pub fn spawn(
        engine: AlertEngine,
        notifier: Arc<dyn Notifier>,
        transition_rx: broadcast::Receiver<Transition>,
        checkpoint: Option<AlertCheckpoint>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let actor = AlertActor::new(engine, notifier, cmd_rx, transition_rx, checkpoint);
        tokio::spawn(actor.run());
        Self { sender: cmd_tx }
    }

    pub async fn acknowledge(&self, host: &str, test: &str, until: DateTime<Utc>) {
        let _ = self
            .sender
            .send(AlertCommand::Acknowledge {
                host: host.to_string(),
                test: test.to_string(),
                until,
            })
            .await;
    }

    pub async fn drop(&self, host: &str, test: Option<&str>) {
        let _ = self
            .sender
            .send(AlertCommand::Drop {
                host: host.to_string(),
                test: test.map(String::from),
            })
            .await;
    }

    pub async fn rename(&self, old: &str, new: &str) {
        let _ = self
            .sender
            .send(AlertCommand::Rename {
                old: old.to_string(),
                new: new.to_string(),
            })
            .await;
    }

    pub async fn get_alert(&self, host: &str, test: &str) -> Option<ActiveAlert> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AlertCommand::GetAlert {
                host: host.to_string(),
                test: test.to_string(),
                respond_to: tx,
            })
            .await
            .ok()?;
        rx.await.ok()?
    }

    pub async fn save_now(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(AlertCommand::Save { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(AlertCommand::Shutdown).await;
    }
}
