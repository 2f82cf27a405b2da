//! Outbound notification dispatch.
//!
//! The alert engine only decides *that* somebody must be told; delivery
//! goes through the [`Notifier`] hook so deployments can plug in their own
//! dispatcher. The shipped [`WebhookDispatcher`] posts JSON to webhook
//! recipients and logs the rest.

use std::fmt;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{info, instrument};

use crate::Color;
use crate::config::NotifyTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// First page for a new problem
    Problem,
    /// Scheduled repeat while the problem persists
    Reminder,
    /// The final "all clear"
    Recovery,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Problem => "problem",
            NotificationKind::Reminder => "reminder",
            NotificationKind::Recovery => "recovery",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub host: String,
    pub test: String,
    pub color: Color,
    pub cookie: u64,
    pub kind: NotificationKind,
    pub message: String,
    pub target: NotifyTarget,
}

impl Notification {
    /// One-line subject, e.g. `watchpost [17] db1:cpu CRITICAL (red)`.
    pub fn subject(&self) -> String {
        if self.kind == NotificationKind::Recovery {
            return format!("watchpost {}:{} recovered", self.host, self.test);
        }

        let severity = match self.color {
            Color::Green => "is GREEN",
            Color::Clear => "has no data (CLEAR)",
            Color::Blue => "is disabled (BLUE)",
            Color::Purple => "stopped reporting (PURPLE)",
            Color::Yellow => "warning (YELLOW)",
            Color::Red => "CRITICAL (RED)",
        };
        format!("watchpost [{}] {}:{} {severity}", self.cookie, self.host, self.test)
    }
}

#[derive(Debug)]
pub enum NotifyError {
    Http(String),
    Rejected { status: u16 },
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyError::Http(msg) => write!(f, "notification delivery failed: {msg}"),
            NotifyError::Rejected { status } => {
                write!(f, "notification rejected with status {status}")
            }
        }
    }
}

impl std::error::Error for NotifyError {}

/// Delivery hook implemented by the notification dispatcher.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Production dispatcher: webhook recipients get a JSON POST, log
/// recipients an info line.
#[derive(Debug, Clone, Default)]
pub struct WebhookDispatcher {
    client: Client,
}

impl WebhookDispatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Notifier for WebhookDispatcher {
    #[instrument(skip(self, notification), fields(host = %notification.host, test = %notification.test))]
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        match &notification.target {
            NotifyTarget::Log { name } => {
                info!(
                    "[{name}] {}: {}",
                    notification.subject(),
                    notification.message
                );
                Ok(())
            }

            NotifyTarget::Webhook { url } => {
                let payload = json!({
                    "subject": notification.subject(),
                    "host": notification.host,
                    "test": notification.test,
                    "color": notification.color,
                    "cookie": notification.cookie,
                    "kind": notification.kind.as_str(),
                    "message": notification.message,
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                });

                let response = self
                    .client
                    .post(url)
                    .json(&payload)
                    .send()
                    .await
                    .map_err(|e| NotifyError::Http(e.to_string()))?;

                if response.status().is_success() {
                    info!("delivered webhook notification");
                    Ok(())
                } else {
                    Err(NotifyError::Rejected {
                        status: response.status().as_u16(),
                    })
                }
            }
        }
    }
}

/// Dispatcher that only logs. Useful for dry runs and as a stand-in when
/// no notification channel is configured.
#[derive(Debug, Clone, Default)]
pub struct LogDispatcher;

#[async_trait]
impl Notifier for LogDispatcher {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            "{} -> {}: {}",
            notification.subject(),
            notification.target.address(),
            notification.message
        );
        Ok(())
    }
}
