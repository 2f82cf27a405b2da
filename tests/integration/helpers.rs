//! Helper functions for integration tests

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use watchpost::alert::{AlertEngine, HostMeta};
use watchpost::board::Board;
use watchpost::config::{AlertsConfig, HostConfig, NotifyTarget, RecipientConfig, RuleConfig};
use watchpost::notify::{Notification, Notifier, NotifyError};
use watchpost::proto::StatusReport;
use watchpost::rules::{Calendars, CompiledRules};
use watchpost::{AlertColors, Color};

/// A fixed reference time: Wednesday 2024-03-06, noon UTC.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).unwrap()
}

pub fn report(host: &str, test: &str, color: Color, text: &str) -> StatusReport {
    StatusReport {
        host: host.to_string(),
        test: test.to_string(),
        color,
        text: text.to_string(),
        lifetime_minutes: None,
        group: None,
    }
}

pub fn test_board(hosts: &[&str]) -> Board {
    Board::new(hosts.iter().map(|h| HostConfig::ghost(h)), 30, false)
}

pub fn log_recipient(name: &str, interval_minutes: u32) -> RecipientConfig {
    RecipientConfig {
        target: NotifyTarget::Log {
            name: name.to_string(),
        },
        interval_minutes,
    }
}

pub fn webhook_recipient(url: &str, interval_minutes: u32) -> RecipientConfig {
    RecipientConfig {
        target: NotifyTarget::Webhook {
            url: url.to_string(),
        },
        interval_minutes,
    }
}

pub fn rule_with(
    min_duration_minutes: Option<u32>,
    recipients: Vec<RecipientConfig>,
) -> RuleConfig {
    RuleConfig {
        hosts: None,
        pages: None,
        tests: None,
        colors: None,
        time: None,
        min_duration_minutes,
        max_duration_minutes: None,
        recipients,
    }
}

/// Engine with the given rules, default alert colors, recovery enabled.
pub fn engine_with(rules: Vec<RuleConfig>) -> AlertEngine {
    let compiled = CompiledRules::compile(&AlertsConfig {
        colors: None,
        notify_recovered: true,
        rules,
    })
    .unwrap();
    AlertEngine::new(
        compiled,
        Calendars::default(),
        HashMap::new(),
        AlertColors::default(),
        true,
    )
}

/// Notifier that records every notification it is handed.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}
