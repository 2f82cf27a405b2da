//! The status board: canonical state of every monitored (host, test) pair.
//!
//! The board is a plain synchronous structure owned by a single actor
//! (`actors::board`). All color transitions flow through [`Board::update`]
//! and [`Board::sweep`]; nothing else ever changes a record's color.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, trace};

use crate::Color;
use crate::config::HostConfig;
use crate::proto::StatusReport;

/// Emitted whenever a record's color actually changes. Color-stable
/// refresh reports produce no event.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub host: String,
    pub test: String,
    pub old_color: Color,
    pub new_color: Color,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Acknowledgement {
    pub until: DateTime<Utc>,
    pub message: String,
    pub author: String,
}

#[derive(Debug, Clone)]
pub struct TestRecord {
    pub color: Color,
    pub prev_color: Color,
    pub last_update: DateTime<Utc>,
    pub last_change: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub text: String,
    pub ack: Option<Acknowledgement>,

    /// Whether this color escalates into the host/page aggregate
    pub propagate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardError {
    UnknownHost(String),
    UnknownTest { host: String, test: String },
    HostExists(String),
}

impl fmt::Display for BoardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoardError::UnknownHost(host) => write!(f, "unknown host '{host}'"),
            BoardError::UnknownTest { host, test } => {
                write!(f, "unknown test '{test}' for host '{host}'")
            }
            BoardError::HostExists(host) => write!(f, "host '{host}' already exists"),
        }
    }
}

impl std::error::Error for BoardError {}

#[derive(Debug)]
struct HostEntry {
    config: HostConfig,
    client_os: Option<String>,
    client_data: Option<String>,
    notes: Option<String>,
}

/// Read-only view of the board for report generators and the `board`
/// wire query. An owned clone, so external code cannot corrupt history.
#[derive(Debug, Clone)]
pub struct BoardSnapshot {
    pub generated_at: DateTime<Utc>,
    pub rows: Vec<SnapshotRow>,
}

#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub host: String,
    pub test: String,
    pub color: Color,
    pub prev_color: Color,
    pub last_change: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub acked: bool,
    pub text: String,
}

#[derive(Debug)]
pub struct Board {
    hosts: HashMap<String, HostEntry>,
    records: HashMap<(String, String), TestRecord>,
    default_validity: Duration,
    accept_ghosts: bool,
}

impl Board {
    pub fn new(
        hosts: impl IntoIterator<Item = HostConfig>,
        default_validity_minutes: u32,
        accept_ghosts: bool,
    ) -> Self {
        let hosts = hosts
            .into_iter()
            .map(|config| {
                (
                    config.hostname.clone(),
                    HostEntry {
                        config,
                        client_os: None,
                        client_data: None,
                        notes: None,
                    },
                )
            })
            .collect();

        Board {
            hosts,
            records: HashMap::new(),
            default_validity: Duration::minutes(default_validity_minutes as i64),
            accept_ghosts,
        }
    }

    /// Replace host configurations on reload. Test records survive; records
    /// of hosts that vanished from the configuration are dropped.
    pub fn reload_hosts(&mut self, hosts: impl IntoIterator<Item = HostConfig>) {
        let fresh: HashMap<String, HostConfig> = hosts
            .into_iter()
            .map(|c| (c.hostname.clone(), c))
            .collect();

        self.records.retain(|(host, _), _| fresh.contains_key(host));
        self.hosts.retain(|name, _| fresh.contains_key(name));

        for (name, config) in fresh {
            match self.hosts.get_mut(&name) {
                Some(entry) => entry.config = config,
                None => {
                    self.hosts.insert(
                        name,
                        HostEntry {
                            config,
                            client_os: None,
                            client_data: None,
                            notes: None,
                        },
                    );
                }
            }
        }
    }

    fn host_entry(&mut self, hostname: &str) -> Result<&mut HostEntry, BoardError> {
        if !self.hosts.contains_key(hostname) {
            if !self.accept_ghosts {
                return Err(BoardError::UnknownHost(hostname.to_string()));
            }
            debug!("auto-registering ghost host {hostname}");
            self.hosts.insert(
                hostname.to_string(),
                HostEntry {
                    config: HostConfig::ghost(hostname),
                    client_os: None,
                    client_data: None,
                    notes: None,
                },
            );
        }
        Ok(self.hosts.get_mut(hostname).unwrap())
    }

    /// Apply one status report.
    ///
    /// Returns a [`Transition`] only when the color actually changed. A
    /// record that has never reported counts as `Clear` (no data), so the
    /// very first report of a `clear` status is not a transition either.
    pub fn update(
        &mut self,
        report: &StatusReport,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>, BoardError> {
        let entry = self.host_entry(&report.host)?;
        let host_validity = entry.config.validity_minutes;
        let propagate = !entry.config.nopropagate.contains(&report.test);

        let validity_minutes = report
            .lifetime_minutes
            .or(host_validity)
            .map(|m| Duration::minutes(m as i64))
            .unwrap_or(self.default_validity);

        let key = (report.host.clone(), report.test.clone());
        let record = self.records.entry(key).or_insert_with(|| TestRecord {
            color: Color::Clear,
            prev_color: Color::Clear,
            last_update: now,
            last_change: now,
            valid_until: now + validity_minutes,
            text: String::new(),
            ack: None,
            propagate,
        });

        // An expired ack no longer suppresses anything
        if record.ack.as_ref().is_some_and(|ack| ack.until <= now) {
            trace!("{}.{}: ack expired", report.host, report.test);
            record.ack = None;
        }

        let old_color = record.color;
        record.last_update = now;
        record.valid_until = now + validity_minutes;
        record.text = report.text.clone();
        record.propagate = propagate;

        if report.color == old_color {
            return Ok(None);
        }

        record.prev_color = old_color;
        record.color = report.color;
        record.last_change = now;

        // Recovery clears the ack along with the problem
        if report.color < Color::Yellow {
            record.ack = None;
        }

        debug!(
            "{}.{}: {} -> {}",
            report.host, report.test, old_color, report.color
        );

        Ok(Some(Transition {
            host: report.host.clone(),
            test: report.test.clone(),
            old_color,
            new_color: report.color,
            timestamp: now,
            text: report.text.clone(),
        }))
    }

    /// Force purple on every record whose validity deadline has passed.
    ///
    /// Runs on a fixed tick rather than per-record timers; a record that is
    /// already purple stays untouched, so repeated sweeps are idempotent.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<Transition> {
        let mut transitions = Vec::new();

        for ((host, test), record) in self.records.iter_mut() {
            if record.color == Color::Purple || record.valid_until > now {
                continue;
            }

            record.prev_color = record.color;
            record.color = Color::Purple;
            record.last_change = now;

            debug!("{host}.{test}: went stale, forcing purple");

            transitions.push(Transition {
                host: host.clone(),
                test: test.clone(),
                old_color: record.prev_color,
                new_color: Color::Purple,
                timestamp: now,
                text: record.text.clone(),
            });
        }

        transitions
    }

    /// Mark a record acknowledged. Does not change its color.
    pub fn acknowledge(
        &mut self,
        host: &str,
        test: &str,
        until: DateTime<Utc>,
        message: &str,
        author: &str,
    ) -> Result<(), BoardError> {
        let key = (host.to_string(), test.to_string());
        let record = self.records.get_mut(&key).ok_or(BoardError::UnknownTest {
            host: host.to_string(),
            test: test.to_string(),
        })?;

        record.ack = Some(Acknowledgement {
            until,
            message: message.to_string(),
            author: author.to_string(),
        });
        Ok(())
    }

    pub fn drop_host(&mut self, host: &str) -> bool {
        let existed = self.hosts.remove(host).is_some();
        self.records.retain(|(h, _), _| h != host);
        existed
    }

    pub fn drop_test(&mut self, host: &str, test: &str) -> bool {
        self.records
            .remove(&(host.to_string(), test.to_string()))
            .is_some()
    }

    /// Rename a host, keeping its records and configuration.
    pub fn rename_host(&mut self, old: &str, new: &str) -> Result<(), BoardError> {
        if self.hosts.contains_key(new) {
            return Err(BoardError::HostExists(new.to_string()));
        }
        let mut entry = self
            .hosts
            .remove(old)
            .ok_or_else(|| BoardError::UnknownHost(old.to_string()))?;
        entry.config.hostname = new.to_string();
        self.hosts.insert(new.to_string(), entry);

        let moved: Vec<_> = self
            .records
            .keys()
            .filter(|(h, _)| h == old)
            .cloned()
            .collect();
        for key in moved {
            if let Some(record) = self.records.remove(&key) {
                self.records.insert((new.to_string(), key.1), record);
            }
        }
        Ok(())
    }

    /// Store the latest raw OS-collector payload for a host.
    pub fn set_client_data(
        &mut self,
        host: &str,
        os: &str,
        payload: &str,
    ) -> Result<(), BoardError> {
        let entry = self.host_entry(host)?;
        entry.client_os = Some(os.to_string());
        entry.client_data = Some(payload.to_string());
        Ok(())
    }

    pub fn client_data(&self, host: &str) -> Option<(&str, &str)> {
        let entry = self.hosts.get(host)?;
        match (&entry.client_os, &entry.client_data) {
            (Some(os), Some(data)) => Some((os.as_str(), data.as_str())),
            _ => None,
        }
    }

    pub fn set_notes(&mut self, host: &str, text: &str) -> Result<(), BoardError> {
        let entry = self
            .hosts
            .get_mut(host)
            .ok_or_else(|| BoardError::UnknownHost(host.to_string()))?;
        entry.notes = Some(text.to_string());
        Ok(())
    }

    pub fn notes(&self, host: &str) -> Option<&str> {
        self.hosts.get(host)?.notes.as_deref()
    }

    pub fn get(&self, host: &str, test: &str) -> Option<&TestRecord> {
        self.records.get(&(host.to_string(), test.to_string()))
    }

    pub fn host_config(&self, host: &str) -> Option<&HostConfig> {
        self.hosts.get(host).map(|entry| &entry.config)
    }

    /// Worst color among a host's propagating tests. A host with no
    /// records reports `Clear`.
    pub fn host_color(&self, host: &str) -> Color {
        self.records
            .iter()
            .filter(|((h, _), record)| h == host && record.propagate)
            .map(|(_, record)| record.color)
            .max()
            .unwrap_or(Color::Clear)
    }

    /// Worst color across all hosts that are members of a page.
    pub fn page_color(&self, page: &str) -> Color {
        self.hosts
            .iter()
            .filter(|(_, entry)| entry.config.pages.iter().any(|p| p == page))
            .map(|(name, _)| self.host_color(name))
            .max()
            .unwrap_or(Color::Clear)
    }

    /// Owned, read-only view for report generators. Rows are sorted by
    /// (host, test) for stable output.
    pub fn snapshot(&self, now: DateTime<Utc>) -> BoardSnapshot {
        let mut rows: Vec<SnapshotRow> = self
            .records
            .iter()
            .map(|((host, test), record)| SnapshotRow {
                host: host.clone(),
                test: test.clone(),
                color: record.color,
                prev_color: record.prev_color,
                last_change: record.last_change,
                last_update: record.last_update,
                acked: record.ack.as_ref().is_some_and(|ack| ack.until > now),
                text: record.text.clone(),
            })
            .collect();
        rows.sort_by(|a, b| (&a.host, &a.test).cmp(&(&b.host, &b.test)));

        BoardSnapshot {
            generated_at: now,
            rows,
        }
    }
}
