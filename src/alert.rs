//! The alert escalation engine.
//!
//! One [`ActiveAlert`] exists per (host, test) problem. The engine is a
//! plain synchronous structure: every method takes an explicit `now`, and
//! instead of sending anything itself it returns the [`Notification`]s
//! that are due, so the owning actor dispatches them and tests drive the
//! state machine deterministically.
//!
//! ## State machine
//!
//! ```text
//! transition into an alert color, recipients match    -> Paging (page now)
//! transition into an alert color, nobody matches      -> NoRecip
//! Paging  x next-alert expiry  -> Notify -> remind -> Paging
//! Paging/NoRecip x acknowledge -> Acked (suppressed until expiry)
//! Acked   x ack expiry         -> Paging, resuming at the current step
//! any     x recovery           -> Recovered -> one "all clear" -> Dead
//! ```
//!
//! `Dead` alerts are evicted. A later problem on the same pair gets a
//! fresh cookie, so a flapping test produces distinguishable alert
//! instances instead of silently resuming an old schedule.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, trace};

use crate::board::Transition;
use crate::config::HostConfig;
use crate::notify::{Notification, NotificationKind};
use crate::rules::{AlertContext, Calendars, CompiledRules};
use crate::{AlertColors, Color};

/// How soon to re-evaluate recipients when none are currently due or
/// matching (rules rotate with the clock, so "nobody right now" is not
/// "nobody ever").
const REEVAL_MINUTES: i64 = 1;

fn reeval_interval() -> Duration {
    Duration::minutes(REEVAL_MINUTES)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertState {
    Paging,
    NoRecip,
    Acked,
    Recovered,
    Notify,
    Dead,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Paging => "paging",
            AlertState::NoRecip => "norecip",
            AlertState::Acked => "acked",
            AlertState::Recovered => "recovered",
            AlertState::Notify => "notify",
            AlertState::Dead => "dead",
        }
    }

    fn parse(word: &str) -> Option<Self> {
        match word {
            "paging" => Some(AlertState::Paging),
            "norecip" => Some(AlertState::NoRecip),
            "acked" => Some(AlertState::Acked),
            "recovered" => Some(AlertState::Recovered),
            "notify" => Some(AlertState::Notify),
            "dead" => Some(AlertState::Dead),
            _ => None,
        }
    }
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveAlert {
    pub host: String,
    pub test: String,
    pub color: Color,
    pub state: AlertState,

    /// Generation counter distinguishing successive alert instances
    pub cookie: u64,

    pub event_start: DateTime<Utc>,
    pub next_alert: DateTime<Utc>,

    /// Latest status text, carried into notifications
    pub message: String,

    pub ack_until: Option<DateTime<Utc>>,
}

/// Host attributes the recipient rules need.
#[derive(Debug, Clone, Default)]
pub struct HostMeta {
    pub pages: Vec<String>,
    pub calendar: Option<String>,
}

impl HostMeta {
    pub fn from_config(config: &HostConfig) -> Self {
        HostMeta {
            pages: config.pages.clone(),
            calendar: config.calendar.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadStateLine(pub String);

impl fmt::Display for BadStateLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bad alert state line '{}'", self.0)
    }
}

impl std::error::Error for BadStateLine {}

struct PageResult {
    notifications: Vec<Notification>,
    /// Recipients whose rules matched, whether or not they were due
    matched: usize,
    /// Earliest upcoming repeat among the matched recipients
    next_alert: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct AlertEngine {
    alerts: HashMap<(String, String), ActiveAlert>,

    /// Per-recipient repeat schedule, keyed `host|test|address`. Survives
    /// the `Acked` interlude, which is what makes escalation resume at
    /// the current step instead of restarting.
    repeats: HashMap<String, DateTime<Utc>>,

    next_cookie: u64,
    rules: CompiledRules,
    calendars: Calendars,
    hosts: HashMap<String, HostMeta>,
    alert_colors: AlertColors,
    notify_recovered: bool,
}

fn repeat_key(host: &str, test: &str, address: &str) -> String {
    format!("{host}|{test}|{address}")
}

impl AlertEngine {
    pub fn new(
        rules: CompiledRules,
        calendars: Calendars,
        hosts: HashMap<String, HostMeta>,
        alert_colors: AlertColors,
        notify_recovered: bool,
    ) -> Self {
        AlertEngine {
            alerts: HashMap::new(),
            repeats: HashMap::new(),
            next_cookie: 1,
            rules,
            calendars,
            hosts,
            alert_colors,
            notify_recovered,
        }
    }

    pub fn get(&self, host: &str, test: &str) -> Option<&ActiveAlert> {
        self.alerts.get(&(host.to_string(), test.to_string()))
    }

    pub fn active(&self) -> impl Iterator<Item = &ActiveAlert> {
        self.alerts.values()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    /// Feed one board transition through the state machine.
    pub fn handle_transition(&mut self, t: &Transition, now: DateTime<Utc>) -> Vec<Notification> {
        let key = (t.host.clone(), t.test.clone());
        let alerting = self.alert_colors.contains(t.new_color);

        match (self.alerts.remove(&key), alerting) {
            (None, false) => Vec::new(),

            (None, true) => {
                let cookie = self.next_cookie;
                self.next_cookie += 1;

                let mut alert = ActiveAlert {
                    host: t.host.clone(),
                    test: t.test.clone(),
                    color: t.new_color,
                    state: AlertState::Paging,
                    cookie,
                    event_start: now,
                    next_alert: now,
                    message: t.text.clone(),
                    ack_until: None,
                };

                let page = self.page(&alert, NotificationKind::Problem, t.new_color, now);
                if page.matched == 0 {
                    debug!("{}.{}: alert-worthy but no recipient matches", t.host, t.test);
                    alert.state = AlertState::NoRecip;
                    alert.next_alert = now + reeval_interval();
                } else {
                    alert.next_alert = page.next_alert.unwrap_or(now + reeval_interval());
                }

                debug!(
                    "{}.{}: new alert, cookie {}, state {}",
                    t.host, t.test, cookie, alert.state
                );
                self.alerts.insert(key, alert);
                page.notifications
            }

            (Some(mut alert), true) => {
                // still a problem, possibly at a different severity; the
                // schedule and the ack state are unaffected
                trace!(
                    "{}.{}: still alerting ({} -> {})",
                    t.host, t.test, alert.color, t.new_color
                );
                alert.color = t.new_color;
                alert.message = t.text.clone();
                self.alerts.insert(key, alert);
                Vec::new()
            }

            (Some(alert), false) => self.finish_recovered(alert, t.new_color, &t.text, now),
        }
    }

    /// Acknowledge an active alert until `until`. Notifications are
    /// suppressed; the repeat schedule is left alone so expiry resumes
    /// the escalation where it stood.
    pub fn acknowledge(&mut self, host: &str, test: &str, until: DateTime<Utc>) {
        let key = (host.to_string(), test.to_string());
        if let Some(alert) = self.alerts.get_mut(&key) {
            match alert.state {
                AlertState::Paging | AlertState::NoRecip | AlertState::Notify => {
                    debug!("{host}.{test}: acknowledged until {until}");
                    alert.state = AlertState::Acked;
                    alert.ack_until = Some(until);
                    alert.next_alert = until;
                }
                _ => {}
            }
        }
    }

    /// Drop the alert for a host/test without a recovery notification
    /// (the record itself was dropped).
    pub fn drop_alert(&mut self, host: &str, test: Option<&str>) {
        let keys: Vec<_> = self
            .alerts
            .keys()
            .filter(|(h, t)| h == host && test.is_none_or(|t2| t2 == t))
            .cloned()
            .collect();
        for key in keys {
            if let Some(alert) = self.alerts.remove(&key) {
                self.cleanup_repeats(&alert);
            }
        }
    }

    pub fn rename_host(&mut self, old: &str, new: &str) {
        let keys: Vec<_> = self
            .alerts
            .keys()
            .filter(|(h, _)| h == old)
            .cloned()
            .collect();
        for key in keys {
            if let Some(mut alert) = self.alerts.remove(&key) {
                let old_prefix = format!("{}|{}|", alert.host, alert.test);
                let new_prefix = format!("{}|{}|", new, alert.test);
                let moved: Vec<_> = self
                    .repeats
                    .keys()
                    .filter(|k| k.starts_with(&old_prefix))
                    .cloned()
                    .collect();
                for k in moved {
                    if let Some(when) = self.repeats.remove(&k) {
                        self.repeats
                            .insert(k.replacen(&old_prefix, &new_prefix, 1), when);
                    }
                }
                alert.host = new.to_string();
                self.alerts.insert((new.to_string(), key.1), alert);
            }
        }
        if let Some(meta) = self.hosts.remove(old) {
            self.hosts.insert(new.to_string(), meta);
        }
    }

    /// Run the escalation timers: ack expiries, due reminders, loaded
    /// recovery notifications. Called on a fixed tick.
    pub fn check_timers(&mut self, now: DateTime<Utc>) -> Vec<Notification> {
        let keys: Vec<_> = self.alerts.keys().cloned().collect();
        let mut out = Vec::new();

        for key in keys {
            let Some(mut alert) = self.alerts.remove(&key) else {
                continue;
            };

            if alert.state == AlertState::Acked
                && alert.ack_until.is_some_and(|until| until <= now)
            {
                debug!(
                    "{}.{}: ack expired, escalation resumes",
                    alert.host, alert.test
                );
                alert.state = AlertState::Paging;
                alert.ack_until = None;
                alert.next_alert = now;
            }

            match alert.state {
                AlertState::NoRecip if alert.next_alert <= now => {
                    let page = self.page(&alert, NotificationKind::Problem, alert.color, now);
                    if page.matched > 0 {
                        debug!("{}.{}: recipients match now, paging", alert.host, alert.test);
                        alert.state = AlertState::Paging;
                        alert.next_alert = page.next_alert.unwrap_or(now + reeval_interval());
                        out.extend(page.notifications);
                    } else {
                        alert.next_alert = now + reeval_interval();
                    }
                    self.alerts.insert(key, alert);
                }

                AlertState::Paging | AlertState::Notify if alert.next_alert <= now => {
                    alert.state = AlertState::Notify;
                    let page = self.page(&alert, NotificationKind::Reminder, alert.color, now);
                    out.extend(page.notifications);
                    alert.next_alert = page.next_alert.unwrap_or(now + reeval_interval());
                    alert.state = AlertState::Paging;
                    self.alerts.insert(key, alert);
                }

                // only reachable through a reloaded checkpoint
                AlertState::Recovered => {
                    let message = alert.message.clone();
                    out.extend(self.finish_recovered(alert, Color::Green, &message, now));
                }

                AlertState::Dead => {
                    self.cleanup_repeats(&alert);
                }

                _ => {
                    self.alerts.insert(key, alert);
                }
            }
        }

        out
    }

    /// A problem went back to a non-alert color: send the single recovery
    /// notification (when due at all) and retire the alert.
    fn finish_recovered(
        &mut self,
        mut alert: ActiveAlert,
        new_color: Color,
        text: &str,
        now: DateTime<Utc>,
    ) -> Vec<Notification> {
        // recovery messages only go to recipients that were actually
        // paged; an alert that never left NoRecip dies quietly
        let was_paged = self.has_repeats(&alert);

        let notifications = if self.notify_recovered && was_paged {
            alert.state = AlertState::Recovered;
            alert.message = text.to_string();
            let page = self.page(&alert, NotificationKind::Recovery, new_color, now);
            page.notifications
        } else {
            Vec::new()
        };

        debug!(
            "{}.{}: recovered after {}s, cookie {} retired",
            alert.host,
            alert.test,
            (now - alert.event_start).num_seconds(),
            alert.cookie
        );

        alert.state = AlertState::Dead;
        self.cleanup_repeats(&alert);
        notifications
    }

    /// Evaluate the rules for this alert and emit whatever is due.
    ///
    /// `Problem`/`Reminder` pages update the per-recipient repeat clock;
    /// `Recovery` only reaches recipients with an existing repeat record
    /// and leaves the clock alone (cleanup follows immediately).
    fn page(
        &mut self,
        alert: &ActiveAlert,
        kind: NotificationKind,
        color: Color,
        now: DateTime<Utc>,
    ) -> PageResult {
        let meta = self.hosts.get(&alert.host).cloned().unwrap_or_default();
        let ctx = AlertContext {
            host: &alert.host,
            pages: &meta.pages,
            test: &alert.test,
            color: alert.color,
            duration: now - alert.event_start,
            now,
            calendar: meta.calendar.as_deref(),
        };

        let recipients = self.rules.recipients(&ctx, &self.calendars);

        let mut notifications = Vec::new();
        let mut matched = 0usize;
        let mut next_alert: Option<DateTime<Utc>> = None;
        let mut seen: HashSet<&str> = HashSet::new();

        for recipient in recipients {
            let address = recipient.address();
            if !seen.insert(address) {
                continue;
            }
            matched += 1;

            let key = repeat_key(&alert.host, &alert.test, address);

            if kind == NotificationKind::Recovery {
                if self.repeats.contains_key(&key) {
                    notifications.push(Notification {
                        host: alert.host.clone(),
                        test: alert.test.clone(),
                        color,
                        cookie: alert.cookie,
                        kind,
                        message: alert.message.clone(),
                        target: recipient.target.clone(),
                    });
                }
                continue;
            }

            let due = self.repeats.get(&key).is_none_or(|when| *when <= now);
            if due {
                notifications.push(Notification {
                    host: alert.host.clone(),
                    test: alert.test.clone(),
                    color,
                    cookie: alert.cookie,
                    kind,
                    message: alert.message.clone(),
                    target: recipient.target.clone(),
                });
                self.repeats.insert(key.clone(), now + recipient.interval);
            }

            let upcoming = self.repeats[&key];
            next_alert = Some(match next_alert {
                Some(current) => current.min(upcoming),
                None => upcoming,
            });
        }

        PageResult {
            notifications,
            matched,
            next_alert,
        }
    }

    fn has_repeats(&self, alert: &ActiveAlert) -> bool {
        let prefix = format!("{}|{}|", alert.host, alert.test);
        self.repeats.keys().any(|k| k.starts_with(&prefix))
    }

    fn cleanup_repeats(&mut self, alert: &ActiveAlert) {
        let prefix = format!("{}|{}|", alert.host, alert.test);
        self.repeats.retain(|k, _| !k.starts_with(&prefix));
    }

    /// Serialize all active alerts and repeat records. `A` lines carry the
    /// alert, `R` lines the per-recipient repeat clock; both round-trip
    /// exactly through [`AlertEngine::load`].
    pub fn save(&self) -> String {
        let mut alerts: Vec<_> = self.alerts.values().collect();
        alerts.sort_by(|a, b| (&a.host, &a.test).cmp(&(&b.host, &b.test)));

        let mut out = String::new();
        for alert in alerts {
            let ack = match alert.ack_until {
                Some(until) => until.timestamp().to_string(),
                None => "-".to_string(),
            };
            out.push_str(&format!(
                "A|{}|{}|{}|{}|{}|{}|{}|{}|{}\n",
                alert.host,
                alert.test,
                alert.state,
                alert.cookie,
                alert.event_start.timestamp(),
                alert.next_alert.timestamp(),
                alert.color,
                ack,
                alert.message.replace('\n', " "),
            ));
        }

        let mut repeats: Vec<_> = self.repeats.iter().collect();
        repeats.sort();
        for (key, when) in repeats {
            out.push_str(&format!("R|{}|{key}\n", when.timestamp()));
        }

        out
    }

    /// Restore alerts from a checkpoint. Times are kept exactly as saved:
    /// an alert whose next-alert time already passed is due on the first
    /// timer check after the restart, never silently skipped.
    pub fn load(&mut self, data: &str) -> Result<(), BadStateLine> {
        for line in data.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }

            if let Some(rest) = line.strip_prefix("A|") {
                let fields: Vec<&str> = rest.splitn(9, '|').collect();
                let [host, test, state, cookie, start, next, color, ack, message] =
                    fields.as_slice()
                else {
                    return Err(BadStateLine(line.to_string()));
                };

                let state =
                    AlertState::parse(state).ok_or_else(|| BadStateLine(line.to_string()))?;
                let cookie = cookie
                    .parse::<u64>()
                    .map_err(|_| BadStateLine(line.to_string()))?;
                let event_start = parse_timestamp(start).ok_or_else(|| BadStateLine(line.to_string()))?;
                let next_alert = parse_timestamp(next).ok_or_else(|| BadStateLine(line.to_string()))?;
                let color = color
                    .parse::<Color>()
                    .map_err(|_| BadStateLine(line.to_string()))?;
                let ack_until = match *ack {
                    "-" => None,
                    ts => Some(parse_timestamp(ts).ok_or_else(|| BadStateLine(line.to_string()))?),
                };

                self.next_cookie = self.next_cookie.max(cookie + 1);
                self.alerts.insert(
                    (host.to_string(), test.to_string()),
                    ActiveAlert {
                        host: host.to_string(),
                        test: test.to_string(),
                        color,
                        state,
                        cookie,
                        event_start,
                        next_alert,
                        message: message.to_string(),
                        ack_until,
                    },
                );
            } else if let Some(rest) = line.strip_prefix("R|") {
                let Some((ts, key)) = rest.split_once('|') else {
                    return Err(BadStateLine(line.to_string()));
                };
                let when = parse_timestamp(ts).ok_or_else(|| BadStateLine(line.to_string()))?;
                self.repeats.insert(key.to_string(), when);
            } else {
                return Err(BadStateLine(line.to_string()));
            }
        }
        Ok(())
    }
}

fn parse_timestamp(word: &str) -> Option<DateTime<Utc>> {
    word.parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}
