//! Recipient matching rules.
//!
//! Deciding who gets paged is a pure function of the problem (host, page
//! memberships, test, color, how long it has existed) and the wall clock
//! checked against the host's holiday calendar. No state is mutated here;
//! the alert engine re-evaluates the rules on every escalation step,
//! because rules can be time-of-day dependent and duration-bounded.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use regex::Regex;

use crate::Color;
use crate::config::{AlertsConfig, NotifyTarget, TimeSpecConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RulesError {
    BadPattern { pattern: String, error: String },
    BadTimeSpec(String),
    BadHolidayDate(String),
}

impl fmt::Display for RulesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RulesError::BadPattern { pattern, error } => {
                write!(f, "bad pattern '{pattern}': {error}")
            }
            RulesError::BadTimeSpec(spec) => write!(f, "bad time spec '{spec}'"),
            RulesError::BadHolidayDate(date) => write!(f, "bad holiday date '{date}'"),
        }
    }
}

impl std::error::Error for RulesError {}

/// Holiday calendars from the configuration. A holiday makes the day
/// count as a Sunday for time-window matching.
#[derive(Debug, Clone, Default)]
pub struct Calendars {
    holidays: HashMap<String, HashSet<(u32, u32)>>,
}

impl Calendars {
    pub fn from_config(config: &HashMap<String, Vec<String>>) -> Result<Self, RulesError> {
        let mut holidays = HashMap::new();
        for (key, dates) in config {
            let mut days = HashSet::new();
            for date in dates {
                let Some((month, day)) = date.split_once('-') else {
                    return Err(RulesError::BadHolidayDate(date.clone()));
                };
                let (Ok(month), Ok(day)) = (month.parse::<u32>(), day.parse::<u32>()) else {
                    return Err(RulesError::BadHolidayDate(date.clone()));
                };
                if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
                    return Err(RulesError::BadHolidayDate(date.clone()));
                }
                days.insert((month, day));
            }
            holidays.insert(key.clone(), days);
        }
        Ok(Calendars { holidays })
    }

    pub fn is_holiday(&self, calendar: Option<&str>, when: DateTime<Utc>) -> bool {
        let Some(key) = calendar else {
            return false;
        };
        self.holidays
            .get(key)
            .is_some_and(|days| days.contains(&(when.month(), when.day())))
    }
}

/// Day-set plus minute range, e.g. "mon-fri 08:00-18:00".
#[derive(Debug, Clone)]
pub struct TimeWindow {
    days: u8,
    start_minute: u32,
    end_minute: u32,
}

const DAY_NAMES: [(&str, Weekday); 7] = [
    ("mon", Weekday::Mon),
    ("tue", Weekday::Tue),
    ("wed", Weekday::Wed),
    ("thu", Weekday::Thu),
    ("fri", Weekday::Fri),
    ("sat", Weekday::Sat),
    ("sun", Weekday::Sun),
];

fn day_bit(day: Weekday) -> u8 {
    1 << day.num_days_from_monday()
}

fn parse_day(word: &str) -> Result<Weekday, RulesError> {
    DAY_NAMES
        .iter()
        .find(|(name, _)| *name == word)
        .map(|(_, day)| *day)
        .ok_or_else(|| RulesError::BadTimeSpec(word.to_string()))
}

fn parse_minute(word: &str) -> Result<u32, RulesError> {
    let Some((hours, minutes)) = word.split_once(':') else {
        return Err(RulesError::BadTimeSpec(word.to_string()));
    };
    let (Ok(hours), Ok(minutes)) = (hours.parse::<u32>(), minutes.parse::<u32>()) else {
        return Err(RulesError::BadTimeSpec(word.to_string()));
    };
    if hours > 23 || minutes > 59 {
        return Err(RulesError::BadTimeSpec(word.to_string()));
    }
    Ok(hours * 60 + minutes)
}

impl TimeWindow {
    pub fn parse(spec: &TimeSpecConfig) -> Result<Self, RulesError> {
        let mut days = 0u8;
        match &spec.days {
            None => days = 0x7f,
            Some(dayspec) => {
                for part in dayspec.split(',') {
                    let part = part.trim();
                    if let Some((from, to)) = part.split_once('-') {
                        let from = parse_day(from)?.num_days_from_monday();
                        let to = parse_day(to)?.num_days_from_monday();
                        if from > to {
                            return Err(RulesError::BadTimeSpec(part.to_string()));
                        }
                        for d in from..=to {
                            days |= 1 << d;
                        }
                    } else {
                        days |= day_bit(parse_day(part)?);
                    }
                }
            }
        }

        let (start_minute, end_minute) = match &spec.hours {
            None => (0, 24 * 60 - 1),
            Some(hourspec) => {
                let Some((start, end)) = hourspec.split_once('-') else {
                    return Err(RulesError::BadTimeSpec(hourspec.clone()));
                };
                let start = parse_minute(start.trim())?;
                let end = parse_minute(end.trim())?;
                if start > end {
                    return Err(RulesError::BadTimeSpec(hourspec.clone()));
                }
                (start, end)
            }
        };

        Ok(TimeWindow {
            days,
            start_minute,
            end_minute,
        })
    }

    pub fn contains(&self, when: DateTime<Utc>, holiday: bool) -> bool {
        let weekday = if holiday { Weekday::Sun } else { when.weekday() };
        if self.days & day_bit(weekday) == 0 {
            return false;
        }
        let minute = when.hour() * 60 + when.minute();
        (self.start_minute..=self.end_minute).contains(&minute)
    }
}

/// One recipient with its repeat interval.
#[derive(Debug, Clone, PartialEq)]
pub struct Recipient {
    pub target: NotifyTarget,
    pub interval: Duration,
}

impl Recipient {
    pub fn address(&self) -> &str {
        self.target.address()
    }
}

#[derive(Debug)]
struct CompiledRule {
    hosts: Option<Regex>,
    pages: Option<Regex>,
    tests: Option<Regex>,
    colors: Option<Vec<Color>>,
    window: Option<TimeWindow>,
    min_duration: Option<Duration>,
    max_duration: Option<Duration>,
    recipients: Vec<Recipient>,
}

/// Everything known about the problem when the rules are evaluated.
#[derive(Debug, Clone)]
pub struct AlertContext<'a> {
    pub host: &'a str,
    pub pages: &'a [String],
    pub test: &'a str,
    pub color: Color,

    /// How long the problem has existed
    pub duration: Duration,

    pub now: DateTime<Utc>,
    pub calendar: Option<&'a str>,
}

#[derive(Debug, Default)]
pub struct CompiledRules {
    rules: Vec<CompiledRule>,
}

fn compile_pattern(pattern: &Option<String>) -> Result<Option<Regex>, RulesError> {
    let Some(pattern) = pattern else {
        return Ok(None);
    };
    Regex::new(&format!("^(?:{pattern})$")).map(Some).map_err(|e| {
        RulesError::BadPattern {
            pattern: pattern.clone(),
            error: e.to_string(),
        }
    })
}

impl CompiledRules {
    pub fn compile(config: &AlertsConfig) -> Result<Self, RulesError> {
        let mut rules = Vec::with_capacity(config.rules.len());
        for rule in &config.rules {
            let window = rule.time.as_ref().map(TimeWindow::parse).transpose()?;
            rules.push(CompiledRule {
                hosts: compile_pattern(&rule.hosts)?,
                pages: compile_pattern(&rule.pages)?,
                tests: compile_pattern(&rule.tests)?,
                colors: rule.colors.clone(),
                window,
                min_duration: rule
                    .min_duration_minutes
                    .map(|m| Duration::minutes(m as i64)),
                max_duration: rule
                    .max_duration_minutes
                    .map(|m| Duration::minutes(m as i64)),
                recipients: rule
                    .recipients
                    .iter()
                    .map(|r| Recipient {
                        target: r.target.clone(),
                        interval: Duration::minutes(r.interval_minutes as i64),
                    })
                    .collect(),
            });
        }
        Ok(CompiledRules { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// All recipients whose rules match the problem right now.
    pub fn recipients<'a>(
        &'a self,
        ctx: &AlertContext<'_>,
        calendars: &Calendars,
    ) -> Vec<&'a Recipient> {
        let holiday = calendars.is_holiday(ctx.calendar, ctx.now);
        let mut matched = Vec::new();

        for rule in &self.rules {
            if let Some(hosts) = &rule.hosts {
                if !hosts.is_match(ctx.host) {
                    continue;
                }
            }
            if let Some(pages) = &rule.pages {
                if !ctx.pages.iter().any(|p| pages.is_match(p)) {
                    continue;
                }
            }
            if let Some(tests) = &rule.tests {
                if !tests.is_match(ctx.test) {
                    continue;
                }
            }
            if let Some(colors) = &rule.colors {
                if !colors.contains(&ctx.color) {
                    continue;
                }
            }
            if let Some(min) = rule.min_duration {
                if ctx.duration < min {
                    continue;
                }
            }
            if let Some(max) = rule.max_duration {
                if ctx.duration > max {
                    continue;
                }
            }
            if let Some(window) = &rule.window {
                if !window.contains(ctx.now, holiday) {
                    continue;
                }
            }

            matched.extend(rule.recipients.iter());
        }

        matched
    }
}
