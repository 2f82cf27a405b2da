//! Wire protocol parsing.
//!
//! Inbound messages are line-oriented text; the first token selects the
//! message kind. Everything is parsed into a typed [`Message`] up front so
//! the rest of the daemon never touches raw token soup, and anything that
//! does not fit a case is rejected as a parse error.

use std::fmt;

use crate::Color;
use crate::locator::{ServiceType, Stickiness};

/// A fully parsed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Single status report
    Status(StatusReport),

    /// Batch of status reports submitted in one message
    Combo(Vec<StatusReport>),

    /// Raw OS-collector payload, routed to per-OS handlers elsewhere
    Client {
        host: String,
        os: String,
        payload: String,
    },

    /// Acknowledge a problem for a number of minutes
    Ack {
        host: String,
        test: String,
        minutes: u32,
        message: String,
        author: String,
    },

    /// Drop a whole host, or a single test of a host
    Drop { host: String, test: Option<String> },

    /// Attach a free-text note to a host
    Notes { host: String, text: String },

    /// Query the current color and status text of one test
    Query { host: String, test: String },

    /// Dump the whole status board
    Board,

    /// Locator control message
    Locator(LocatorRequest),

    /// Liveness check
    Ping,
}

/// One `status` line, parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub host: String,
    pub test: String,
    pub color: Color,
    pub text: String,

    /// Lifetime override from `status+<minutes>`
    pub lifetime_minutes: Option<u32>,

    /// Group routing tag from `status/group:<g>`
    pub group: Option<String>,
}

/// Locator protocol operations, request side.
#[derive(Debug, Clone, PartialEq)]
pub enum LocatorRequest {
    Register {
        server: String,
        service: ServiceType,
        weight: u32,
        sticky: Stickiness,
    },
    Query {
        service: ServiceType,
        host: String,
    },
    ServerUp {
        server: String,
        service: ServiceType,
    },
    ServerDown {
        server: String,
        service: ServiceType,
    },
    Rename {
        service: ServiceType,
        old: String,
        new: String,
    },
    Ping,
    Save,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    EmptyMessage,
    UnknownKind(String),
    MissingField(&'static str),
    BadHostTest(String),
    BadColor(String),
    BadNumber(String),
    BadServiceType(String),
    BadLocatorRequest(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::EmptyMessage => write!(f, "empty message"),
            ParseError::UnknownKind(kind) => write!(f, "unknown message kind '{kind}'"),
            ParseError::MissingField(field) => write!(f, "missing field: {field}"),
            ParseError::BadHostTest(token) => {
                write!(f, "expected <host>.<test>, got '{token}'")
            }
            ParseError::BadColor(word) => write!(f, "unknown color '{word}'"),
            ParseError::BadNumber(word) => write!(f, "expected a number, got '{word}'"),
            ParseError::BadServiceType(word) => write!(f, "unknown service type '{word}'"),
            ParseError::BadLocatorRequest(msg) => write!(f, "bad locator request: {msg}"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Split `<host>.<test>` at the last dot.
///
/// Dots inside the hostname are transmitted as commas, so the part before
/// the last dot is de-commafied here. Test names never contain dots.
pub fn split_host_test(token: &str) -> Result<(String, String), ParseError> {
    let Some((host, test)) = token.rsplit_once('.') else {
        return Err(ParseError::BadHostTest(token.to_string()));
    };
    if host.is_empty() || test.is_empty() {
        return Err(ParseError::BadHostTest(token.to_string()));
    }
    Ok((host.replace(',', "."), test.to_string()))
}

/// Hostname as it appears on the wire: dots become commas.
pub fn commafy(hostname: &str) -> String {
    hostname.replace('.', ",")
}

fn next_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(i) => Some((&s[..i], &s[i..])),
        None => Some((s, "")),
    }
}

fn take_token<'a>(s: &'a str, field: &'static str) -> Result<(&'a str, &'a str), ParseError> {
    next_token(s).ok_or(ParseError::MissingField(field))
}

/// Parse one whole inbound message (possibly multiple lines).
pub fn parse_message(raw: &str) -> Result<Message, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ParseError::EmptyMessage);
    }

    let (first_line, rest_lines) = match trimmed.split_once('\n') {
        Some((first, rest)) => (first, rest),
        None => (trimmed, ""),
    };

    let (kind, args) = take_token(first_line, "message kind")?;

    if kind == "status" || kind.starts_with("status+") || kind.starts_with("status/") {
        return Ok(Message::Status(parse_status_line(first_line)?));
    }

    match kind {
        "combo" => {
            let mut reports = Vec::new();
            for line in rest_lines.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                reports.push(parse_status_line(line)?);
            }
            if reports.is_empty() {
                return Err(ParseError::MissingField("combo status lines"));
            }
            Ok(Message::Combo(reports))
        }

        "client" => {
            let (token, _) = take_token(args, "host.ostype")?;
            let (host, os) = split_host_test(token)?;
            Ok(Message::Client {
                host,
                os,
                payload: rest_lines.to_string(),
            })
        }

        "ack" => {
            let (token, args) = take_token(args, "host.test")?;
            let (host, test) = split_host_test(token)?;
            let (minutes, args) = take_token(args, "minutes")?;
            let minutes = minutes
                .parse::<u32>()
                .map_err(|_| ParseError::BadNumber(minutes.to_string()))?;
            let (author, args) = take_token(args, "author")?;
            Ok(Message::Ack {
                host,
                test,
                minutes,
                message: args.trim().to_string(),
                author: author.to_string(),
            })
        }

        "drop" => {
            let (token, _) = take_token(args, "host")?;
            match token.rsplit_once('.') {
                Some((host, test)) if !host.is_empty() && !test.is_empty() => Ok(Message::Drop {
                    host: host.replace(',', "."),
                    test: Some(test.to_string()),
                }),
                _ => Ok(Message::Drop {
                    host: token.replace(',', "."),
                    test: None,
                }),
            }
        }

        "notes" => {
            let (host, args) = take_token(args, "host")?;
            Ok(Message::Notes {
                host: host.replace(',', "."),
                text: args.trim().to_string(),
            })
        }

        "query" => {
            let (token, _) = take_token(args, "host.test")?;
            let (host, test) = split_host_test(token)?;
            Ok(Message::Query { host, test })
        }

        "board" => Ok(Message::Board),

        "locator" => parse_locator(args.trim()).map(Message::Locator),

        "ping" => Ok(Message::Ping),

        other => Err(ParseError::UnknownKind(other.to_string())),
    }
}

/// Parse a single `status[+<minutes>][/group:<g>] <host>.<test> <color> <text...>` line.
pub fn parse_status_line(line: &str) -> Result<StatusReport, ParseError> {
    let (kind, args) = take_token(line, "status keyword")?;

    let mut modifier = kind
        .strip_prefix("status")
        .ok_or_else(|| ParseError::UnknownKind(kind.to_string()))?;

    let mut lifetime_minutes = None;
    if let Some(rest) = modifier.strip_prefix('+') {
        let digits_end = rest.find('/').unwrap_or(rest.len());
        let digits = &rest[..digits_end];
        lifetime_minutes = Some(
            digits
                .parse::<u32>()
                .map_err(|_| ParseError::BadNumber(digits.to_string()))?,
        );
        modifier = &rest[digits_end..];
    }

    let mut group = None;
    if let Some(g) = modifier.strip_prefix("/group:") {
        if g.is_empty() {
            return Err(ParseError::MissingField("group name"));
        }
        group = Some(g.to_string());
        modifier = "";
    }

    if !modifier.is_empty() {
        return Err(ParseError::UnknownKind(kind.to_string()));
    }

    let (token, args) = take_token(args, "host.test")?;
    let (host, test) = split_host_test(token)?;

    let (colorword, args) = take_token(args, "color")?;
    let color = colorword
        .parse::<Color>()
        .map_err(|_| ParseError::BadColor(colorword.to_string()))?;

    Ok(StatusReport {
        host,
        test,
        color,
        text: args.trim().to_string(),
        lifetime_minutes,
        group,
    })
}

fn locator_field<'a>(
    fields: &[&'a str],
    index: usize,
    name: &'static str,
) -> Result<&'a str, ParseError> {
    fields
        .get(index)
        .copied()
        .filter(|s| !s.is_empty())
        .ok_or(ParseError::MissingField(name))
}

fn locator_service(word: &str) -> Result<ServiceType, ParseError> {
    word.parse::<ServiceType>()
        .map_err(|_| ParseError::BadServiceType(word.to_string()))
}

/// Parse the pipe-delimited tail of a `locator` message.
fn parse_locator(args: &str) -> Result<LocatorRequest, ParseError> {
    let fields: Vec<&str> = args.split('|').map(str::trim).collect();
    let op = locator_field(&fields, 0, "locator operation")?;

    match op {
        "register" => {
            let server = locator_field(&fields, 1, "server")?.to_string();
            let service = locator_service(locator_field(&fields, 2, "service type")?)?;
            let weight_word = locator_field(&fields, 3, "weight")?;
            let weight = weight_word
                .parse::<u32>()
                .map_err(|_| ParseError::BadNumber(weight_word.to_string()))?;
            let sticky = match locator_field(&fields, 4, "sticky")? {
                "1" => Stickiness::Sticky,
                "0" => Stickiness::Roaming,
                other => return Err(ParseError::BadLocatorRequest(format!("sticky '{other}'"))),
            };
            Ok(LocatorRequest::Register {
                server,
                service,
                weight,
                sticky,
            })
        }

        "query" => {
            let service = locator_service(locator_field(&fields, 1, "service type")?)?;
            let host = locator_field(&fields, 2, "host")?.replace(',', ".");
            Ok(LocatorRequest::Query { service, host })
        }

        "serverup" => {
            let server = locator_field(&fields, 1, "server")?.to_string();
            let service = locator_service(locator_field(&fields, 2, "service type")?)?;
            Ok(LocatorRequest::ServerUp { server, service })
        }

        "serverdown" => {
            let server = locator_field(&fields, 1, "server")?.to_string();
            let service = locator_service(locator_field(&fields, 2, "service type")?)?;
            Ok(LocatorRequest::ServerDown { server, service })
        }

        "rename" => {
            let service = locator_service(locator_field(&fields, 1, "service type")?)?;
            let old = locator_field(&fields, 2, "old hostname")?.replace(',', ".");
            let new = locator_field(&fields, 3, "new hostname")?.replace(',', ".");
            Ok(LocatorRequest::Rename { service, old, new })
        }

        "ping" => Ok(LocatorRequest::Ping),

        "save" => Ok(LocatorRequest::Save),

        other => Err(ParseError::BadLocatorRequest(format!(
            "unknown operation '{other}'"
        ))),
    }
}
