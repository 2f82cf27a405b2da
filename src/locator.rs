//! The locator: a directory assigning each (host, service-type) pair to
//! exactly one backend server.
//!
//! Servers register per service type with a weight and a stickiness
//! policy. New hosts are spread over the registered servers by a weighted
//! round-robin token scheme; once assigned, a host keeps its server until
//! an explicit reassignment or - for roaming registrations - a failover.
//! Sticky hosts wait for their server to come back instead of silently
//! moving, which would split host-scoped state across two backends.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use tracing::{debug, warn};

/// The monitoring sub-services a backend can own a host for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// Status ingestion and client-data storage routing
    Client,
    Alert,
    History,
    Hostdata,
    /// Time-series graphing
    Graph,
}

impl ServiceType {
    pub const ALL: [ServiceType; 5] = [
        ServiceType::Client,
        ServiceType::Alert,
        ServiceType::History,
        ServiceType::Hostdata,
        ServiceType::Graph,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Client => "client",
            ServiceType::Alert => "alert",
            ServiceType::History => "history",
            ServiceType::Hostdata => "hostdata",
            ServiceType::Graph => "graph",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(ServiceType::Client),
            "alert" => Ok(ServiceType::Alert),
            "history" => Ok(ServiceType::History),
            "hostdata" => Ok(ServiceType::Hostdata),
            "graph" => Ok(ServiceType::Graph),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stickiness {
    Sticky,
    #[default]
    Roaming,
}

#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,

    /// Weight from the registration; restored on `server_up`
    pub conf_weight: u32,

    /// Current weight; 0 means the server is down
    pub actual_weight: u32,

    pub sticky: Stickiness,

    tokens_left: u32,
}

impl ServerInfo {
    pub fn is_up(&self) -> bool {
        self.actual_weight > 0
    }

    /// Whether this server accepts hosts it has not been assigned yet.
    /// Weight 1 means "up, but serves only what it already owns".
    fn takes_new_hosts(&self) -> bool {
        self.actual_weight >= 2
    }
}

/// Result of a pure [`Locator::query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    Assigned(String),
    /// Assigned, but the owning server is down
    Unavailable,
    Unassigned,
}

/// Result of an [`Locator::assign`]: was the pair already pinned, or did
/// the round-robin just pick a server for it?
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignOutcome {
    Pinned(String),
    Fresh(String),
}

impl AssignOutcome {
    pub fn server(&self) -> &str {
        match self {
            AssignOutcome::Pinned(s) | AssignOutcome::Fresh(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocatorError {
    /// No registered server can take the host
    NoServer,
    /// The pair is pinned to a server that is down
    Unavailable,
    UnknownServer(String),
    UnknownHost(String),
    HostExists(String),
    BadCheckpoint(String),
}

impl fmt::Display for LocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocatorError::NoServer => write!(f, "no server available"),
            LocatorError::Unavailable => write!(f, "assigned server is down"),
            LocatorError::UnknownServer(name) => write!(f, "unknown server '{name}'"),
            LocatorError::UnknownHost(name) => write!(f, "unknown host '{name}'"),
            LocatorError::HostExists(name) => write!(f, "host '{name}' already exists"),
            LocatorError::BadCheckpoint(line) => write!(f, "bad checkpoint line '{line}'"),
        }
    }
}

impl std::error::Error for LocatorError {}

/// Deployment mode: a fixed single backend, or a real directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocatorMode {
    SingleServer(String),
    Distributed,
}

#[derive(Debug)]
pub struct Locator {
    mode: LocatorMode,

    /// Per service type: server name -> registration
    servers: HashMap<ServiceType, BTreeMap<String, ServerInfo>>,

    /// Per service type: host -> assigned server (None = unassigned sentinel)
    assignments: HashMap<ServiceType, BTreeMap<String, Option<String>>>,

    /// Round-robin cursor: last server name used per service type
    cursor: HashMap<ServiceType, String>,
}

impl Locator {
    pub fn new(mode: LocatorMode) -> Self {
        Locator {
            mode,
            servers: HashMap::new(),
            assignments: HashMap::new(),
            cursor: HashMap::new(),
        }
    }

    /// Announce that `server` can handle `service`. Idempotent: a repeated
    /// registration refreshes weight and stickiness in place.
    pub fn register(&mut self, server: &str, service: ServiceType, weight: u32, sticky: Stickiness) {
        let entry = self
            .servers
            .entry(service)
            .or_default()
            .entry(server.to_string())
            .or_insert_with(|| ServerInfo {
                name: server.to_string(),
                conf_weight: weight,
                actual_weight: weight,
                sticky,
                tokens_left: 0,
            });

        entry.conf_weight = weight;
        entry.actual_weight = weight;
        entry.sticky = sticky;
        entry.tokens_left = 0;

        debug!("registered server {server} for {service} (weight {weight}, {sticky:?})");
    }

    /// Mark a server down. Hosts pinned to it by a roaming registration
    /// become unassigned and get a new server on their next `assign`;
    /// sticky hosts stay pinned and wait.
    pub fn server_down(&mut self, server: &str, service: ServiceType) -> Result<(), LocatorError> {
        let info = self
            .servers
            .get_mut(&service)
            .and_then(|m| m.get_mut(server))
            .ok_or_else(|| LocatorError::UnknownServer(server.to_string()))?;

        info.actual_weight = 0;
        info.tokens_left = 0;
        let roaming = info.sticky == Stickiness::Roaming;

        if roaming {
            if let Some(assignments) = self.assignments.get_mut(&service) {
                for (host, assigned) in assignments.iter_mut() {
                    if assigned.as_deref() == Some(server) {
                        debug!("{host}/{service}: unassigned from downed server {server}");
                        *assigned = None;
                    }
                }
            }
        }

        warn!("server {server} marked down for {service}");
        Ok(())
    }

    pub fn server_up(&mut self, server: &str, service: ServiceType) -> Result<(), LocatorError> {
        let info = self
            .servers
            .get_mut(&service)
            .and_then(|m| m.get_mut(server))
            .ok_or_else(|| LocatorError::UnknownServer(server.to_string()))?;

        info.actual_weight = info.conf_weight;
        debug!("server {server} back up for {service} (weight {})", info.conf_weight);
        Ok(())
    }

    /// Resolve which server handles `(host, service)`, assigning one if
    /// the pair has no (live) assignment yet.
    pub fn assign(
        &mut self,
        host: &str,
        service: ServiceType,
    ) -> Result<AssignOutcome, LocatorError> {
        if let LocatorMode::SingleServer(server) = &self.mode {
            return Ok(AssignOutcome::Pinned(server.clone()));
        }

        if let Some(Some(server)) = self.assignments.get(&service).and_then(|m| m.get(host)) {
            let server = server.clone();
            let info = self.servers.get(&service).and_then(|m| m.get(&server));
            match info {
                Some(info) if info.is_up() => return Ok(AssignOutcome::Pinned(server)),
                Some(info) if info.sticky == Stickiness::Sticky => {
                    return Err(LocatorError::Unavailable);
                }
                // roaming assignment to a dead or vanished server: recompute
                _ => {}
            }
        }

        let server = self.next_server(service).ok_or(LocatorError::NoServer)?;
        self.assignments
            .entry(service)
            .or_default()
            .insert(host.to_string(), Some(server.clone()));

        debug!("{host}/{service}: assigned to {server}");
        Ok(AssignOutcome::Fresh(server))
    }

    /// Weighted round-robin over the servers that take new hosts. Each
    /// round a server gets `weight - 1` tokens, so a weight-3 server
    /// receives twice the new hosts of a weight-2 one.
    fn next_server(&mut self, service: ServiceType) -> Option<String> {
        let servers = self.servers.get_mut(&service)?;

        let names: Vec<String> = servers.keys().cloned().collect();
        if names.is_empty() {
            return None;
        }

        let start = match self.cursor.get(&service) {
            Some(last) => names.iter().position(|n| n > last).unwrap_or(0),
            None => 0,
        };

        // walk once around the ring looking for a server with tokens left
        for offset in 0..names.len() {
            let name = &names[(start + offset) % names.len()];
            let info = servers.get_mut(name).unwrap();
            if info.takes_new_hosts() && info.tokens_left > 0 {
                info.tokens_left -= 1;
                self.cursor.insert(service, name.clone());
                return Some(name.clone());
            }
        }

        // all tokens spent: replenish and start a new round
        let mut total = 0;
        for info in servers.values_mut() {
            if info.takes_new_hosts() {
                info.tokens_left = info.actual_weight - 1;
                total += info.tokens_left;
            } else {
                info.tokens_left = 0;
            }
        }
        if total == 0 {
            return None;
        }

        for name in &names {
            let info = servers.get_mut(name).unwrap();
            if info.tokens_left > 0 {
                info.tokens_left -= 1;
                self.cursor.insert(service, name.clone());
                return Some(name.clone());
            }
        }
        None
    }

    /// Pure lookup; never assigns, never touches round-robin state.
    pub fn query(&self, host: &str, service: ServiceType) -> QueryResult {
        if let LocatorMode::SingleServer(server) = &self.mode {
            return QueryResult::Assigned(server.clone());
        }

        match self.assignments.get(&service).and_then(|m| m.get(host)) {
            Some(Some(server)) => {
                let up = self
                    .servers
                    .get(&service)
                    .and_then(|m| m.get(server))
                    .is_some_and(|info| info.is_up());
                if up {
                    QueryResult::Assigned(server.clone())
                } else {
                    QueryResult::Unavailable
                }
            }
            _ => QueryResult::Unassigned,
        }
    }

    /// Rename a host, preserving its assignment (identity continuity).
    pub fn rename_host(
        &mut self,
        service: ServiceType,
        old: &str,
        new: &str,
    ) -> Result<(), LocatorError> {
        let assignments = self
            .assignments
            .get_mut(&service)
            .ok_or_else(|| LocatorError::UnknownHost(old.to_string()))?;

        if assignments.contains_key(new) {
            return Err(LocatorError::HostExists(new.to_string()));
        }
        let assigned = assignments
            .remove(old)
            .ok_or_else(|| LocatorError::UnknownHost(old.to_string()))?;
        assignments.insert(new.to_string(), assigned);
        Ok(())
    }

    pub fn servers(&self, service: ServiceType) -> impl Iterator<Item = &ServerInfo> {
        self.servers.get(&service).into_iter().flat_map(|m| m.values())
    }

    /// Serialize server registrations, one `type|name|confweight|actualweight|sticky`
    /// line per server.
    pub fn save_servers(&self) -> String {
        let mut out = String::new();
        for service in ServiceType::ALL {
            for info in self.servers(service) {
                out.push_str(&format!(
                    "{}|{}|{}|{}|{}\n",
                    service,
                    info.name,
                    info.conf_weight,
                    info.actual_weight,
                    if info.sticky == Stickiness::Sticky { 1 } else { 0 },
                ));
            }
        }
        out
    }

    /// Serialize host assignments, one `type|host|server` line per
    /// assigned pair. Unassigned sentinels are not persisted.
    pub fn save_hosts(&self) -> String {
        let mut out = String::new();
        for service in ServiceType::ALL {
            if let Some(assignments) = self.assignments.get(&service) {
                for (host, assigned) in assignments {
                    if let Some(server) = assigned {
                        out.push_str(&format!("{service}|{host}|{server}\n"));
                    }
                }
            }
        }
        out
    }

    pub fn load_servers(&mut self, data: &str) -> Result<(), LocatorError> {
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('|').collect();
            let [service, name, conf, actual, sticky] = fields.as_slice() else {
                return Err(LocatorError::BadCheckpoint(line.to_string()));
            };
            let service = service
                .parse::<ServiceType>()
                .map_err(|_| LocatorError::BadCheckpoint(line.to_string()))?;
            let conf = conf
                .parse::<u32>()
                .map_err(|_| LocatorError::BadCheckpoint(line.to_string()))?;
            let actual = actual
                .parse::<u32>()
                .map_err(|_| LocatorError::BadCheckpoint(line.to_string()))?;
            let sticky = match *sticky {
                "1" => Stickiness::Sticky,
                "0" => Stickiness::Roaming,
                _ => return Err(LocatorError::BadCheckpoint(line.to_string())),
            };

            self.register(name, service, conf, sticky);
            if let Some(info) = self.servers.get_mut(&service).and_then(|m| m.get_mut(*name)) {
                info.actual_weight = actual;
            }
        }
        Ok(())
    }

    pub fn load_hosts(&mut self, data: &str) -> Result<(), LocatorError> {
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('|').collect();
            let [service, host, server] = fields.as_slice() else {
                return Err(LocatorError::BadCheckpoint(line.to_string()));
            };
            let service = service
                .parse::<ServiceType>()
                .map_err(|_| LocatorError::BadCheckpoint(line.to_string()))?;

            // a host may reference a server we have not seen registered;
            // take it on with the minimal "owns only its hosts" weight
            if !self
                .servers
                .get(&service)
                .is_some_and(|m| m.contains_key(*server))
            {
                self.register(server, service, 1, Stickiness::Sticky);
            }

            self.assignments
                .entry(service)
                .or_default()
                .insert(host.to_string(), Some(server.to_string()));
        }
        Ok(())
    }
}
