use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use tracing::trace;

use crate::Color;
use crate::locator::{ServiceType, Stickiness};

/// Locator deployment mode.
///
/// `single` pins every assignment to the one configured server and is the
/// default for deployments without horizontal scaling. `distributed` makes
/// the hub register itself with the locator and consult it before applying
/// host-scoped updates.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum LocatorConfig {
    Single {
        /// Identity of the sole backend server
        #[serde(default = "default_server_name")]
        server: String,
    },

    Distributed {
        /// This hub's server identity
        server: String,

        /// Address of an external locator daemon. When absent, the hub
        /// runs the locator in-process.
        locator: Option<std::net::SocketAddr>,

        /// Service registrations announced at startup
        #[serde(default)]
        register: Vec<RegistrationConfig>,
    },
}

impl Default for LocatorConfig {
    fn default() -> Self {
        LocatorConfig::Single {
            server: default_server_name(),
        }
    }
}

fn default_server_name() -> String {
    "local".to_string()
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RegistrationConfig {
    pub service: ServiceType,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default)]
    pub sticky: Stickiness,
}

fn default_weight() -> u32 {
    2
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listener: ListenerConfig,

    pub hosts: Option<Vec<HostConfig>>,

    /// Accept status reports for hosts missing from the configuration
    /// ("ghost" reports) by auto-registering them.
    #[serde(default)]
    pub accept_ghosts: bool,

    /// Minutes a status stays valid before the sweep turns it purple,
    /// unless the report carries its own lifetime.
    #[serde(default = "default_validity_minutes")]
    pub validity_minutes: u32,

    #[serde(default)]
    pub alerts: AlertsConfig,

    /// Holiday calendars: key -> list of "MM-DD" dates. A holiday makes
    /// the day count as a Sunday for alert time windows.
    #[serde(default)]
    pub calendars: HashMap<String, Vec<String>>,

    #[serde(default)]
    pub locator: LocatorConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds a connection may idle before it is dropped
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            bind: default_bind(),
            port: default_port(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    1984
}

fn default_read_timeout() -> u64 {
    10
}

fn default_validity_minutes() -> u32 {
    30
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct HostConfig {
    pub hostname: String,

    /// Network address of the host, for display and notification payloads
    pub address: Option<String>,

    pub display: Option<String>,

    /// Page/group memberships, used for recipient routing and aggregation
    #[serde(default)]
    pub pages: Vec<String>,

    /// Holiday calendar key for alert time windows
    pub calendar: Option<String>,

    /// Per-host override of the default status validity
    pub validity_minutes: Option<u32>,

    /// Tests whose color must not escalate into the page aggregate
    #[serde(default)]
    pub nopropagate: Vec<String>,
}

impl HostConfig {
    /// Minimal entry for a ghost host accepted at runtime.
    pub fn ghost(hostname: &str) -> Self {
        HostConfig {
            hostname: hostname.to_string(),
            address: None,
            display: None,
            pages: Vec::new(),
            calendar: None,
            validity_minutes: None,
            nopropagate: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AlertsConfig {
    /// Colors that page. Defaults to yellow/red/purple.
    pub colors: Option<Vec<Color>>,

    /// Send the final "all clear" notification when a problem recovers
    #[serde(default = "default_true")]
    pub notify_recovered: bool,

    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        AlertsConfig {
            colors: None,
            notify_recovered: true,
            rules: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// One recipient-matching rule.
///
/// Patterns are anchored regular expressions; an absent pattern matches
/// everything. Duration bounds express escalation steps: a rule with
/// `min_duration_minutes: 60` only starts matching once the problem is an
/// hour old.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RuleConfig {
    pub hosts: Option<String>,
    pub pages: Option<String>,
    pub tests: Option<String>,

    pub colors: Option<Vec<Color>>,

    pub time: Option<TimeSpecConfig>,

    pub min_duration_minutes: Option<u32>,
    pub max_duration_minutes: Option<u32>,

    pub recipients: Vec<RecipientConfig>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RecipientConfig {
    #[serde(flatten)]
    pub target: NotifyTarget,

    /// Minutes between repeated notifications to this recipient
    #[serde(default = "default_repeat_minutes")]
    pub interval_minutes: u32,
}

fn default_repeat_minutes() -> u32 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum NotifyTarget {
    Webhook { url: String },
    Log { name: String },
}

impl NotifyTarget {
    /// Stable identity used to key per-recipient repeat schedules.
    pub fn address(&self) -> &str {
        match self {
            NotifyTarget::Webhook { url } => url,
            NotifyTarget::Log { name } => name,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct TimeSpecConfig {
    /// Day set, e.g. "mon-fri" or "sat,sun". Absent means every day.
    pub days: Option<String>,

    /// Hour range "HH:MM-HH:MM". Absent means the whole day.
    pub hours: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_alerts_path")]
    pub alerts_path: PathBuf,

    #[serde(default = "default_locator_servers_path")]
    pub locator_servers_path: PathBuf,

    #[serde(default = "default_locator_hosts_path")]
    pub locator_hosts_path: PathBuf,

    /// Seconds between background checkpoint snapshots
    #[serde(default = "default_checkpoint_interval")]
    pub interval_secs: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig {
            alerts_path: default_alerts_path(),
            locator_servers_path: default_locator_servers_path(),
            locator_hosts_path: default_locator_hosts_path(),
            interval_secs: default_checkpoint_interval(),
        }
    }
}

fn default_alerts_path() -> PathBuf {
    PathBuf::from("./alerts.chk")
}

fn default_locator_servers_path() -> PathBuf {
    PathBuf::from("./locator.servers.chk")
}

fn default_locator_hosts_path() -> PathBuf {
    PathBuf::from("./locator.hosts.chk")
}

fn default_checkpoint_interval() -> u64 {
    60
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file: {e}"))
        .inspect(|config: &Config| trace!("loaded config: {config:?}"))
}
