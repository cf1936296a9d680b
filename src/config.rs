//! Steward Configuration
//!
//! This module provides configuration structures for the steward monitor
//! and keeper processes. One file configures one node; the `role` key
//! selects which process behavior `steward run` starts.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which process behavior this configuration drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    Monitor,
    Keeper,
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessRole::Monitor => write!(f, "monitor"),
            ProcessRole::Keeper => write!(f, "keeper"),
        }
    }
}

/// Main steward configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StewardConfig {
    /// Process identity and placement
    pub steward: StewardSection,

    /// Local PostgreSQL instance (keeper role)
    #[serde(default)]
    pub postgres: PostgresConfig,

    /// Streaming replication tunables
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Operation timeouts
    #[serde(default)]
    pub timeout: TimeoutConfig,

    /// TLS posture handed to PostgreSQL
    #[serde(default)]
    pub ssl: SslConfig,

    /// Monitor process settings (monitor role)
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Identity section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StewardSection {
    /// `monitor` or `keeper`
    pub role: ProcessRole,

    /// Monitor address the keeper heartbeats to (host:port)
    #[serde(default)]
    pub monitor: Option<String>,

    /// Formation this node belongs to
    #[serde(default = "default_formation")]
    pub formation: String,

    /// Group within the formation (assigned by the monitor when absent)
    #[serde(default)]
    pub group: Option<i32>,

    /// Node name, unique within the formation
    #[serde(default)]
    pub name: Option<String>,

    /// Hostname peers use to reach this node's PostgreSQL
    #[serde(default)]
    pub hostname: Option<String>,

    /// Node kind; only `standalone` variants are operational
    #[serde(default = "default_nodekind")]
    pub nodekind: String,

    /// Directory for steward's own state files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Local PostgreSQL instance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Data directory of the managed instance
    #[serde(default)]
    pub pgdata: PathBuf,

    /// Host for local connections (socket directory or hostname)
    #[serde(default = "default_pg_host")]
    pub host: String,

    /// Port the managed instance listens on
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Superuser for local control connections
    #[serde(default = "default_pg_user")]
    pub user: String,

    /// Database used for control connections
    #[serde(default = "default_pg_dbname")]
    pub dbname: String,

    /// Directory holding the PostgreSQL binaries (PATH when empty)
    #[serde(default)]
    pub bindir: Option<PathBuf>,

    /// Connection pool size for the SQL surface
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            pgdata: PathBuf::new(),
            host: default_pg_host(),
            port: default_pg_port(),
            user: default_pg_user(),
            dbname: default_pg_dbname(),
            bindir: None,
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Streaming replication tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Replication slot name this node uses on its upstream
    /// (derived from the node id when empty)
    #[serde(default)]
    pub slot: Option<String>,

    /// Password file for the replication user
    #[serde(default)]
    pub password_file: Option<PathBuf>,

    /// Throttle handed to pg_basebackup (--max-rate)
    #[serde(default)]
    pub maximum_backup_rate: Option<String>,

    /// Scratch space for base backups
    #[serde(default = "default_backup_directory")]
    pub backup_directory: PathBuf,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            slot: None,
            password_file: None,
            maximum_backup_rate: None,
            backup_directory: default_backup_directory(),
        }
    }
}

/// Operation timeouts, in seconds unless noted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Keeper tick interval
    #[serde(default = "default_keeper_sleep_time")]
    pub keeper_sleep_time: u64,

    /// Monitor silence before a primary keeper demotes itself
    #[serde(default = "default_network_partition_timeout")]
    pub network_partition_timeout: u64,

    /// Bound on the catch-up wait during prepare-promotion
    #[serde(default = "default_prepare_promotion_catchup")]
    pub prepare_promotion_catchup: u64,

    /// Bound on the WAL receiver drain during prepare-promotion
    #[serde(default = "default_prepare_promotion_walreceiver")]
    pub prepare_promotion_walreceiver: u64,

    /// Window over which restart failures are counted
    #[serde(default = "default_restart_failure_timeout")]
    pub postgresql_restart_failure_timeout: u64,

    /// Restart attempts tolerated inside the window
    #[serde(default = "default_restart_failure_max_retries")]
    pub postgresql_restart_failure_max_retries: u32,

    /// Bound on waiting for monitor notifications
    #[serde(default = "default_listen_notifications_timeout")]
    pub listen_notifications_timeout: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            keeper_sleep_time: default_keeper_sleep_time(),
            network_partition_timeout: default_network_partition_timeout(),
            prepare_promotion_catchup: default_prepare_promotion_catchup(),
            prepare_promotion_walreceiver: default_prepare_promotion_walreceiver(),
            postgresql_restart_failure_timeout: default_restart_failure_timeout(),
            postgresql_restart_failure_max_retries: default_restart_failure_max_retries(),
            listen_notifications_timeout: default_listen_notifications_timeout(),
        }
    }
}

/// TLS posture for the managed PostgreSQL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslConfig {
    /// sslmode: disable, allow, prefer, require, verify-ca, verify-full
    #[serde(default = "default_ssl_mode")]
    pub mode: String,

    #[serde(default)]
    pub ca_file: Option<PathBuf>,

    #[serde(default)]
    pub crl_file: Option<PathBuf>,

    #[serde(default)]
    pub server_cert: Option<PathBuf>,

    #[serde(default)]
    pub server_key: Option<PathBuf>,

    /// Generate self-signed server material at init time
    #[serde(default)]
    pub self_signed: bool,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            mode: default_ssl_mode(),
            ca_file: None,
            crl_file: None,
            server_cert: None,
            server_key: None,
            self_signed: false,
        }
    }
}

/// Monitor process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Address the keeper-facing protocol listens on
    #[serde(default = "default_monitor_listen")]
    pub listen_address: String,

    /// Address the HTTP API listens on
    #[serde(default = "default_monitor_http")]
    pub http_address: String,

    /// Primary silence before a failover begins, in seconds
    #[serde(default = "default_failover_timeout")]
    pub failover_timeout: u64,

    /// Health scanner pass interval, in seconds
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,

    /// Deadline for one health probe, in seconds
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout: u64,

    /// Missed heartbeats before a node's health turns bad
    #[serde(default = "default_health_check_max_retries")]
    pub health_check_max_retries: u32,

    /// Wait for an old primary to acknowledge demotion, in seconds
    #[serde(default = "default_demote_timeout")]
    pub demote_timeout: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            listen_address: default_monitor_listen(),
            http_address: default_monitor_http(),
            failover_timeout: default_failover_timeout(),
            health_check_interval: default_health_check_interval(),
            health_check_timeout: default_health_check_timeout(),
            health_check_max_retries: default_health_check_max_retries(),
            demote_timeout: default_demote_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

fn default_formation() -> String {
    "default".to_string()
}

fn default_nodekind() -> String {
    "standalone".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/steward")
}

fn default_pg_host() -> String {
    "/tmp".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_pg_user() -> String {
    "postgres".to_string()
}

fn default_pg_dbname() -> String {
    "postgres".to_string()
}

fn default_pool_size() -> u32 {
    2
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_backup_directory() -> PathBuf {
    PathBuf::from("backup")
}

fn default_keeper_sleep_time() -> u64 {
    5
}

fn default_network_partition_timeout() -> u64 {
    20
}

fn default_prepare_promotion_catchup() -> u64 {
    30
}

fn default_prepare_promotion_walreceiver() -> u64 {
    30
}

fn default_restart_failure_timeout() -> u64 {
    20
}

fn default_restart_failure_max_retries() -> u32 {
    3
}

fn default_listen_notifications_timeout() -> u64 {
    30
}

fn default_ssl_mode() -> String {
    "prefer".to_string()
}

fn default_monitor_listen() -> String {
    "0.0.0.0:6000".to_string()
}

fn default_monitor_http() -> String {
    "0.0.0.0:6001".to_string()
}

fn default_failover_timeout() -> u64 {
    20
}

fn default_health_check_interval() -> u64 {
    5
}

fn default_health_check_timeout() -> u64 {
    5
}

fn default_health_check_max_retries() -> u32 {
    2
}

fn default_demote_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl StewardConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: StewardConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: StewardConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        match self.steward.role {
            ProcessRole::Keeper => {
                if self.steward.monitor.as_deref().unwrap_or("").is_empty() {
                    return Err(crate::Error::Config(
                        "steward.monitor is required for the keeper role".into(),
                    ));
                }
                if self.steward.name.as_deref().unwrap_or("").is_empty() {
                    return Err(crate::Error::Config(
                        "steward.name is required for the keeper role".into(),
                    ));
                }
                if self.steward.hostname.as_deref().unwrap_or("").is_empty() {
                    return Err(crate::Error::Config(
                        "steward.hostname is required for the keeper role".into(),
                    ));
                }
                if self.postgres.pgdata.as_os_str().is_empty() {
                    return Err(crate::Error::Config(
                        "postgres.pgdata is required for the keeper role".into(),
                    ));
                }
            }
            ProcessRole::Monitor => {
                if self.monitor.listen_address.is_empty() {
                    return Err(crate::Error::Config(
                        "monitor.listen_address cannot be empty".into(),
                    ));
                }
            }
        }

        if !matches!(
            self.ssl.mode.as_str(),
            "disable" | "allow" | "prefer" | "require" | "verify-ca" | "verify-full"
        ) {
            return Err(crate::Error::Config(format!(
                "unknown ssl.mode: {}",
                self.ssl.mode
            )));
        }

        Ok(())
    }

    /// Path of the per-node config file under the user's config directory,
    /// named after the node's data directory
    pub fn default_path_for(pgdata: &Path) -> PathBuf {
        let home = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
                home.join(".config")
            });
        let mangled: String = pgdata
            .to_string_lossy()
            .chars()
            .map(|c| if c == '/' { '_' } else { c })
            .collect();
        home.join("steward").join(format!("{mangled}.toml"))
    }

    /// Get the keeper state file path
    pub fn state_file_path(&self) -> PathBuf {
        self.steward.data_dir.join("steward.state")
    }

    /// Get the init sentinel path
    pub fn init_sentinel_path(&self) -> PathBuf {
        self.steward.data_dir.join("steward.init")
    }

    /// Get the pid file path
    pub fn pid_file_path(&self) -> PathBuf {
        self.steward.data_dir.join("steward.pid")
    }

    /// Replication slot name this node uses on its upstream
    pub fn slot_name(&self, node_id: i64) -> String {
        self.replication
            .slot
            .clone()
            .unwrap_or_else(|| format!("steward_{node_id}"))
    }

    /// Get the keeper tick interval as Duration
    pub fn keeper_sleep_time(&self) -> Duration {
        Duration::from_secs(self.timeout.keeper_sleep_time)
    }

    /// Get the network partition timeout as Duration
    pub fn network_partition_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.network_partition_timeout)
    }

    /// Get the promotion WAL drain bound as Duration
    pub fn walreceiver_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.prepare_promotion_walreceiver)
    }

    /// Get the promotion catch-up bound as Duration
    pub fn catchup_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.prepare_promotion_catchup)
    }

    /// Get the failover timeout as Duration
    pub fn failover_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor.failover_timeout)
    }

    /// Local PostgreSQL connection URL for control connections
    pub fn postgres_url(&self) -> String {
        format!(
            "postgres://{}@{}:{}/{}",
            self.postgres.user,
            urlencode_host(&self.postgres.host),
            self.postgres.port,
            self.postgres.dbname
        )
    }
}

/// Socket directories contain slashes that must be percent-encoded in URLs
fn urlencode_host(host: &str) -> String {
    if host.starts_with('/') {
        host.replace('/', "%2F")
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keeper_config() {
        let toml = r#"
[steward]
role = "keeper"
monitor = "monitor.internal:6000"
formation = "default"
name = "node-a"
hostname = "db1.internal"
data_dir = "/var/lib/steward/node-a"

[postgres]
pgdata = "/var/lib/postgresql/14/main"
port = 5432

[replication]
maximum_backup_rate = "100M"

[timeout]
network_partition_timeout = 30
"#;

        let config = StewardConfig::from_str(toml).unwrap();
        assert_eq!(config.steward.role, ProcessRole::Keeper);
        assert_eq!(config.steward.name.as_deref(), Some("node-a"));
        assert_eq!(config.timeout.network_partition_timeout, 30);
        assert_eq!(config.timeout.keeper_sleep_time, 5);
        assert_eq!(config.slot_name(3), "steward_3");
    }

    #[test]
    fn test_parse_monitor_config() {
        let toml = r#"
[steward]
role = "monitor"

[monitor]
listen_address = "0.0.0.0:6000"
failover_timeout = 25
"#;

        let config = StewardConfig::from_str(toml).unwrap();
        assert_eq!(config.steward.role, ProcessRole::Monitor);
        assert_eq!(config.monitor.failover_timeout, 25);
        assert_eq!(config.monitor.health_check_max_retries, 2);
    }

    #[test]
    fn test_keeper_requires_identity() {
        let toml = r#"
[steward]
role = "keeper"
monitor = "monitor.internal:6000"
"#;
        assert!(StewardConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_socket_host_url() {
        let toml = r#"
[steward]
role = "monitor"
"#;
        let mut config = StewardConfig::from_str(toml).unwrap();
        config.postgres.host = "/var/run/postgresql".into();
        assert!(config.postgres_url().contains("%2Fvar%2Frun%2Fpostgresql"));
    }
}
