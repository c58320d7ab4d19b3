use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};

/// Top-level configuration for the asflow importer.
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Aggregation window configuration.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// PostgreSQL connection configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Flow source configuration.
    #[serde(default)]
    pub netflow: NetflowConfig,

    /// Window handoff queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// How long to wait for the writer to drain on shutdown. Default: 30s.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Aggregation window configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Window length, as a duration ("5m") or a bare number of seconds.
    /// Default: 60s.
    #[serde(default = "default_period", deserialize_with = "duration_or_secs")]
    pub period: Duration,

    /// What closes a window. Default: timer.
    #[serde(default)]
    pub cutover: CutoverMode,
}

/// Window cutover policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutoverMode {
    /// Close the window when its deadline passes, whether or not flows arrive.
    Timer,
    /// Only check the deadline when a flow record arrives.
    Flow,
}

impl Default for CutoverMode {
    fn default() -> Self {
        Self::Timer
    }
}

impl CutoverMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Flow => "flow",
        }
    }
}

/// PostgreSQL connection configuration.
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Server hostname or address. Default: "localhost".
    #[serde(default = "default_db_host")]
    pub host: String,

    /// Server port. Default: 5432.
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Database name. Default: "netflow".
    #[serde(default = "default_db_name")]
    pub name: String,

    /// Login role. Default: "netflow".
    #[serde(default = "default_db_user")]
    pub user: String,

    /// Login password.
    #[serde(default)]
    pub pass: String,

    /// Destination table. Default: "traffic".
    #[serde(default = "default_db_table")]
    pub table: String,

    /// Timeout for establishing a connection. Default: 10s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Wait between reconnect attempts. Default: 30s.
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("pass", &if self.pass.is_empty() { "" } else { "<redacted>" })
            .field("table", &self.table)
            .field("connect_timeout", &self.connect_timeout)
            .field("retry_interval", &self.retry_interval)
            .finish()
    }
}

/// Flow source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NetflowConfig {
    /// UDP listen address for decoded flow datagrams. Default: "0.0.0.0:2055".
    #[serde(default = "default_netflow_address")]
    pub address: String,

    /// Number of receiver tasks sharing the socket. Default: 1.
    #[serde(default = "default_netflow_workers", alias = "threads")]
    pub workers: usize,

    /// Capacity of the channel between the receivers and the aggregator. Default: 65536.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Window handoff queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Maximum windows waiting for the writer; 0 means unbounded. Default: 0.
    #[serde(default)]
    pub max_pending: usize,

    /// Backlog size that triggers a warning. Default: 16.
    #[serde(default = "default_warn_depth")]
    pub warn_depth: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter directive. The numeric levels 0 to 3 map to error,
    /// warn, info and debug. Default: "info".
    #[serde(default = "default_log_level", deserialize_with = "log_level")]
    pub level: String,

    /// Optional file that receives a copy of the log output.
    #[serde(default)]
    pub file: String,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_period() -> Duration {
    Duration::from_secs(60)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_name() -> String {
    "netflow".to_string()
}

fn default_db_user() -> String {
    "netflow".to_string()
}

fn default_db_table() -> String {
    "traffic".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_netflow_address() -> String {
    "0.0.0.0:2055".to_string()
}

fn default_netflow_workers() -> usize {
    1
}

fn default_channel_capacity() -> usize {
    65536
}

fn default_warn_depth() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Field deserializers ---

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Secs(u64),
    Text(humantime_serde::Serde<Duration>),
}

fn duration_or_secs<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    Ok(match RawDuration::deserialize(d)? {
        RawDuration::Secs(secs) => Duration::from_secs(secs),
        RawDuration::Text(text) => text.into_inner(),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLevel {
    Numeric(u8),
    Directive(String),
}

fn log_level<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let directive = match RawLevel::deserialize(d)? {
        RawLevel::Numeric(0) => "error",
        RawLevel::Numeric(1) => "warn",
        RawLevel::Numeric(2) => "info",
        RawLevel::Numeric(3) => "debug",
        RawLevel::Numeric(n) => {
            return Err(serde::de::Error::custom(format!(
                "numeric log level must be 0 to 3, got {n}"
            )))
        }
        RawLevel::Directive(s) => return Ok(s),
    };
    Ok(directive.to_string())
}

// --- Default trait impls ---

impl Default for Settings {
    fn default() -> Self {
        Self {
            aggregation: AggregationConfig::default(),
            database: DatabaseConfig::default(),
            netflow: NetflowConfig::default(),
            queue: QueueConfig::default(),
            logging: LoggingConfig::default(),
            health: HealthConfig::default(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            period: default_period(),
            cutover: CutoverMode::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            name: default_db_name(),
            user: default_db_user(),
            pass: String::new(),
            table: default_db_table(),
            connect_timeout: default_connect_timeout(),
            retry_interval: default_retry_interval(),
        }
    }
}

impl Default for NetflowConfig {
    fn default() -> Self {
        Self {
            address: default_netflow_address(),
            workers: default_netflow_workers(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending: 0,
            warn_depth: default_warn_depth(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: String::new(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Settings {
    /// Load settings from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("loading settings file {}", path.display()))
    }

    /// Parse and validate settings from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(data).context("parsing settings YAML")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate the settings for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.aggregation.period.is_zero() {
            bail!("aggregation.period must be positive");
        }

        if self.database.host.is_empty() {
            bail!("database.host is required");
        }

        if self.database.name.is_empty() {
            bail!("database.name is required");
        }

        if !is_sql_identifier(&self.database.table) {
            bail!(
                "database.table must be a plain SQL identifier: {:?}",
                self.database.table
            );
        }

        self.netflow
            .address
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid netflow.address: {}", self.netflow.address))?;

        if self.netflow.workers == 0 {
            bail!("netflow.workers must be positive");
        }

        if self.netflow.channel_capacity == 0 {
            bail!("netflow.channel_capacity must be positive");
        }

        if self.queue.warn_depth == 0 {
            bail!("queue.warn_depth must be positive");
        }

        Ok(())
    }
}

impl HealthConfig {
    /// Resolve the listen address, expanding the ":port" shorthand.
    pub fn bind_addr(&self) -> String {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        }
    }
}

fn is_sql_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
