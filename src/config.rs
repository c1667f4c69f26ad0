//! Configuration System
//!
//! Handles loading driver configuration from files and environment variables.
//! Supports TOML config files and `TSBRIDGE_*` environment variable overrides.

use crate::drivers::influxdb::Precision;
use crate::drivers::rrdtool::ConsolidationFunction;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Driver used when the CLI is not told otherwise
    #[serde(default = "default_driver")]
    pub driver: String,

    #[serde(default)]
    pub influxdb: InfluxDbConfig,

    #[serde(default)]
    pub graphite: GraphiteConfig,

    #[serde(default)]
    pub rrdtool: RrdToolConfig,

    #[serde(default)]
    pub prometheus: PrometheusConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_driver() -> String {
    "influxdb".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            influxdb: InfluxDbConfig::default(),
            graphite: GraphiteConfig::default(),
            rrdtool: RrdToolConfig::default(),
            prometheus: PrometheusConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}

/// InfluxDB 2.x connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxDbConfig {
    #[serde(default = "default_influx_url")]
    pub url: String,

    #[serde(default)]
    pub token: String,

    #[serde(default)]
    pub org: String,

    #[serde(default)]
    pub bucket: String,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub precision: Precision,
}

fn default_influx_url() -> String {
    "http://localhost:8086".to_string()
}

impl Default for InfluxDbConfig {
    fn default() -> Self {
        Self {
            url: default_influx_url(),
            token: String::new(),
            org: String::new(),
            bucket: String::new(),
            timeout_secs: default_timeout(),
            precision: Precision::default(),
        }
    }
}

/// Plaintext protocol transport for Graphite writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphiteProtocol {
    #[default]
    Tcp,
    Udp,
}

/// Graphite render API and carbon endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphiteConfig {
    /// Render API base URL
    #[serde(default = "default_graphite_url")]
    pub url: String,

    /// Carbon host for plaintext writes
    #[serde(default = "default_graphite_host")]
    pub host: String,

    #[serde(default = "default_graphite_port")]
    pub port: u16,

    #[serde(default)]
    pub protocol: GraphiteProtocol,

    /// Prepended to every written path
    #[serde(default)]
    pub prefix: String,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_graphite_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_graphite_host() -> String {
    "localhost".to_string()
}

fn default_graphite_port() -> u16 {
    2003
}

impl Default for GraphiteConfig {
    fn default() -> Self {
        Self {
            url: default_graphite_url(),
            host: default_graphite_host(),
            port: default_graphite_port(),
            protocol: GraphiteProtocol::default(),
            prefix: String::new(),
            timeout_secs: default_timeout(),
        }
    }
}

/// How tags map onto RRD file paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagStrategyKind {
    /// `cpu__host=a.rrd`
    #[default]
    Flat,
    /// `cpu/host=a/cpu.rrd`
    Folder,
    /// `cpu.rrd`, tags ignored
    None,
}

/// RRDtool files and process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RrdToolConfig {
    #[serde(default = "default_rrd_dir")]
    pub data_dir: String,

    #[serde(default = "default_rrd_binary")]
    pub binary: String,

    /// `rrdcached` address passed as `--daemon`
    #[serde(default)]
    pub rrdcached_address: Option<String>,

    /// Keep one `rrdtool -` process alive instead of spawning per command
    #[serde(default)]
    pub persistent: bool,

    #[serde(default)]
    pub tag_strategy: TagStrategyKind,

    /// Base step in seconds for newly created files
    #[serde(default = "default_rrd_step")]
    pub step: u64,

    /// Heartbeat in seconds for newly created data sources
    #[serde(default = "default_rrd_heartbeat")]
    pub heartbeat: u64,

    /// Rows per archive
    #[serde(default = "default_rrd_rows")]
    pub rows: u64,

    /// One archive is created per function
    #[serde(default = "default_rrd_consolidation")]
    pub consolidation: Vec<ConsolidationFunction>,
}

fn default_rrd_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("tsbridge").join("rrd").to_string_lossy().to_string())
        .unwrap_or_else(|| "./rrd_data".to_string())
}

fn default_rrd_binary() -> String {
    "rrdtool".to_string()
}

fn default_rrd_step() -> u64 {
    60
}

fn default_rrd_heartbeat() -> u64 {
    120
}

fn default_rrd_rows() -> u64 {
    1440 // one day of minutes
}

fn default_rrd_consolidation() -> Vec<ConsolidationFunction> {
    vec![
        ConsolidationFunction::Average,
        ConsolidationFunction::Min,
        ConsolidationFunction::Max,
        ConsolidationFunction::Last,
    ]
}

impl Default for RrdToolConfig {
    fn default() -> Self {
        Self {
            data_dir: default_rrd_dir(),
            binary: default_rrd_binary(),
            rrdcached_address: None,
            persistent: false,
            tag_strategy: TagStrategyKind::default(),
            step: default_rrd_step(),
            heartbeat: default_rrd_heartbeat(),
            rows: default_rrd_rows(),
            consolidation: default_rrd_consolidation(),
        }
    }
}

/// Prometheus HTTP API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    #[serde(default = "default_prometheus_url")]
    pub url: String,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Range query step when the query has no interval
    #[serde(default = "default_prometheus_step")]
    pub default_step: String,
}

fn default_prometheus_url() -> String {
    "http://localhost:9090".to_string()
}

fn default_prometheus_step() -> String {
    "1m".to_string()
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            url: default_prometheus_url(),
            timeout_secs: default_timeout(),
            default_step: default_prometheus_step(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    /// Parse configuration text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            error: e.to_string(),
        })
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("tsbridge").join("config.toml")),
            Some(PathBuf::from("/etc/tsbridge/config.toml")),
            Some(PathBuf::from("./tsbridge.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(driver) = var("TSBRIDGE_DRIVER") {
            self.driver = driver;
        }

        // InfluxDB
        if let Some(url) = var("TSBRIDGE_INFLUXDB_URL") {
            self.influxdb.url = url;
        }
        if let Some(token) = var("TSBRIDGE_INFLUXDB_TOKEN") {
            self.influxdb.token = token;
        }
        if let Some(org) = var("TSBRIDGE_INFLUXDB_ORG") {
            self.influxdb.org = org;
        }
        if let Some(bucket) = var("TSBRIDGE_INFLUXDB_BUCKET") {
            self.influxdb.bucket = bucket;
        }

        // Graphite
        if let Some(url) = var("TSBRIDGE_GRAPHITE_URL") {
            self.graphite.url = url;
        }
        if let Some(host) = var("TSBRIDGE_GRAPHITE_HOST") {
            self.graphite.host = host;
        }
        if let Some(port) = var("TSBRIDGE_GRAPHITE_PORT").and_then(|p| p.parse().ok()) {
            self.graphite.port = port;
        }

        // RRDtool
        if let Some(dir) = var("TSBRIDGE_RRD_DIR") {
            self.rrdtool.data_dir = dir;
        }
        if let Some(address) = var("TSBRIDGE_RRDCACHED_ADDRESS") {
            self.rrdtool.rrdcached_address = Some(address);
        }

        // Prometheus
        if let Some(url) = var("TSBRIDGE_PROMETHEUS_URL") {
            self.prometheus.url = url;
        }

        // Logging
        if let Some(level) = var("TSBRIDGE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("TSBRIDGE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# tsbridge Configuration
#
# Environment variables override these settings:
# - TSBRIDGE_DRIVER
# - TSBRIDGE_INFLUXDB_URL, TSBRIDGE_INFLUXDB_TOKEN, TSBRIDGE_INFLUXDB_ORG, TSBRIDGE_INFLUXDB_BUCKET
# - TSBRIDGE_GRAPHITE_URL, TSBRIDGE_GRAPHITE_HOST, TSBRIDGE_GRAPHITE_PORT
# - TSBRIDGE_RRD_DIR, TSBRIDGE_RRDCACHED_ADDRESS
# - TSBRIDGE_PROMETHEUS_URL
# - TSBRIDGE_LOG_LEVEL, TSBRIDGE_LOG_FORMAT

# Default driver: influxdb, graphite, rrdtool or prometheus
driver = "influxdb"

[influxdb]
url = "http://localhost:8086"
token = ""
org = ""
bucket = ""
timeout_secs = 30

# Write timestamp precision: s, ms, us or ns
precision = "s"

[graphite]
# Render API
url = "http://localhost:8080"

# Carbon plaintext endpoint for writes
host = "localhost"
port = 2003
protocol = "tcp"

# Prepended to every written path
prefix = ""
timeout_secs = 30

[rrdtool]
data_dir = "~/.local/share/tsbridge/rrd"
binary = "rrdtool"

# rrdcached address, e.g. "unix:/var/run/rrdcached.sock"
# rrdcached_address = ""

# Keep a single `rrdtool -` process running
persistent = false

# File layout: flat, folder or none
tag_strategy = "flat"

# Settings for files created on first write
step = 60
heartbeat = 120
rows = 1440
consolidation = ["AVERAGE", "MIN", "MAX", "LAST"]

[prometheus]
url = "http://localhost:9090"
timeout_secs = 30
default_step = "1m"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_parses() {
        let config = Config::from_toml(&generate_default_config()).unwrap();
        assert_eq!(config.driver, "influxdb");
        assert_eq!(config.graphite.port, 2003);
        assert_eq!(config.rrdtool.tag_strategy, TagStrategyKind::Flat);
        assert_eq!(config.rrdtool.consolidation.len(), 4);
        assert_eq!(config.influxdb.precision, Precision::Seconds);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = Config::from_toml(
            r#"
            driver = "rrdtool"
            [rrdtool]
            data_dir = "/var/lib/rrd"
            tag_strategy = "folder"
            "#,
        )
        .unwrap();

        assert_eq!(config.driver, "rrdtool");
        assert_eq!(config.rrdtool.data_dir, "/var/lib/rrd");
        assert_eq!(config.rrdtool.tag_strategy, TagStrategyKind::Folder);
        assert_eq!(config.rrdtool.step, 60);
        assert_eq!(config.prometheus.url, "http://localhost:9090");
    }

    #[test]
    fn test_invalid_toml() {
        let err = Config::from_toml("driver = [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TSBRIDGE_DRIVER", "graphite"),
            ("TSBRIDGE_GRAPHITE_PORT", "2004"),
            ("TSBRIDGE_INFLUXDB_TOKEN", "secret"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.driver, "graphite");
        assert_eq!(config.graphite.port, 2004);
        assert_eq!(config.influxdb.token, "secret");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tsbridge.toml");
        std::fs::write(&path, "[prometheus]\nurl = \"http://prom:9090\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.prometheus.url, "http://prom:9090");

        let missing = Config::load(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
