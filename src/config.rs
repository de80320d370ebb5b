//! Configuration module for linkwatch.
//!
//! Loads configuration from an optional TOML file, then applies environment
//! variable overrides on top of sensible defaults.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::outage::Quorum;
use crate::probe::{ProbeKind, ProbeTarget, RetryPolicy};

/// Longest retention horizon accepted, about a century.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Default config file consulted when `LINKWATCH_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "linkwatch.toml";

/// Configuration error types. All of them are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Full configuration model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub monitoring: MonitoringConfig,
    pub targets: TargetsConfig,
    pub outage: OutageConfig,
    pub speed_test: SpeedTestConfig,
    pub database: DatabaseConfig,
}

/// HTTP server and storage location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "linkwatch.db")
    pub db_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "linkwatch.db".to_string(),
        }
    }
}

/// Timer periods, timeouts and retry counts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitoringConfig {
    pub ping_interval_seconds: u64,
    pub speed_test_interval_minutes: u64,
    pub connectivity_timeout_seconds: u64,
    pub max_retries: u32,
    pub cleanup_interval_hours: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            ping_interval_seconds: 30,
            speed_test_interval_minutes: 15,
            connectivity_timeout_seconds: 10,
            max_retries: 3,
            cleanup_interval_hours: 24,
        }
    }
}

/// Hosts to probe each round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TargetsConfig {
    pub ping_hosts: Vec<String>,
    pub dns_servers: Vec<String>,
    pub http_urls: Vec<String>,
    /// Name resolved against each DNS server.
    pub dns_query_name: String,
}

impl Default for TargetsConfig {
    fn default() -> Self {
        Self {
            ping_hosts: vec![
                "8.8.8.8".to_string(),
                "1.1.1.1".to_string(),
                "google.com".to_string(),
            ],
            dns_servers: vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()],
            http_urls: Vec::new(),
            dns_query_name: "google.com".to_string(),
        }
    }
}

/// Outage state machine knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutageConfig {
    /// Consecutive failing rounds before the connection is declared down.
    pub failure_threshold_rounds: u32,
    /// How many targets must fail for a round to count as failing.
    pub quorum: Quorum,
    /// Latency above which a successful sample counts as degraded.
    pub degraded_latency_ms: f64,
    /// Whether latency-only degradation opens an outage.
    pub degraded_is_outage: bool,
}

impl Default for OutageConfig {
    fn default() -> Self {
        Self {
            failure_threshold_rounds: 1,
            quorum: Quorum::All,
            degraded_latency_ms: 1000.0,
            degraded_is_outage: false,
        }
    }
}

/// Hybrid speed test settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SpeedTestConfig {
    pub primary_enabled: bool,
    pub primary_command: String,
    pub primary_args: Vec<String>,
    /// Overall bound on the primary method.
    pub timeout_seconds: u64,
    pub fallback_urls: Vec<String>,
    pub fallback_upload_url: Option<String>,
    pub upload_bytes: usize,
    pub latency_urls: Vec<String>,
    /// Bound on each fallback transfer.
    pub fallback_timeout_seconds: u64,
    /// Multiplier applied to raw fallback throughput. Calibrated against a
    /// single network; it does not adapt to other links.
    pub calibration_factor: f64,
}

impl Default for SpeedTestConfig {
    fn default() -> Self {
        Self {
            primary_enabled: true,
            primary_command: "speedtest-cli".to_string(),
            primary_args: vec!["--json".to_string(), "--secure".to_string()],
            timeout_seconds: 60,
            fallback_urls: vec![
                "https://httpbin.org/bytes/1048576".to_string(),
                "https://httpbin.org/bytes/5242880".to_string(),
                "https://httpbin.org/bytes/10485760".to_string(),
            ],
            fallback_upload_url: Some("https://httpbin.org/post".to_string()),
            upload_bytes: 1024 * 1024,
            latency_urls: vec![
                "https://www.google.com".to_string(),
                "https://www.cloudflare.com".to_string(),
            ],
            fallback_timeout_seconds: 30,
            calibration_factor: 15.0,
        }
    }
}

/// Retention settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub retention_days: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { retention_days: 90 }
    }
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Environment variables:
    /// - `LINKWATCH_CONFIG`: TOML config path (default: "linkwatch.toml" if present)
    /// - `LINKWATCH_HTTP_PORT`: HTTP port
    /// - `LINKWATCH_DB_PATH`: Database file path
    /// - `LINKWATCH_RETENTION_DAYS`: Retention horizon in days
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = match env::var("LINKWATCH_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(DEFAULT_CONFIG_PATH)?
            }
            Err(_) => Self::default(),
        };

        if let Ok(port_str) = env::var("LINKWATCH_HTTP_PORT") {
            if let Ok(port) = port_str.parse() {
                cfg.server.http_port = port;
            }
        }

        if let Ok(db_path) = env::var("LINKWATCH_DB_PATH") {
            cfg.server.db_path = db_path;
        }

        if let Ok(days) = env::var("LINKWATCH_RETENTION_DAYS") {
            if let Ok(days) = days.parse() {
                cfg.database.retention_days = days;
            }
        }

        Ok(cfg)
    }

    /// Parse a TOML config file. Missing sections fall back to defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().display().to_string();
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
            path: path_str.clone(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path_str,
            source,
        })
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.monitoring;
        if m.ping_interval_seconds == 0 {
            return Err(invalid("monitoring.ping_interval_seconds must be > 0"));
        }
        if m.speed_test_interval_minutes == 0 {
            return Err(invalid("monitoring.speed_test_interval_minutes must be > 0"));
        }
        if m.cleanup_interval_hours == 0 {
            return Err(invalid("monitoring.cleanup_interval_hours must be > 0"));
        }
        if m.connectivity_timeout_seconds == 0 {
            return Err(invalid("monitoring.connectivity_timeout_seconds must be > 0"));
        }
        if m.max_retries == 0 {
            return Err(invalid("monitoring.max_retries must be at least 1"));
        }

        if self.probe_targets().is_empty() {
            return Err(invalid("no probe targets configured"));
        }
        if !self.targets.dns_servers.is_empty() && self.targets.dns_query_name.trim().is_empty() {
            return Err(invalid("targets.dns_query_name must not be empty"));
        }

        if self.outage.failure_threshold_rounds == 0 {
            return Err(invalid("outage.failure_threshold_rounds must be at least 1"));
        }
        if !(self.outage.degraded_latency_ms > 0.0) {
            return Err(invalid("outage.degraded_latency_ms must be > 0"));
        }

        let st = &self.speed_test;
        if !st.calibration_factor.is_finite() || st.calibration_factor <= 0.0 {
            return Err(invalid("speed_test.calibration_factor must be a positive number"));
        }
        if st.timeout_seconds == 0 || st.fallback_timeout_seconds == 0 {
            return Err(invalid("speed_test timeouts must be > 0"));
        }
        if st.primary_enabled && st.primary_command.trim().is_empty() {
            return Err(invalid("speed_test.primary_command must not be empty"));
        }
        if !st.primary_enabled && st.fallback_urls.is_empty() {
            return Err(invalid("no speed test method available"));
        }

        if self.database.retention_days == 0 || self.database.retention_days > MAX_RETENTION_DAYS {
            return Err(invalid("database.retention_days must be between 1 and 36500"));
        }

        Ok(())
    }

    /// Every configured target, in ping, dns, http order.
    pub fn probe_targets(&self) -> Vec<ProbeTarget> {
        let t = &self.targets;
        t.ping_hosts
            .iter()
            .map(|h| ProbeTarget::new(h, ProbeKind::Ping))
            .chain(t.dns_servers.iter().map(|h| ProbeTarget::new(h, ProbeKind::Dns)))
            .chain(t.http_urls.iter().map(|h| ProbeTarget::new(h, ProbeKind::Http)))
            .filter(|t| !t.host.trim().is_empty())
            .collect()
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring.ping_interval_seconds)
    }

    pub fn speed_test_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring.speed_test_interval_minutes * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring.cleanup_interval_hours * 3600)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.monitoring.connectivity_timeout_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.monitoring.max_retries)
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.server.http_port, 8080);
        assert_eq!(cfg.server.db_path, "linkwatch.db");
        assert_eq!(cfg.ping_interval(), Duration::from_secs(30));
        assert_eq!(cfg.speed_test_interval(), Duration::from_secs(900));
        assert_eq!(cfg.cleanup_interval(), Duration::from_secs(86400));
        assert_eq!(cfg.probe_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.retry_policy().max_attempts, 3);
        assert_eq!(cfg.database.retention_days, 90);
        assert_eq!(cfg.speed_test.calibration_factor, 15.0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_probe_targets_order() {
        let mut cfg = Config::default();
        cfg.targets.http_urls = vec!["https://example.com".to_string()];
        let targets = cfg.probe_targets();
        assert_eq!(targets.len(), 6);
        assert_eq!(targets[0].kind, ProbeKind::Ping);
        assert_eq!(targets[3].kind, ProbeKind::Dns);
        assert_eq!(targets[5].kind, ProbeKind::Http);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[monitoring]
ping_interval_seconds = 5

[targets]
ping_hosts = ["9.9.9.9"]
dns_servers = []

[outage]
quorum = "majority"

[speed_test]
calibration_factor = 12.5
"#
        )
        .unwrap();

        let cfg = Config::from_file(file.path()).unwrap();
        assert_eq!(cfg.monitoring.ping_interval_seconds, 5);
        assert_eq!(cfg.monitoring.max_retries, 3);
        assert_eq!(cfg.targets.ping_hosts, vec!["9.9.9.9".to_string()]);
        assert_eq!(cfg.outage.quorum, Quorum::Majority);
        assert_eq!(cfg.speed_test.calibration_factor, 12.5);
        assert_eq!(cfg.speed_test.timeout_seconds, 60);
        assert_eq!(cfg.server.http_port, 8080);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_malformed_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[monitoring\nping_interval_seconds = ").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::from_file("/nonexistent/linkwatch.toml"),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.monitoring.ping_interval_seconds = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.targets.ping_hosts.clear();
        cfg.targets.dns_servers.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.targets.ping_hosts = vec!["  ".to_string()];
        cfg.targets.dns_servers.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.monitoring.max_retries = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.speed_test.calibration_factor = f64::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.speed_test.calibration_factor = -1.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.database.retention_days = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.speed_test.primary_enabled = false;
        cfg.speed_test.fallback_urls.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_retention_upper_bound() {
        let mut cfg = Config::default();
        cfg.database.retention_days = MAX_RETENTION_DAYS;
        assert!(cfg.validate().is_ok());

        cfg.database.retention_days = MAX_RETENTION_DAYS + 1;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        cfg.database.retention_days = u32::MAX;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }
}
