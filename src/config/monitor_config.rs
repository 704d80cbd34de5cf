//! Monitor Configuration - operator-tunable TOML values
//!
//! Every timing and sizing knob of the registry, sweeper, orchestrator and
//! event bus lives here. Each struct implements `Default` with the values in
//! [`super::defaults`], so a missing file behaves exactly like an empty one.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::defaults;

/// Environment variable pointing at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "PULSEWATCH_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "pulsewatch.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for a monitor deployment.
///
/// Load with `PulseConfig::load()` which searches:
/// 1. `$PULSEWATCH_CONFIG` env var
/// 2. `./pulsewatch.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PulseConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Heartbeat staleness detection
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Sandboxed auto-remediation
    #[serde(default)]
    pub remediation: RemediationConfig,

    /// Real-time event fan-out
    #[serde(default)]
    pub events: EventsConfig,
}

impl PulseConfig {
    /// Load configuration using the standard search order.
    ///
    /// A file that fails to parse or validate is logged and skipped, the
    /// same as a missing one.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded config from {}", CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {}, falling back", CONFIG_ENV_VAR);
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", CONFIG_ENV_VAR);
            }
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded config from ./{}", LOCAL_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", LOCAL_CONFIG_FILE);
                }
            }
        }

        info!("No {} found, using built-in defaults", LOCAL_CONFIG_FILE);
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
            other => other,
        })
    }

    /// Parse and validate a TOML document.
    ///
    /// Unknown keys are reported as warnings and never fail the load.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }

        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the current config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate settings for internal consistency.
    ///
    /// Rules:
    /// - Intervals, deadlines and buffers must be non-zero
    /// - The attempt deadline is at most one day
    /// - The stop grace period must be shorter than the attempt deadline
    /// - The callback address and sandbox image must be set
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.server.addr.trim().is_empty() {
            errors.push("server.addr must not be empty".to_string());
        }
        if self.monitor.heartbeat_timeout_secs == 0 {
            errors.push("monitor.heartbeat_timeout_secs must be > 0".to_string());
        }
        if self.monitor.sweep_interval_secs == 0 {
            errors.push("monitor.sweep_interval_secs must be > 0".to_string());
        }

        let r = &self.remediation;
        if r.deadline_secs == 0 {
            errors.push("remediation.deadline_secs must be > 0".to_string());
        }
        if r.deadline_secs > defaults::MAX_REMEDIATION_DEADLINE_SECS {
            errors.push(format!(
                "remediation.deadline_secs ({}) must be <= {}",
                r.deadline_secs,
                defaults::MAX_REMEDIATION_DEADLINE_SECS
            ));
        }
        if r.stop_grace_secs >= r.deadline_secs {
            errors.push(format!(
                "remediation.stop_grace_secs ({}) must be < remediation.deadline_secs ({})",
                r.stop_grace_secs, r.deadline_secs
            ));
        }
        if r.image.trim().is_empty() {
            errors.push("remediation.image must not be empty".to_string());
        }
        if r.callback_url.trim().is_empty() {
            errors.push("remediation.callback_url must not be empty".to_string());
        }
        if r.memory_limit_mb == 0 {
            errors.push("remediation.memory_limit_mb must be > 0".to_string());
        }
        if !(r.cpu_limit > 0.0) {
            errors.push(format!("remediation.cpu_limit ({}) must be > 0", r.cpu_limit));
        }
        if self.events.subscriber_buffer == 0 {
            errors.push("events.subscriber_buffer must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {}", .0.display(), .1)]
    Io(PathBuf, std::io::Error),
    #[error("Config parse error ({}): {}", .0.display(), .1)]
    Parse(PathBuf, toml::de::Error),
    #[error("Config serialization error: {0}")]
    Serialize(toml::ser::Error),
    #[error("Config validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

// ============================================================================
// Server
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server bind address.
    ///
    /// Can be overridden by `PULSEWATCH_ADDR` env var or `--addr` CLI flag.
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

fn default_server_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// Staleness detection. The threshold and the sweep interval are independent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds without a heartbeat before a service is marked down
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    /// Seconds between sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_heartbeat_timeout() -> u64 {
    defaults::HEARTBEAT_TIMEOUT_SECS
}
fn default_sweep_interval() -> u64 {
    defaults::SWEEP_INTERVAL_SECS
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl MonitorConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Parse a duration such as `30`, `30s`, `1m30s`, `500ms` or `1.5h` into
/// whole seconds, rounding up. A bare number is seconds.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn parse_secs(value: &str) -> Result<u64, String> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(secs);
    }

    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut total = 0.0_f64;
    let mut rest = value;
    while !rest.is_empty() {
        let split = rest.find(|c: char| !is_number(c)).unwrap_or(rest.len());
        let (number, tail) = rest.split_at(split);
        let amount: f64 = number
            .parse()
            .map_err(|_| format!("invalid duration '{value}'"))?;
        let (unit, next) = tail.split_at(tail.find(is_number).unwrap_or(tail.len()));
        let scale = match unit {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => return Err(format!("missing unit in '{value}'")),
            other => return Err(format!("unknown duration unit '{other}' in '{value}'")),
        };
        total += amount * scale;
        rest = next;
    }

    let secs = total.ceil();
    if secs >= u64::MAX as f64 {
        return Err(format!("duration '{value}' is too large"));
    }
    Ok(secs as u64)
}

// ============================================================================
// Remediation
// ============================================================================

/// Sandbox and agent settings for remediation attempts.
///
/// Credentials never live here; they come from the environment only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationConfig {
    /// Image the sandbox runs
    #[serde(default = "default_image")]
    pub image: String,

    /// Address the sandboxed job POSTs its self-report to
    #[serde(default = "default_callback_url")]
    pub callback_url: String,

    /// Hard deadline for one attempt (seconds)
    #[serde(default = "default_deadline")]
    pub deadline_secs: u64,

    /// Grace period when stopping a sandbox after the deadline (seconds)
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    /// Sandbox memory limit (MiB)
    #[serde(default = "default_memory_limit")]
    pub memory_limit_mb: u64,

    /// Sandbox CPU limit (cores, fractional allowed)
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,

    /// Docker Engine endpoint (`tcp://host:port` or `http://host:port`).
    ///
    /// Falls back to `DOCKER_HOST`; when neither is set remediation is disabled.
    #[serde(default)]
    pub docker_host: Option<String>,

    /// Git author/committer name used for fix commits
    #[serde(default = "default_author_name")]
    pub author_name: String,

    /// Git author/committer email used for fix commits
    #[serde(default = "default_author_email")]
    pub author_email: String,

    /// Prefix of the per-attempt fix branch (`<prefix>-<id>`)
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,

    /// Model identifier handed to the coding agent
    #[serde(default = "default_agent_model")]
    pub agent_model: String,

    /// OpenAI-compatible base URL of the agent's model provider
    #[serde(default = "default_agent_base_url")]
    pub agent_base_url: String,
}

fn default_image() -> String {
    defaults::SANDBOX_IMAGE.to_string()
}
fn default_callback_url() -> String {
    defaults::CALLBACK_URL.to_string()
}
fn default_deadline() -> u64 {
    defaults::REMEDIATION_DEADLINE_SECS
}
fn default_stop_grace() -> u64 {
    defaults::SANDBOX_STOP_GRACE_SECS
}
fn default_memory_limit() -> u64 {
    defaults::SANDBOX_MEMORY_LIMIT_MB
}
fn default_cpu_limit() -> f64 {
    defaults::SANDBOX_CPU_LIMIT
}
fn default_author_name() -> String {
    "Pulsewatch AutoFix".to_string()
}
fn default_author_email() -> String {
    "autofix@pulsewatch.local".to_string()
}
fn default_branch_prefix() -> String {
    "autofix".to_string()
}
fn default_agent_model() -> String {
    "cerebras/gpt-oss-120b".to_string()
}
fn default_agent_base_url() -> String {
    "https://api.cerebras.ai/v1".to_string()
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            callback_url: default_callback_url(),
            deadline_secs: default_deadline(),
            stop_grace_secs: default_stop_grace(),
            memory_limit_mb: default_memory_limit(),
            cpu_limit: default_cpu_limit(),
            docker_host: None,
            author_name: default_author_name(),
            author_email: default_author_email(),
            branch_prefix: default_branch_prefix(),
            agent_model: default_agent_model(),
            agent_base_url: default_agent_base_url(),
        }
    }
}

impl RemediationConfig {
    /// Attempt deadline, clamped to the largest accepted value.
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs.min(defaults::MAX_REMEDIATION_DEADLINE_SECS))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Envelopes queued per subscriber before it lags and gets a resync snapshot
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_subscriber_buffer() -> usize {
    defaults::SUBSCRIBER_BUFFER
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_secs_units() {
        assert_eq!(parse_secs("30"), Ok(30));
        assert_eq!(parse_secs("30s"), Ok(30));
        assert_eq!(parse_secs(" 2m "), Ok(120));
        assert_eq!(parse_secs("1h"), Ok(3600));
        assert!(parse_secs("").is_err());
        assert!(parse_secs("5").is_ok());
        assert!(parse_secs("1m30").is_err());
        assert!(parse_secs("10d").is_err());
        assert!(parse_secs("abc").is_err());
    }

    #[test]
    fn test_parse_secs_compound_and_subsecond() {
        assert_eq!(parse_secs("1m30s"), Ok(90));
        assert_eq!(parse_secs("1h0m2s"), Ok(3602));
        assert_eq!(parse_secs("500ms"), Ok(1));
        assert_eq!(parse_secs("1.5h"), Ok(5400));
        assert_eq!(parse_secs("2s500ms"), Ok(3));
        assert!(parse_secs("-5s").is_err());
    }

    #[test]
    fn test_defaults_validate() {
        assert!(PulseConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = PulseConfig::from_toml_str("").unwrap();
        assert_eq!(config.server.addr, "0.0.0.0:8080");
        assert_eq!(config.monitor.heartbeat_timeout_secs, 30);
        assert_eq!(config.monitor.sweep_interval_secs, 5);
        assert_eq!(config.remediation.deadline_secs, 600);
        assert_eq!(config.events.subscriber_buffer, 64);
        assert!(config.remediation.docker_host.is_none());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = PulseConfig::from_toml_str(
            r#"
[monitor]
heartbeat_timeout_secs = 90

[remediation]
docker_host = "tcp://127.0.0.1:2375"
"#,
        )
        .unwrap();
        assert_eq!(config.monitor.heartbeat_timeout(), Duration::from_secs(90));
        assert_eq!(config.monitor.sweep_interval(), Duration::from_secs(5));
        assert_eq!(
            config.remediation.docker_host.as_deref(),
            Some("tcp://127.0.0.1:2375")
        );
        assert_eq!(config.remediation.image, defaults::SANDBOX_IMAGE);
    }

    #[test]
    fn test_oversized_deadline_rejected_and_clamped() {
        let mut config = PulseConfig::default();
        config.remediation.deadline_secs = u64::MAX;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("remediation.deadline_secs"));
        assert_eq!(
            config.remediation.deadline(),
            Duration::from_secs(defaults::MAX_REMEDIATION_DEADLINE_SECS)
        );
    }

    #[test]
    fn test_grace_must_be_shorter_than_deadline() {
        let err = PulseConfig::from_toml_str(
            r#"
[remediation]
deadline_secs = 10
stop_grace_secs = 10
"#,
        )
        .unwrap_err();
        match err {
            ConfigError::Validation(errors) => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].contains("stop_grace_secs"));
            }
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut config = PulseConfig::default();
        config.monitor.sweep_interval_secs = 0;
        config.events.subscriber_buffer = 0;
        let err = config.validate().unwrap_err();
        match err {
            ConfigError::Validation(errors) => assert_eq!(errors.len(), 2),
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn test_parse_error_carries_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[monitor\nheartbeat_timeout_secs = 3").unwrap();
        let err = PulseConfig::load_from_file(file.path()).unwrap_err();
        match err {
            ConfigError::Parse(path, _) => assert_eq!(path, file.path()),
            other => panic!("expected parse error, got {other}"),
        }
    }

    #[test]
    fn test_load_from_file_round_trip() {
        let mut config = PulseConfig::default();
        config.server.addr = "127.0.0.1:9090".to_string();
        config.remediation.branch_prefix = "heal".to_string();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml().unwrap().as_bytes()).unwrap();

        let loaded = PulseConfig::load_from_file(file.path()).unwrap();
        assert_eq!(loaded.server.addr, "127.0.0.1:9090");
        assert_eq!(loaded.remediation.branch_prefix, "heal");
    }
}
