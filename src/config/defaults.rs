//! System-wide default constants.
//!
//! Centralises the numbers the registry, ledger and orchestrator share.
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Health Registry
// ============================================================================

/// Structured log entries retained per service (oldest dropped first).
pub const SERVICE_LOG_CAPACITY: usize = 100;

/// Remediation log lines retained per service (oldest dropped first).
pub const REMEDIATION_LOG_CAPACITY: usize = 10;

/// Seconds without a heartbeat before a service is marked down.
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 30;

/// Interval between staleness sweeps (seconds).
pub const SWEEP_INTERVAL_SECS: u64 = 5;

// ============================================================================
// Remediation
// ============================================================================

/// Remediation records retained by the ledger (oldest evicted first).
pub const LEDGER_CAPACITY: usize = 100;

/// Hard wall-clock deadline for one remediation attempt (seconds).
///
/// 600 = 10 minutes.
pub const REMEDIATION_DEADLINE_SECS: u64 = 600;

/// Largest accepted attempt deadline (seconds). 86400 = one day.
pub const MAX_REMEDIATION_DEADLINE_SECS: u64 = 86_400;

/// Grace period handed to the sandbox when it is stopped after the deadline.
pub const SANDBOX_STOP_GRACE_SECS: u64 = 10;

/// Sandbox memory limit (MiB).
pub const SANDBOX_MEMORY_LIMIT_MB: u64 = 2_048;

/// Sandbox CPU limit (cores).
pub const SANDBOX_CPU_LIMIT: f64 = 2.0;

/// Length of the generated remediation id.
pub const REMEDIATION_ID_LEN: usize = 8;

/// Container image running the AI coding agent.
pub const SANDBOX_IMAGE: &str = "ghcr.io/anomalyco/opencode:latest";

/// Address the sandboxed job reports back to.
pub const CALLBACK_URL: &str = "http://host.docker.internal:8080";

// ============================================================================
// Event Bus
// ============================================================================

/// Envelopes buffered per subscriber before it lags and is resynced with a snapshot.
pub const SUBSCRIBER_BUFFER: usize = 64;

// ============================================================================
// Sandbox HTTP client
// ============================================================================

/// Timeout for short Docker Engine calls (create, start, stop) in seconds.
pub const DOCKER_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Timeout for image pulls (seconds).
pub const DOCKER_PULL_TIMEOUT_SECS: u64 = 300;

/// TCP connect timeout for the Docker Engine endpoint (seconds).
pub const DOCKER_CONNECT_TIMEOUT_SECS: u64 = 5;
