//! Pulsewatch: heartbeat monitoring with sandboxed auto-remediation
//!
//! ## Architecture
//!
//! - **Health Registry**: per-service status, uptime and bounded log history
//! - **Timeout Sweeper**: marks services down when heartbeats stop
//! - **Event Bus**: non-blocking fan-out of state changes to live subscribers
//! - **Remediation**: bounded attempt ledger plus an orchestrator that runs a
//!   coding agent in a sandbox against the failing service's repository
//! - **API**: axum REST endpoints and a WebSocket event stream

pub mod api;
pub mod background;
pub mod config;
pub mod events;
pub mod monitor;
pub mod registry;
pub mod remediation;
pub mod sandbox;
pub mod types;

pub use config::PulseConfig;
pub use events::{EventBus, EventKind, Subscription};
pub use monitor::Monitor;
pub use registry::{HealthRegistry, MonitorError, SweepOutcome};
pub use remediation::{Credentials, RemediationLedger, RemediationOrchestrator};
pub use sandbox::{DockerEngine, SandboxBackend};
pub use types::{
    AgentReport, HeartbeatRequest, RemediationRecord, RemediationStatus, ServiceRecord,
    ServiceStatus,
};
