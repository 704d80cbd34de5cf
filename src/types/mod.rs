//! Shared data structures for heartbeat monitoring and remediation
//!
//! This module defines the records the registry and ledger own:
//! - `ServiceRecord` + `LogEntry`: live status, uptime counters, bounded logs
//! - `HeartbeatRequest` + `LogData`: normalized heartbeat input
//! - `RemediationRecord` + `AgentReport`: remediation lifecycle and self-report

mod service;
mod remediation;

pub use service::*;
pub use remediation::*;

use std::collections::VecDeque;

/// Append `item`, dropping from the front until at most `capacity` remain.
///
/// Relative order of the retained entries is preserved.
pub(crate) fn push_bounded<T>(buf: &mut VecDeque<T>, item: T, capacity: usize) {
    buf.push_back(item);
    while buf.len() > capacity {
        buf.pop_front();
    }
}
