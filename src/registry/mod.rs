//! Health Registry - live status of every monitored service
//!
//! One `RwLock` guards the whole map. Mutations are small (an upsert plus a
//! bounded append) so coarse locking is enough, and a sweep applies its batch
//! under the same write lock so it never interleaves with a heartbeat for the
//! same service. Every read hands out a cloned snapshot.

pub mod messages;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::types::{HeartbeatRequest, LogEntry, LogKind, ServiceRecord, ServiceStatus};

/// Errors surfaced by registry lookups and heartbeat validation
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error("invalid heartbeat: {0}")]
    Validation(String),

    #[error("service not found: {0}")]
    NotFound(String),
}

/// Result of one staleness sweep
#[derive(Debug, Clone, Default)]
pub struct SweepOutcome {
    /// Services that transitioned to `down` on this sweep
    pub newly_down: Vec<ServiceRecord>,
    /// Every record whose derived fields changed (to broadcast)
    pub changed: Vec<ServiceRecord>,
}

impl SweepOutcome {
    pub fn is_empty(&self) -> bool {
        self.newly_down.is_empty() && self.changed.is_empty()
    }
}

/// Concurrent map of service name to service record
#[derive(Debug, Default)]
pub struct HealthRegistry {
    services: RwLock<HashMap<String, ServiceRecord>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ServiceRecord>> {
        self.services.read().unwrap_or_else(|e| {
            warn!("RwLock poisoned on HealthRegistry read, recovering");
            e.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ServiceRecord>> {
        self.services.write().unwrap_or_else(|e| {
            warn!("RwLock poisoned on HealthRegistry write, recovering");
            e.into_inner()
        })
    }

    /// Record a heartbeat received now.
    pub fn record_heartbeat(&self, req: &HeartbeatRequest) -> Result<ServiceRecord, MonitorError> {
        self.record_heartbeat_at(req, Utc::now())
    }

    /// Record a heartbeat with an explicit receive time.
    ///
    /// Upserts the record, bumps the check counters, appends one log entry
    /// and recomputes uptime. Returns a snapshot of the updated record.
    pub fn record_heartbeat_at(
        &self,
        req: &HeartbeatRequest,
        now: DateTime<Utc>,
    ) -> Result<ServiceRecord, MonitorError> {
        if req.service_name.is_empty() {
            return Err(MonitorError::Validation(
                "service_name is required".to_string(),
            ));
        }

        let mut services = self.write();
        let record = services
            .entry(req.service_name.clone())
            .or_insert_with(|| ServiceRecord::new(&req.service_name, &req.github_repo, now));

        record.github_repo.clone_from(&req.github_repo);
        record.last_heartbeat = now;
        record.total_checks += 1;

        let event = req.log_data.as_ref();
        let entry = if req.is_healthy() {
            record.status = ServiceStatus::Healthy;
            record.success_checks += 1;
            record.last_error.clear();
            let message = event.map_or_else(
                || messages::HEALTHY_MESSAGE.to_string(),
                messages::describe_event,
            );
            LogEntry::new(now, LogKind::Heartbeat, message)
        } else {
            record.status = ServiceStatus::Error;
            record.last_error.clone_from(&req.error_log);
            let message = if !req.error_log.is_empty() {
                req.error_log.clone()
            } else if let Some(data) = event {
                messages::describe_event(data)
            } else {
                messages::ERROR_FALLBACK_MESSAGE.to_string()
            };
            LogEntry::new(now, LogKind::Error, message)
        };
        record.push_log(entry.with_event(event));
        record.recompute_uptime();

        debug!(
            service = %record.name,
            status = %record.status,
            uptime = record.uptime_percent,
            "Heartbeat recorded"
        );
        Ok(record.clone())
    }

    pub fn get_service(&self, name: &str) -> Result<ServiceRecord, MonitorError> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| MonitorError::NotFound(name.to_string()))
    }

    /// Snapshot of every record, sorted by service name.
    pub fn get_all(&self) -> Vec<ServiceRecord> {
        let mut all: Vec<ServiceRecord> = self.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Append a remediation line to both the remediation log and the
    /// structured log. Unknown services are ignored.
    pub fn add_remediation_log(&self, name: &str, line: &str) -> Option<ServiceRecord> {
        let mut services = self.write();
        let Some(record) = services.get_mut(name) else {
            debug!(service = %name, "Remediation log for unknown service dropped");
            return None;
        };
        record.push_remediation_log(line.to_string());
        record.push_log(LogEntry::new(Utc::now(), LogKind::Remediation, line));
        Some(record.clone())
    }

    /// Mark every non-down service whose last heartbeat is older than
    /// `threshold` as down.
    ///
    /// A down transition counts as a failed check. Records already down are
    /// never touched, so repeated sweeps over an unchanged world are empty.
    pub fn mark_stale(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let mut services = self.write();

        for record in services.values_mut() {
            if record.status == ServiceStatus::Down || !record.is_stale(now, threshold) {
                continue;
            }
            record.status = ServiceStatus::Down;
            record.total_checks += 1;
            record.recompute_uptime();
            record.push_log(LogEntry::new(now, LogKind::Status, messages::DOWN_MESSAGE));

            let snapshot = record.clone();
            outcome.changed.push(snapshot.clone());
            outcome.newly_down.push(snapshot);
        }

        outcome.newly_down.sort_by(|a, b| a.name.cmp(&b.name));
        outcome.changed.sort_by(|a, b| a.name.cmp(&b.name));
        outcome
    }
}
