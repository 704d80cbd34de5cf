//! Remediation Ledger - bounded, ordered history of remediation attempts
//!
//! Records live in a map keyed by id; a FIFO of ids tracks insertion order
//! so the oldest attempt is evicted once the ledger is full. Terminal
//! transitions are written once: any later status or completion write is
//! refused with [`LedgerError::AlreadyTerminal`].

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::config::defaults::LEDGER_CAPACITY;
use crate::types::{AgentReport, RemediationRecord, RemediationStatus};

/// Error message stored on a record whose deadline elapsed.
pub const TIMED_OUT_MESSAGE: &str = "Remediation timed out before the sandbox finished";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("remediation not found: {0}")]
    NotFound(String),

    #[error("remediation {id} already finished as {status}")]
    AlreadyTerminal {
        id: String,
        status: RemediationStatus,
    },

    #[error("cannot move remediation {id} to {status} via a status update")]
    InvalidTransition {
        id: String,
        status: RemediationStatus,
    },
}

#[derive(Debug, Default)]
struct LedgerInner {
    records: HashMap<String, RemediationRecord>,
    order: VecDeque<String>,
}

/// Bounded history of remediation attempts, newest last internally
#[derive(Debug)]
pub struct RemediationLedger {
    inner: RwLock<LedgerInner>,
    capacity: usize,
}

impl Default for RemediationLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl RemediationLedger {
    pub fn new() -> Self {
        Self::with_capacity(LEDGER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(LedgerInner::default()),
            capacity: capacity.max(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerInner> {
        self.inner.read().unwrap_or_else(|e| {
            warn!("RwLock poisoned on RemediationLedger read, recovering");
            e.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerInner> {
        self.inner.write().unwrap_or_else(|e| {
            warn!("RwLock poisoned on RemediationLedger write, recovering");
            e.into_inner()
        })
    }

    /// Open a new attempt in `pending`, evicting the oldest record on overflow.
    pub fn create(
        &self,
        id: &str,
        service_name: &str,
        github_repo: &str,
        error_log: &str,
    ) -> RemediationRecord {
        let record = RemediationRecord::new(id, service_name, github_repo, error_log);
        let mut inner = self.write();

        if inner.records.insert(id.to_string(), record.clone()).is_some() {
            warn!(remediation_id = %id, "Remediation id reused, previous record replaced");
            inner.order.retain(|existing| existing != id);
        }
        inner.order.push_back(id.to_string());

        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.records.remove(&evicted);
                debug!(remediation_id = %evicted, "Evicted oldest remediation record");
            }
        }
        record
    }

    /// Move a live attempt to `pending` or `running`.
    ///
    /// Empty sandbox fields leave the stored values untouched, so the call is
    /// safe to repeat.
    pub fn update_status(
        &self,
        id: &str,
        status: RemediationStatus,
        sandbox_id: &str,
        sandbox_name: &str,
    ) -> Result<RemediationRecord, LedgerError> {
        if status.is_terminal() {
            return Err(LedgerError::InvalidTransition {
                id: id.to_string(),
                status,
            });
        }
        let mut inner = self.write();
        let record = live_record(&mut inner, id)?;
        record.status = status;
        if !sandbox_id.is_empty() {
            record.sandbox_id = sandbox_id.to_string();
        }
        if !sandbox_name.is_empty() {
            record.sandbox_name = sandbox_name.to_string();
        }
        Ok(record.clone())
    }

    /// Terminal transition to `success` or `failed`.
    pub fn complete(
        &self,
        id: &str,
        success: bool,
        exit_code: i64,
        error_message: &str,
    ) -> Result<RemediationRecord, LedgerError> {
        self.complete_at(id, success, exit_code, error_message, Utc::now())
    }

    pub(crate) fn complete_at(
        &self,
        id: &str,
        success: bool,
        exit_code: i64,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<RemediationRecord, LedgerError> {
        let status = if success {
            RemediationStatus::Success
        } else {
            RemediationStatus::Failed
        };
        let mut inner = self.write();
        let record = live_record(&mut inner, id)?;
        record.finish(status, exit_code, error_message.to_string(), now);
        Ok(record.clone())
    }

    /// Terminal transition to `timed_out`. The exit code is recorded as -1.
    pub fn set_timed_out(&self, id: &str) -> Result<RemediationRecord, LedgerError> {
        let mut inner = self.write();
        let record = live_record(&mut inner, id)?;
        record.finish(
            RemediationStatus::TimedOut,
            -1,
            TIMED_OUT_MESSAGE.to_string(),
            Utc::now(),
        );
        Ok(record.clone())
    }

    /// Attach a self-report whatever the current status. Returns `false`
    /// when the id is unknown.
    pub fn add_agent_report(&self, id: &str, report: AgentReport) -> bool {
        let mut inner = self.write();
        match inner.records.get_mut(id) {
            Some(record) => {
                record.agent_report = Some(report);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Result<RemediationRecord, LedgerError> {
        self.read()
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))
    }

    /// Every retained record, newest first.
    pub fn get_all(&self) -> Vec<RemediationRecord> {
        let inner = self.read();
        inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.records.get(id))
            .cloned()
            .collect()
    }

    /// Retained records for one service, newest first.
    pub fn get_by_service(&self, service_name: &str) -> Vec<RemediationRecord> {
        let inner = self.read();
        inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.records.get(id))
            .filter(|r| r.service_name == service_name)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().order.is_empty()
    }
}

fn live_record<'a>(
    inner: &'a mut LedgerInner,
    id: &str,
) -> Result<&'a mut RemediationRecord, LedgerError> {
    let record = inner
        .records
        .get_mut(id)
        .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
    if record.status.is_terminal() {
        return Err(LedgerError::AlreadyTerminal {
            id: id.to_string(),
            status: record.status,
        });
    }
    Ok(record)
}
