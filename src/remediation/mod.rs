//! Auto-remediation: attempt ledger, sandbox orchestration, seeding script
//!
//! ```text
//! trigger -> ledger.create (pending)
//!         -> validate -> pull -> create (pending + sandbox id) -> start (running)
//!         -> logs || wait || deadline -> success | failed | timed_out
//! ```
//!
//! Self-reports from the sandbox arrive out of band and attach to the ledger
//! record whatever its status.

pub mod ledger;
mod orchestrator;
pub mod redact;
pub mod script;

pub use ledger::{LedgerError, RemediationLedger};
pub use orchestrator::{RemediationError, RemediationOrchestrator, RemediationOutcome};

use crate::config::defaults::REMEDIATION_ID_LEN;

/// Environment variable holding the source-control token.
pub const SCM_TOKEN_ENV: &str = "PULSEWATCH_SCM_TOKEN";

/// Environment variable holding the AI agent service key.
pub const AGENT_API_KEY_ENV: &str = "PULSEWATCH_AGENT_API_KEY";

/// Opaque credentials handed to every sandbox. Never printed.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    scm_token: String,
    agent_api_key: String,
}

impl Credentials {
    pub fn new(scm_token: impl Into<String>, agent_api_key: impl Into<String>) -> Self {
        Self {
            scm_token: scm_token.into(),
            agent_api_key: agent_api_key.into(),
        }
    }

    /// Read both credentials from the process environment; unset means empty.
    pub fn from_env() -> Self {
        Self::new(
            std::env::var(SCM_TOKEN_ENV).unwrap_or_default(),
            std::env::var(AGENT_API_KEY_ENV).unwrap_or_default(),
        )
    }

    pub fn scm_token(&self) -> &str {
        &self.scm_token
    }

    pub fn agent_api_key(&self) -> &str {
        &self.agent_api_key
    }

    pub fn has_scm_token(&self) -> bool {
        !self.scm_token.trim().is_empty()
    }

    pub fn has_agent_api_key(&self) -> bool {
        !self.agent_api_key.trim().is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("scm_token_set", &self.has_scm_token())
            .field("agent_api_key_set", &self.has_agent_api_key())
            .finish()
    }
}

/// Short random id for a new attempt.
pub fn new_remediation_id() -> String {
    uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(REMEDIATION_ID_LEN)
        .collect()
}
