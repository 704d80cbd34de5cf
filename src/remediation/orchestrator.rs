//! Remediation Orchestrator - drives one sandboxed attempt end to end
//!
//! The whole attempt, pull through exit, runs against one deadline. Exit
//! status, runtime errors and the deadline race in a `select!`; the first
//! to fire decides the single terminal ledger write. Failures end the
//! attempt only and are returned to the caller, never panicked.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use super::ledger::{LedgerError, RemediationLedger};
use super::redact::Redactor;
use super::script::{self, SeedContext};
use super::{new_remediation_id, Credentials};
use crate::config::RemediationConfig;
use crate::events::{EventBus, EventKind};
use crate::sandbox::{
    LineSplitter, SandboxBackend, SandboxError, SandboxHandle, SandboxSpec,
};
use crate::types::{RemediationRecord, RemediationStatus};

/// Hosts-file entry that lets the sandbox reach the callback address.
const CALLBACK_HOST: &str = "host.docker.internal:host-gateway";

const SANDBOX_WORKDIR: &str = "/workspace";

/// Why an attempt did not succeed
#[derive(Debug, thiserror::Error)]
pub enum RemediationError {
    #[error("{reason}")]
    Prerequisite { id: String, reason: String },

    #[error("{source}")]
    Infrastructure {
        id: String,
        #[source]
        source: SandboxError,
    },

    #[error("deadline exceeded")]
    TimedOut { id: String },

    #[error("sandbox exited with code {exit_code}")]
    Failed { id: String, exit_code: i64 },
}

impl RemediationError {
    /// Ledger id of the attempt that failed
    pub fn id(&self) -> &str {
        match self {
            Self::Prerequisite { id, .. }
            | Self::Infrastructure { id, .. }
            | Self::TimedOut { id }
            | Self::Failed { id, .. } => id,
        }
    }
}

/// A successful attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemediationOutcome {
    pub id: String,
    pub sandbox: SandboxHandle,
    pub exit_code: i64,
}

/// Runs remediation attempts against an injected sandbox backend
pub struct RemediationOrchestrator {
    ledger: Arc<RemediationLedger>,
    backend: Option<Arc<dyn SandboxBackend>>,
    credentials: Credentials,
    settings: RemediationConfig,
    events: Arc<EventBus>,
    redactor: Arc<Redactor>,
}

impl std::fmt::Debug for RemediationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemediationOrchestrator")
            .field("backend", &self.backend.as_ref().map(|b| b.name().to_string()))
            .field("credentials", &self.credentials)
            .field("image", &self.settings.image)
            .field("deadline_secs", &self.settings.deadline_secs)
            .finish_non_exhaustive()
    }
}

impl RemediationOrchestrator {
    pub fn new(
        ledger: Arc<RemediationLedger>,
        backend: Option<Arc<dyn SandboxBackend>>,
        credentials: Credentials,
        settings: RemediationConfig,
        events: Arc<EventBus>,
    ) -> Self {
        let redactor = Redactor::new(&[credentials.scm_token(), credentials.agent_api_key()]);
        info!(
            backend = backend.as_ref().map_or("none", |b| b.name()),
            image = %settings.image,
            callback_url = %settings.callback_url,
            scm_token_set = credentials.has_scm_token(),
            agent_api_key_set = credentials.has_agent_api_key(),
            "Remediation orchestrator initialized"
        );
        Self {
            ledger,
            backend,
            credentials,
            settings,
            events,
            redactor: Arc::new(redactor),
        }
    }

    pub fn ledger(&self) -> &Arc<RemediationLedger> {
        &self.ledger
    }

    /// Run one attempt for `service`, returning once it reached a terminal status.
    pub async fn run(
        &self,
        service: &str,
        repo: &str,
        error_log: &str,
    ) -> Result<RemediationOutcome, RemediationError> {
        let id = new_remediation_id();
        let record = self.ledger.create(&id, service, repo, error_log);
        self.publish(&record);
        info!(remediation_id = %id, service, repo, "Starting remediation");

        let backend = match self.check_prerequisites() {
            Ok(backend) => backend,
            Err(reason) => {
                error!(remediation_id = %id, %reason, "Remediation prerequisites missing");
                self.record(self.ledger.complete(&id, false, -1, &reason));
                return Err(RemediationError::Prerequisite { id, reason });
            }
        };

        let deadline = Instant::now() + self.settings.deadline();
        let ctx = SeedContext {
            remediation_id: &id,
            service_name: service,
            repo_url: repo,
            error_log,
        };
        self.drive(&id, backend, &ctx, deadline).await
    }

    fn check_prerequisites(&self) -> Result<Arc<dyn SandboxBackend>, String> {
        let backend = self
            .backend
            .clone()
            .ok_or_else(|| "sandbox backend not available".to_string())?;
        if !self.credentials.has_scm_token() {
            return Err(format!("{} not set", super::SCM_TOKEN_ENV));
        }
        if !self.credentials.has_agent_api_key() {
            return Err(format!("{} not set", super::AGENT_API_KEY_ENV));
        }
        Ok(backend)
    }

    fn sandbox_spec(&self, ctx: &SeedContext<'_>) -> SandboxSpec {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let nano_cpus = (self.settings.cpu_limit * 1e9) as u64;
        SandboxSpec {
            name: format!("pulsewatch-fix-{}", ctx.remediation_id),
            image: self.settings.image.clone(),
            entrypoint: script::ENTRYPOINT.iter().map(|s| (*s).to_string()).collect(),
            command: vec![script::SEED_SCRIPT.to_string()],
            env: script::seed_env(ctx, &self.settings, &self.credentials),
            working_dir: SANDBOX_WORKDIR.to_string(),
            memory_limit_bytes: self.settings.memory_limit_mb * 1024 * 1024,
            nano_cpus,
            extra_hosts: vec![CALLBACK_HOST.to_string()],
        }
    }

    async fn drive(
        &self,
        id: &str,
        backend: Arc<dyn SandboxBackend>,
        ctx: &SeedContext<'_>,
        deadline: Instant,
    ) -> Result<RemediationOutcome, RemediationError> {
        // Pull: best effort, a cached image is good enough
        let image = &self.settings.image;
        debug!(remediation_id = %id, image = %image, "Pulling sandbox image");
        match timeout_at(deadline, backend.pull_image(image)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(remediation_id = %id, error = %e, "Image pull failed, using cached image");
            }
            Err(_) => return Err(self.expire(id, &backend, None).await),
        }

        // Create
        let spec = self.sandbox_spec(ctx);
        let handle = match timeout_at(deadline, backend.create(&spec)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(self.infrastructure(id, e)),
            Err(_) => return Err(self.expire(id, &backend, None).await),
        };
        info!(remediation_id = %id, sandbox_id = %handle.id, sandbox = %handle.name, "Sandbox created");
        self.record(self.ledger.update_status(
            id,
            RemediationStatus::Pending,
            &handle.id,
            &handle.name,
        ));

        // Start; running only once the runtime confirms
        match timeout_at(deadline, backend.start(&handle.id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.infrastructure(id, e)),
            Err(_) => return Err(self.expire(id, &backend, Some(&handle)).await),
        }
        self.record(self.ledger.update_status(id, RemediationStatus::Running, "", ""));
        info!(remediation_id = %id, sandbox_id = %handle.id, "Sandbox started, agent working");

        let relay = tokio::spawn(relay_logs(
            Arc::clone(&backend),
            handle.id.clone(),
            id.to_string(),
            Arc::clone(&self.redactor),
            deadline,
        ));

        let (exit_tx, exit_rx) = oneshot::channel::<i64>();
        let (err_tx, err_rx) = oneshot::channel::<SandboxError>();
        let waiter = {
            let backend = Arc::clone(&backend);
            let sandbox_id = handle.id.clone();
            tokio::spawn(async move {
                match backend.wait(&sandbox_id).await {
                    Ok(code) => {
                        let _ = exit_tx.send(code);
                    }
                    Err(e) => {
                        let _ = err_tx.send(e);
                    }
                }
            })
        };

        tokio::select! {
            Ok(exit_code) = exit_rx => {
                if exit_code == 0 {
                    info!(remediation_id = %id, "Sandbox completed successfully");
                    self.record(self.ledger.complete(id, true, 0, ""));
                    Ok(RemediationOutcome {
                        id: id.to_string(),
                        sandbox: handle,
                        exit_code,
                    })
                } else {
                    error!(remediation_id = %id, exit_code, "Sandbox failed");
                    let message = format!("sandbox exited with code {exit_code}");
                    self.record(self.ledger.complete(id, false, exit_code, &message));
                    Err(RemediationError::Failed {
                        id: id.to_string(),
                        exit_code,
                    })
                }
            }
            Ok(e) = err_rx => {
                relay.abort();
                Err(self.infrastructure(id, e))
            }
            () = sleep_until(deadline) => {
                waiter.abort();
                relay.abort();
                Err(self.expire(id, &backend, Some(&handle)).await)
            }
        }
    }

    /// Terminal failure for a sandbox runtime error.
    fn infrastructure(&self, id: &str, source: SandboxError) -> RemediationError {
        error!(remediation_id = %id, error = %source, "Remediation infrastructure failure");
        self.record(self.ledger.complete(id, false, -1, &source.to_string()));
        RemediationError::Infrastructure {
            id: id.to_string(),
            source,
        }
    }

    /// Terminal timeout: record it, then ask the sandbox (if any) to stop.
    async fn expire(
        &self,
        id: &str,
        backend: &Arc<dyn SandboxBackend>,
        handle: Option<&SandboxHandle>,
    ) -> RemediationError {
        error!(remediation_id = %id, deadline_secs = self.settings.deadline_secs, "Remediation timed out");
        self.record(self.ledger.set_timed_out(id));
        if let Some(handle) = handle {
            if let Err(e) = backend.stop(&handle.id, self.settings.stop_grace()).await {
                warn!(remediation_id = %id, sandbox_id = %handle.id, error = %e, "Failed to stop sandbox after timeout");
            }
        }
        RemediationError::TimedOut { id: id.to_string() }
    }

    /// Broadcast a ledger transition, or log why it was refused.
    fn record(&self, result: Result<RemediationRecord, LedgerError>) {
        match result {
            Ok(record) => self.publish(&record),
            Err(e) => warn!(error = %e, "Ledger transition refused"),
        }
    }

    fn publish(&self, record: &RemediationRecord) {
        self.events.broadcast(EventKind::RemediationUpdate, record);
    }
}

/// Follow sandbox output and relay it line by line until the stream ends
/// or the deadline passes. Failures are logged and never reach the waiter.
async fn relay_logs(
    backend: Arc<dyn SandboxBackend>,
    sandbox_id: String,
    remediation_id: String,
    redactor: Arc<Redactor>,
    deadline: Instant,
) {
    let relay = async {
        let mut stream = match backend.stream_logs(&sandbox_id).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(remediation_id = %remediation_id, error = %e, "Could not attach to sandbox logs");
                return;
            }
        };

        let mut splitter = LineSplitter::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(frame) => {
                    for (channel, line) in splitter.push(&frame) {
                        info!(
                            target: "pulsewatch::sandbox",
                            remediation_id = %remediation_id,
                            %channel,
                            "{}",
                            redactor.redact(&line)
                        );
                    }
                }
                Err(e) => {
                    warn!(remediation_id = %remediation_id, error = %e, "Sandbox log stream failed");
                    break;
                }
            }
        }
        for (channel, line) in splitter.finish() {
            info!(
                target: "pulsewatch::sandbox",
                remediation_id = %remediation_id,
                %channel,
                "{}",
                redactor.redact(&line)
            );
        }
    };

    if timeout_at(deadline, relay).await.is_err() {
        debug!(remediation_id = %remediation_id, "Log relay stopped at deadline");
    }
}
