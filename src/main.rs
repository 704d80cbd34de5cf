//! Pulsewatch - heartbeat monitor with sandboxed auto-remediation
//!
//! # Usage
//!
//! ```bash
//! # Defaults: listen on 0.0.0.0:8080, 30s heartbeat timeout
//! cargo run --release
//!
//! # Remote Docker Engine for remediation sandboxes
//! DOCKER_HOST=tcp://127.0.0.1:2375 ./pulsewatch --heartbeat-timeout 45s
//! ```
//!
//! # Environment Variables
//!
//! - `PULSEWATCH_CONFIG`: Path to a `pulsewatch.toml` (default: `./pulsewatch.toml`)
//! - `PULSEWATCH_SCM_TOKEN`: Source-control token handed to sandboxes
//! - `PULSEWATCH_AGENT_API_KEY`: AI agent service key handed to sandboxes
//! - `PULSEWATCH_CORS_ORIGINS`: Comma-separated origins allowed by CORS
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pulsewatch::api::{create_app, MonitorState};
use pulsewatch::config::{self, PulseConfig};
use pulsewatch::remediation::Credentials;
use pulsewatch::sandbox::{DockerEngine, SandboxBackend};
use pulsewatch::Monitor;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "pulsewatch")]
#[command(about = "Heartbeat monitor with live uptime tracking and auto-remediation")]
#[command(version)]
struct CliArgs {
    /// Override the server address (default: "0.0.0.0:8080")
    #[arg(short, long, env = "PULSEWATCH_ADDR")]
    addr: Option<String>,

    /// Silence after which a service is marked down, e.g. "30" or "30s"
    #[arg(long, env = "HEARTBEAT_TIMEOUT", value_parser = config::parse_secs)]
    heartbeat_timeout: Option<u64>,

    /// Docker Engine endpoint for remediation sandboxes (tcp:// or http://)
    #[arg(long, env = "DOCKER_HOST")]
    docker_host: Option<String>,

    /// Sandbox image override
    #[arg(long, env = "PULSEWATCH_IMAGE")]
    image: Option<String>,

    /// Address sandboxes use to reach this server
    #[arg(long, env = "PULSEWATCH_CALLBACK_URL")]
    callback_url: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl CliArgs {
    /// Apply command-line and environment overrides on top of the file config.
    fn apply(&self, config: &mut PulseConfig) {
        if let Some(addr) = &self.addr {
            config.server.addr.clone_from(addr);
        }
        if let Some(secs) = self.heartbeat_timeout {
            config.monitor.heartbeat_timeout_secs = secs;
        }
        if let Some(host) = &self.docker_host {
            config.remediation.docker_host = Some(host.clone());
        }
        if let Some(image) = &self.image {
            config.remediation.image.clone_from(image);
        }
        if let Some(url) = &self.callback_url {
            config.remediation.callback_url.clone_from(url);
        }
    }
}

// ============================================================================
// Task Supervision
// ============================================================================

/// Time allowed for open connections to drain after shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
enum TaskName {
    HttpServer,
    TimeoutSweeper,
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HttpServer => write!(f, "HttpServer"),
            Self::TimeoutSweeper => write!(f, "TimeoutSweeper"),
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

/// Connect the sandbox backend, or run without one.
///
/// A missing or unusable endpoint is not fatal: every remediation attempt
/// then fails its prerequisite check instead.
fn init_backend(config: &PulseConfig) -> Option<Arc<dyn SandboxBackend>> {
    match DockerEngine::from_config(config.remediation.docker_host.as_deref()) {
        Some(Ok(engine)) => Some(Arc::new(engine)),
        Some(Err(e)) => {
            warn!(error = %e, "Docker endpoint unusable, auto-remediation disabled");
            None
        }
        None => {
            warn!("No Docker endpoint configured, auto-remediation disabled");
            None
        }
    }
}

/// Spawn the HTTP server task into the JoinSet.
fn spawn_http_server(
    task_set: &mut JoinSet<Result<TaskName>>,
    listener: tokio::net::TcpListener,
    app: axum::Router,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        info!("[HttpServer] Task starting");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                info!("[HttpServer] Received shutdown signal");
            })
            .await;

        match result {
            Ok(()) => {
                info!("[HttpServer] Graceful shutdown complete");
                Ok(TaskName::HttpServer)
            }
            Err(e) => {
                error!("[HttpServer] Server error: {}", e);
                Err(anyhow::anyhow!("HTTP server error: {}", e))
            }
        }
    });
}

/// Spawn the staleness sweeper into the JoinSet.
fn spawn_sweeper(
    task_set: &mut JoinSet<Result<TaskName>>,
    monitor: Arc<Monitor>,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        monitor.run_sweeper(cancel_token).await;
        Ok(TaskName::TimeoutSweeper)
    });
}

/// Run the supervisor loop: watch tasks, cancel everything on failure.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("Supervisor: all tasks spawned, monitoring");

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Supervisor: shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("Supervisor: task {} completed normally", task_name);
                    }
                    Some(Ok(Err(e))) => {
                        error!("Supervisor: task failed with error: {}", e);
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!("Supervisor: task panicked: {}", e);
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => {
                        info!("Supervisor: all tasks completed");
                        break;
                    }
                }
            }
        }
    }

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while let Some(result) = task_set.join_next().await {
            if let Ok(Err(e)) = result {
                warn!("Task ended with error during shutdown: {}", e);
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("Tasks still running after {:?}, aborting", SHUTDOWN_GRACE);
        task_set.abort_all();
    }
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = CliArgs::parse();
    init_tracing(args.log_json);

    let mut pulse_config = PulseConfig::load();
    args.apply(&mut pulse_config);
    pulse_config
        .validate()
        .context("Invalid configuration after applying overrides")?;

    let credentials = Credentials::from_env();
    if !credentials.has_scm_token() || !credentials.has_agent_api_key() {
        warn!(
            scm_token_set = credentials.has_scm_token(),
            agent_api_key_set = credentials.has_agent_api_key(),
            "Remediation credentials incomplete, attempts will fail their prerequisite check"
        );
    }

    let backend = init_backend(&pulse_config);
    let monitor = Arc::new(Monitor::new(&pulse_config, backend, credentials));
    let app = create_app(MonitorState::new(Arc::clone(&monitor)));

    let addr = pulse_config.server.addr.as_str();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    info!(
        addr,
        heartbeat_timeout_secs = pulse_config.monitor.heartbeat_timeout_secs,
        sweep_interval_secs = pulse_config.monitor.sweep_interval_secs,
        "Pulsewatch listening"
    );

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown");
        shutdown_token.cancel();
    });

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();
    spawn_http_server(&mut task_set, listener, app, cancel_token.clone());
    spawn_sweeper(&mut task_set, monitor, cancel_token.clone());

    run_supervisor(&mut task_set, cancel_token).await
}
