//! Sandbox execution backends
//!
//! The orchestrator only sees [`SandboxBackend`]: pull an image, create and
//! start an isolated job, follow its output as [`LogFrame`]s, wait for its
//! exit, stop it. Wire details (such as the Docker Engine's multiplexed log
//! framing) stay inside the backend.

pub mod demux;
pub mod docker;

pub use docker::DockerEngine;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use std::time::Duration;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to pull image {image}: {message}")]
    Pull { image: String, message: String },

    #[error("failed to create sandbox: {0}")]
    Create(String),

    #[error("failed to start sandbox: {0}")]
    Start(String),

    #[error("error waiting for sandbox: {0}")]
    Wait(String),

    #[error("failed to read sandbox logs: {0}")]
    Logs(String),

    #[error("failed to stop sandbox: {0}")]
    Stop(String),

    #[error("invalid sandbox endpoint: {0}")]
    Endpoint(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed log stream: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Job Description
// ============================================================================

/// Everything needed to create one sandboxed job.
///
/// Per-attempt values travel in `env`, never in `command`, so they do not
/// show up in process listings.
#[derive(Clone, PartialEq)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    pub entrypoint: Vec<String>,
    /// Arguments handed to the entrypoint
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: String,
    pub memory_limit_bytes: u64,
    /// CPU limit in billionths of a core
    pub nano_cpus: u64,
    /// `host:ip` entries added to the sandbox's hosts file
    pub extra_hosts: Vec<String>,
}

impl std::fmt::Debug for SandboxSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("SandboxSpec")
            .field("name", &self.name)
            .field("image", &self.image)
            .field("entrypoint", &self.entrypoint)
            .field("env", &env_keys)
            .field("working_dir", &self.working_dir)
            .field("memory_limit_bytes", &self.memory_limit_bytes)
            .field("nano_cpus", &self.nano_cpus)
            .finish_non_exhaustive()
    }
}

/// Identity of a created sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub id: String,
    pub name: String,
}

// ============================================================================
// Log Frames
// ============================================================================

/// Output channel a frame was written to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputChannel {
    Stdin,
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputChannel::Stdin => write!(f, "stdin"),
            OutputChannel::Stdout => write!(f, "stdout"),
            OutputChannel::Stderr => write!(f, "stderr"),
        }
    }
}

/// One chunk of sandbox output. Chunks are not line-aligned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    pub channel: OutputChannel,
    pub payload: Bytes,
}

pub type LogStream = BoxStream<'static, Result<LogFrame, SandboxError>>;

/// Reassembles chunked output into complete lines, one buffer per channel.
///
/// Trailing `\r` is trimmed and blank lines are skipped.
#[derive(Debug, Default)]
pub struct LineSplitter {
    stdout: BytesMut,
    stderr: BytesMut,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame and return the lines it completed.
    pub fn push(&mut self, frame: &LogFrame) -> Vec<(OutputChannel, String)> {
        let buf = match frame.channel {
            OutputChannel::Stderr => &mut self.stderr,
            OutputChannel::Stdout | OutputChannel::Stdin => &mut self.stdout,
        };
        buf.extend_from_slice(&frame.payload);

        let mut lines = Vec::new();
        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let raw = buf.split_to(pos + 1);
            if let Some(line) = clean_line(&raw[..pos]) {
                lines.push((frame.channel, line));
            }
        }
        lines
    }

    /// Drain whatever partial lines remain once the stream has ended.
    pub fn finish(&mut self) -> Vec<(OutputChannel, String)> {
        let mut lines = Vec::new();
        for (channel, buf) in [
            (OutputChannel::Stdout, &mut self.stdout),
            (OutputChannel::Stderr, &mut self.stderr),
        ] {
            let raw = buf.split();
            if let Some(line) = clean_line(&raw) {
                lines.push((channel, line));
            }
        }
        lines
    }
}

fn clean_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches('\r');
    if text.trim().is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

// ============================================================================
// Backend Trait
// ============================================================================

/// Isolated job runtime used by the remediation orchestrator
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Refresh `image` from its registry.
    async fn pull_image(&self, image: &str) -> Result<(), SandboxError>;

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError>;

    /// Start a created sandbox. Returns once the runtime confirms the start.
    async fn start(&self, id: &str) -> Result<(), SandboxError>;

    /// Follow the sandbox's output until it exits.
    async fn stream_logs(&self, id: &str) -> Result<LogStream, SandboxError>;

    /// Block until the sandbox exits and return its exit code.
    async fn wait(&self, id: &str) -> Result<i64, SandboxError>;

    /// Ask the sandbox to stop, killing it after `grace`.
    async fn stop(&self, id: &str, grace: Duration) -> Result<(), SandboxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(channel: OutputChannel, text: &str) -> LogFrame {
        LogFrame {
            channel,
            payload: Bytes::copy_from_slice(text.as_bytes()),
        }
    }

    #[test]
    fn test_lines_split_across_frames() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(&frame(OutputChannel::Stdout, "clon")).is_empty());
        let lines = splitter.push(&frame(OutputChannel::Stdout, "ing repo\r\n\nbuild"));
        assert_eq!(lines, vec![(OutputChannel::Stdout, "cloning repo".to_string())]);
        assert_eq!(
            splitter.finish(),
            vec![(OutputChannel::Stdout, "build".to_string())]
        );
    }

    #[test]
    fn test_channels_buffer_independently() {
        let mut splitter = LineSplitter::new();
        splitter.push(&frame(OutputChannel::Stdout, "out-"));
        let err = splitter.push(&frame(OutputChannel::Stderr, "warning\n"));
        assert_eq!(err, vec![(OutputChannel::Stderr, "warning".to_string())]);
        let out = splitter.push(&frame(OutputChannel::Stdout, "done\n"));
        assert_eq!(out, vec![(OutputChannel::Stdout, "out-done".to_string())]);
    }

    #[test]
    fn test_debug_hides_env_values() {
        let spec = SandboxSpec {
            name: "remediation-x".to_string(),
            image: "img".to_string(),
            entrypoint: vec!["/bin/sh".to_string(), "-c".to_string()],
            command: vec!["echo ghp_secret".to_string()],
            env: vec![("SCM_TOKEN".to_string(), "ghp_secret".to_string())],
            working_dir: "/workspace".to_string(),
            memory_limit_bytes: 1,
            nano_cpus: 1,
            extra_hosts: vec![],
        };
        let rendered = format!("{spec:?}");
        assert!(rendered.contains("SCM_TOKEN"));
        assert!(!rendered.contains("ghp_secret"));
    }
}
