//! Docker Engine sandbox backend over the Engine HTTP API
//!
//! Talks to a TCP endpoint (`tcp://host:port` or `http://host:port`).
//! Unix-socket endpoints are rejected; with no usable endpoint the backend
//! is simply absent and remediation fails its prerequisite check.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use super::demux::MultiplexedLogCodec;
use super::{LogStream, SandboxBackend, SandboxError, SandboxHandle, SandboxSpec};
use crate::config::defaults::{
    DOCKER_CONNECT_TIMEOUT_SECS, DOCKER_PULL_TIMEOUT_SECS, DOCKER_REQUEST_TIMEOUT_SECS,
};

/// Environment variable consulted when the config names no endpoint.
pub const DOCKER_HOST_ENV: &str = "DOCKER_HOST";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
    #[serde(default)]
    warnings: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WaitResponse {
    status_code: i64,
    #[serde(default)]
    error: Option<WaitError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WaitError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct EngineMessage {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct PullProgress {
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for one Docker Engine
#[derive(Debug, Clone)]
pub struct DockerEngine {
    http: reqwest::Client,
    base_url: String,
}

impl DockerEngine {
    /// Build a client for `endpoint`. No request is made until first use.
    pub fn connect(endpoint: &str) -> Result<Self, SandboxError> {
        let base_url = normalize_endpoint(endpoint)?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(DOCKER_CONNECT_TIMEOUT_SECS))
            .build()?;
        info!(endpoint = %base_url, "Docker Engine backend configured");
        Ok(Self { http, base_url })
    }

    /// Resolve the endpoint from config, then `DOCKER_HOST`.
    ///
    /// Returns `None` when neither names one.
    pub fn from_config(docker_host: Option<&str>) -> Option<Result<Self, SandboxError>> {
        let endpoint = docker_host
            .map(str::to_string)
            .or_else(|| std::env::var(DOCKER_HOST_ENV).ok())
            .filter(|e| !e.trim().is_empty())?;
        Some(Self::connect(&endpoint))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Map a Docker host string onto an HTTP base URL.
pub fn normalize_endpoint(endpoint: &str) -> Result<String, SandboxError> {
    let endpoint = endpoint.trim();
    let base = if let Some(rest) = endpoint.strip_prefix("tcp://") {
        format!("http://{rest}")
    } else if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else if endpoint.starts_with("unix://") || endpoint.starts_with("npipe://") {
        return Err(SandboxError::Endpoint(format!(
            "{endpoint}: only TCP endpoints are supported"
        )));
    } else {
        return Err(SandboxError::Endpoint(format!(
            "{endpoint}: expected tcp://, http:// or https://"
        )));
    };
    Ok(base.trim_end_matches('/').to_string())
}

/// Best-effort extraction of the Engine's `{"message": ...}` error body.
async fn engine_error(resp: reqwest::Response) -> String {
    let status = resp.status();
    match resp.text().await {
        Ok(body) => match serde_json::from_str::<EngineMessage>(&body) {
            Ok(msg) if !msg.message.is_empty() => format!("{status}: {}", msg.message),
            _ if body.trim().is_empty() => status.to_string(),
            _ => format!("{status}: {}", body.trim()),
        },
        Err(_) => status.to_string(),
    }
}

#[async_trait]
impl SandboxBackend for DockerEngine {
    fn name(&self) -> &str {
        "docker"
    }

    async fn pull_image(&self, image: &str) -> Result<(), SandboxError> {
        let pull_err = |message: String| SandboxError::Pull {
            image: image.to_string(),
            message,
        };

        let resp = self
            .http
            .post(self.url("/images/create"))
            .query(&[("fromImage", image)])
            .timeout(Duration::from_secs(DOCKER_PULL_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| pull_err(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(pull_err(engine_error(resp).await));
        }

        // Progress arrives as newline-delimited JSON; failures can show up
        // mid-stream with a 200 status.
        let body = resp.text().await.map_err(|e| pull_err(e.to_string()))?;
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            if let Ok(PullProgress { error: Some(error) }) = serde_json::from_str(line) {
                return Err(pull_err(error));
            }
        }
        debug!(image, "Image pulled");
        Ok(())
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError> {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let body = json!({
            "Image": spec.image,
            "Entrypoint": spec.entrypoint,
            "Cmd": spec.command,
            "Env": env,
            "WorkingDir": spec.working_dir,
            "Tty": false,
            "AttachStdout": true,
            "AttachStderr": true,
            "HostConfig": {
                "AutoRemove": false,
                "Memory": spec.memory_limit_bytes,
                "NanoCpus": spec.nano_cpus,
                "ExtraHosts": spec.extra_hosts,
            },
        });

        let resp = self
            .http
            .post(self.url("/containers/create"))
            .query(&[("name", spec.name.as_str())])
            .timeout(Duration::from_secs(DOCKER_REQUEST_TIMEOUT_SECS))
            .json(&body)
            .send()
            .await
            .map_err(|e| SandboxError::Create(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(SandboxError::Create(engine_error(resp).await));
        }

        let created: CreateResponse = resp
            .json()
            .await
            .map_err(|e| SandboxError::Create(format!("unexpected response: {e}")))?;
        for warning in created.warnings.unwrap_or_default() {
            debug!(sandbox = %spec.name, %warning, "Engine warning on create");
        }

        Ok(SandboxHandle {
            id: created.id,
            name: spec.name.clone(),
        })
    }

    async fn start(&self, id: &str) -> Result<(), SandboxError> {
        let resp = self
            .http
            .post(self.url(&format!("/containers/{id}/start")))
            .timeout(Duration::from_secs(DOCKER_REQUEST_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| SandboxError::Start(e.to_string()))?;

        // 304: already running
        match resp.status().as_u16() {
            204 | 304 => Ok(()),
            _ => Err(SandboxError::Start(engine_error(resp).await)),
        }
    }

    async fn stream_logs(&self, id: &str) -> Result<LogStream, SandboxError> {
        let resp = self
            .http
            .get(self.url(&format!("/containers/{id}/logs")))
            .query(&[("follow", "1"), ("stdout", "1"), ("stderr", "1")])
            .send()
            .await
            .map_err(|e| SandboxError::Logs(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(SandboxError::Logs(engine_error(resp).await));
        }

        let bytes = resp.bytes_stream().map_err(std::io::Error::other);
        let frames = FramedRead::new(StreamReader::new(bytes), MultiplexedLogCodec);
        Ok(frames.boxed())
    }

    async fn wait(&self, id: &str) -> Result<i64, SandboxError> {
        let resp = self
            .http
            .post(self.url(&format!("/containers/{id}/wait")))
            .query(&[("condition", "not-running")])
            .send()
            .await
            .map_err(|e| SandboxError::Wait(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(SandboxError::Wait(engine_error(resp).await));
        }

        let waited: WaitResponse = resp
            .json()
            .await
            .map_err(|e| SandboxError::Wait(format!("unexpected response: {e}")))?;
        match waited.error {
            Some(WaitError { message }) if !message.is_empty() => Err(SandboxError::Wait(message)),
            _ => Ok(waited.status_code),
        }
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), SandboxError> {
        let resp = self
            .http
            .post(self.url(&format!("/containers/{id}/stop")))
            .query(&[("t", grace.as_secs().to_string())])
            .timeout(grace + Duration::from_secs(DOCKER_REQUEST_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| SandboxError::Stop(e.to_string()))?;

        // 304: already stopped
        match resp.status().as_u16() {
            204 | 304 => Ok(()),
            _ => Err(SandboxError::Stop(engine_error(resp).await)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::OutputChannel;
    use axum::extract::{Path, Query, State};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeEngine {
        created: Arc<Mutex<Vec<(String, Value)>>>,
        stopped: Arc<Mutex<Vec<(String, String)>>>,
        pull_error: Option<&'static str>,
    }

    fn frame(stream: u8, text: &str) -> Vec<u8> {
        let mut out = vec![stream, 0, 0, 0];
        out.extend_from_slice(&u32::try_from(text.len()).unwrap().to_be_bytes());
        out.extend_from_slice(text.as_bytes());
        out
    }

    async fn pull(State(engine): State<FakeEngine>) -> String {
        let mut body = String::from("{\"status\":\"Pulling from x\"}\n");
        if let Some(err) = engine.pull_error {
            body.push_str(&format!("{{\"error\":\"{err}\"}}\n"));
        }
        body
    }

    async fn create(
        State(engine): State<FakeEngine>,
        Query(q): Query<HashMap<String, String>>,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        let name = q.get("name").cloned().unwrap_or_default();
        if name == "taken" {
            return (
                StatusCode::CONFLICT,
                Json(json!({"message": "Conflict. The container name is already in use"})),
            );
        }
        engine.created.lock().unwrap().push((name, body));
        (StatusCode::CREATED, Json(json!({"Id": "c0ffee", "Warnings": []})))
    }

    async fn start(Path(id): Path<String>) -> StatusCode {
        if id == "c0ffee" {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::NOT_FOUND
        }
    }

    async fn logs() -> Vec<u8> {
        let mut body = frame(1, "cloning repo\n");
        body.extend(frame(2, "warning: detached\n"));
        body.extend(frame(1, "done\n"));
        body
    }

    async fn wait(Path(id): Path<String>) -> Json<Value> {
        if id == "broken" {
            Json(json!({"StatusCode": -1, "Error": {"Message": "container vanished"}}))
        } else {
            Json(json!({"StatusCode": 3, "Error": null}))
        }
    }

    async fn stop(
        State(engine): State<FakeEngine>,
        Path(id): Path<String>,
        Query(q): Query<HashMap<String, String>>,
    ) -> StatusCode {
        let t = q.get("t").cloned().unwrap_or_default();
        engine.stopped.lock().unwrap().push((id, t));
        StatusCode::NO_CONTENT
    }

    async fn spawn_engine(engine: FakeEngine) -> DockerEngine {
        let app = Router::new()
            .route("/images/create", post(pull))
            .route("/containers/create", post(create))
            .route("/containers/:id/start", post(start))
            .route("/containers/:id/logs", get(logs))
            .route("/containers/:id/wait", post(wait))
            .route("/containers/:id/stop", post(stop))
            .with_state(engine);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        DockerEngine::connect(&format!("tcp://{addr}")).unwrap()
    }

    fn spec(name: &str) -> SandboxSpec {
        SandboxSpec {
            name: name.to_string(),
            image: "example/agent:1".to_string(),
            entrypoint: vec!["/bin/sh".to_string(), "-c".to_string()],
            command: vec!["echo hi".to_string()],
            env: vec![("REMEDIATION_ID".to_string(), "abcd1234".to_string())],
            working_dir: "/workspace".to_string(),
            memory_limit_bytes: 2 * 1024 * 1024 * 1024,
            nano_cpus: 2_000_000_000,
            extra_hosts: vec!["host.docker.internal:host-gateway".to_string()],
        }
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(
            normalize_endpoint("tcp://10.0.0.5:2375").unwrap(),
            "http://10.0.0.5:2375"
        );
        assert_eq!(
            normalize_endpoint("https://docker.internal:2376/").unwrap(),
            "https://docker.internal:2376"
        );
        assert!(matches!(
            normalize_endpoint("unix:///var/run/docker.sock"),
            Err(SandboxError::Endpoint(_))
        ));
        assert!(normalize_endpoint("docker.sock").is_err());
    }

    #[test]
    fn test_config_endpoint_wins() {
        let engine = DockerEngine::from_config(Some("tcp://10.0.0.5:2375"))
            .unwrap()
            .unwrap();
        assert_eq!(engine.base_url(), "http://10.0.0.5:2375");
        assert!(matches!(
            DockerEngine::from_config(Some("unix:///var/run/docker.sock")),
            Some(Err(SandboxError::Endpoint(_)))
        ));
    }

    #[tokio::test]
    async fn test_create_sends_engine_body() {
        let fake = FakeEngine::default();
        let engine = spawn_engine(fake.clone()).await;

        let handle = engine.create(&spec("remediation-abcd1234")).await.unwrap();
        assert_eq!(handle.id, "c0ffee");
        assert_eq!(handle.name, "remediation-abcd1234");

        let created = fake.created.lock().unwrap();
        let (name, body) = &created[0];
        assert_eq!(name, "remediation-abcd1234");
        assert_eq!(body["Tty"], false);
        assert_eq!(body["Env"][0], "REMEDIATION_ID=abcd1234");
        assert_eq!(body["Entrypoint"][1], "-c");
        assert_eq!(body["HostConfig"]["NanoCpus"], 2_000_000_000u64);
        assert_eq!(
            body["HostConfig"]["ExtraHosts"][0],
            "host.docker.internal:host-gateway"
        );
    }

    #[tokio::test]
    async fn test_create_conflict_surfaces_engine_message() {
        let engine = spawn_engine(FakeEngine::default()).await;
        let err = engine.create(&spec("taken")).await.unwrap_err();
        match err {
            SandboxError::Create(msg) => assert!(msg.contains("already in use"), "{msg}"),
            other => panic!("expected create error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_pull_error_inside_progress_stream() {
        let ok = spawn_engine(FakeEngine::default()).await;
        ok.pull_image("example/agent:1").await.unwrap();

        let failing = spawn_engine(FakeEngine {
            pull_error: Some("manifest unknown"),
            ..FakeEngine::default()
        })
        .await;
        let err = failing.pull_image("example/agent:1").await.unwrap_err();
        assert!(matches!(err, SandboxError::Pull { ref message, .. } if message == "manifest unknown"));
    }

    #[tokio::test]
    async fn test_start_wait_stop_lifecycle() {
        let fake = FakeEngine::default();
        let engine = spawn_engine(fake.clone()).await;

        engine.start("c0ffee").await.unwrap();
        assert!(matches!(
            engine.start("missing").await,
            Err(SandboxError::Start(_))
        ));

        assert_eq!(engine.wait("c0ffee").await.unwrap(), 3);
        assert!(matches!(
            engine.wait("broken").await,
            Err(SandboxError::Wait(ref m)) if m == "container vanished"
        ));

        engine.stop("c0ffee", Duration::from_secs(10)).await.unwrap();
        let stopped = fake.stopped.lock().unwrap();
        assert_eq!(stopped[0], ("c0ffee".to_string(), "10".to_string()));
    }

    #[tokio::test]
    async fn test_logs_are_demultiplexed() {
        let engine = spawn_engine(FakeEngine::default()).await;
        let frames: Vec<_> = engine
            .stream_logs("c0ffee")
            .await
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].channel, OutputChannel::Stderr);
        assert_eq!(&frames[2].payload[..], b"done\n");
    }
}
