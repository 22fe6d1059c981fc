//! Container lifecycle control
//!
//! Starts and stops server containers through the docker CLI, polls
//! readiness over HTTP, and owns the resource sampler. A container is
//! exclusively owned by this controller between `start` and `stop`;
//! the orchestrator guarantees `stop` runs on every exit path.

mod compose;
mod stats;

pub use compose::ComposeManager;
pub use stats::ResourceSampler;

use std::process::Output;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::ResolvedServer;

/// Poll interval for readiness checks.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Per-request timeout while polling readiness.
const READY_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Grace period passed to `docker stop`.
const STOP_GRACE_SECS: u32 = 2;

/// Container runtime errors.
#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("docker {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("docker {0} timed out after {1:?}")]
    CommandTimeout(String, Duration),

    #[error("failed to run docker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("server at {url} not ready within {timeout:?}: {reason}")]
    NotReady {
        url: String,
        timeout: Duration,
        reason: String,
    },

    #[error("canceled while waiting for readiness")]
    Canceled,
}

/// Controls one server container at a time via the docker CLI.
pub struct ContainerController {
    start_timeout: Duration,
    client: reqwest::Client,
}

impl Default for ContainerController {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl ContainerController {
    pub fn new(start_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(READY_REQUEST_TIMEOUT)
            .build()
            .expect("readiness client");
        Self {
            start_timeout,
            client,
        }
    }

    /// Start a detached, auto-removing container with resource limits
    /// and a published port. Returns the container id.
    pub async fn start(
        &self,
        server: &ResolvedServer,
        network: Option<&str>,
    ) -> Result<String, ContainerError> {
        let args = run_args(server, network);
        info!(image = %server.image, "starting container");
        debug!(?args, "docker run");

        let output = self.docker(&args, "run").await?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(id = %short_id(&id), "container started");
        Ok(id)
    }

    /// Stop a container with a short grace period. Idempotent: a
    /// container that already exited (auto-removed) is not an error.
    pub async fn stop(&self, id: &str) -> Result<(), ContainerError> {
        let grace = STOP_GRACE_SECS.to_string();
        let args = vec!["stop".to_string(), "-t".to_string(), grace, id.to_string()];

        match self.docker(&args, "stop").await {
            Ok(_) => {
                info!(id = %short_id(id), "container stopped");
                Ok(())
            }
            Err(ContainerError::CommandFailed { stderr, .. })
                if stderr.contains("No such container") =>
            {
                debug!(id = %short_id(id), "container already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Poll `GET /health` (and every required database health
    /// endpoint) until the service reports healthy or the deadline
    /// elapses. Cancellation returns immediately.
    pub async fn wait_ready(
        &self,
        base_url: &url::Url,
        databases: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ContainerError> {
        let deadline = Instant::now() + timeout;
        let mut last_reason = String::from("no response");

        loop {
            if cancel.is_cancelled() {
                return Err(ContainerError::Canceled);
            }
            if Instant::now() >= deadline {
                return Err(ContainerError::NotReady {
                    url: base_url.to_string(),
                    timeout,
                    reason: last_reason,
                });
            }

            match self.probe_health(base_url, databases).await {
                Ok(()) => {
                    info!(url = %base_url, "server ready");
                    return Ok(());
                }
                Err(reason) => last_reason = reason,
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ContainerError::Canceled),
                _ = tokio::time::sleep(READY_POLL_INTERVAL) => {}
            }
        }
    }

    async fn probe_health(&self, base_url: &url::Url, databases: &[String]) -> Result<(), String> {
        let health = base_url.join("/health").map_err(|e| e.to_string())?;
        let status = self
            .client
            .get(health)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .status();
        if !status.is_success() {
            return Err(format!("/health returned {status}"));
        }

        for db in databases {
            let path = format!("/db/{db}/health");
            let url = base_url.join(&path).map_err(|e| e.to_string())?;
            let status = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| format!("{path}: {e}"))?
                .status();
            if status.as_u16() != 200 {
                return Err(format!("{path} returned {status}"));
            }
        }

        Ok(())
    }

    /// Reset one database on the server under test via
    /// `DELETE /db/{name}/reset`.
    pub async fn reset_database(
        &self,
        base_url: &url::Url,
        name: &str,
    ) -> Result<(), ContainerError> {
        let path = format!("/db/{name}/reset");
        let url = base_url.join(&path).map_err(|e| ContainerError::NotReady {
            url: base_url.to_string(),
            timeout: Duration::ZERO,
            reason: e.to_string(),
        })?;

        let status = self
            .client
            .delete(url.clone())
            .send()
            .await
            .map_err(|e| ContainerError::NotReady {
                url: url.to_string(),
                timeout: READY_REQUEST_TIMEOUT,
                reason: e.to_string(),
            })?
            .status();

        if status.as_u16() != 200 {
            warn!(db = name, %status, "database reset returned non-200");
            return Err(ContainerError::NotReady {
                url: url.to_string(),
                timeout: READY_REQUEST_TIMEOUT,
                reason: format!("reset returned {status}"),
            });
        }
        debug!(db = name, "database reset");
        Ok(())
    }

    /// Run one docker command with a bounded timeout, surfacing the
    /// child's stderr on failure.
    async fn docker(&self, args: &[String], verb: &str) -> Result<Output, ContainerError> {
        let future = Command::new("docker").args(args).output();
        let output = tokio::time::timeout(self.start_timeout, future)
            .await
            .map_err(|_| ContainerError::CommandTimeout(verb.to_string(), self.start_timeout))??;

        if !output.status.success() {
            return Err(ContainerError::CommandFailed {
                command: verb.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

/// Arguments for `docker run` on a resolved server.
fn run_args(server: &ResolvedServer, network: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--rm".to_string(),
        "-p".to_string(),
        format!("{}:{}", server.host_port, server.container_port),
    ];
    if let Some(cpus) = server.cpu_limit {
        args.push(format!("--cpus={cpus}"));
    }
    if let Some(memory) = &server.memory_limit {
        args.push(format!("--memory={}", docker_memory_arg(memory)));
    }
    if let Some(network) = network {
        args.push(format!("--network={network}"));
    }
    args.push(server.image.clone());
    args
}

/// Docker wants single-letter unit suffixes: `512mb` -> `512m`.
fn docker_memory_arg(normalized: &str) -> String {
    normalized
        .strip_suffix('b')
        .filter(|s| s.ends_with(['k', 'm', 'g']))
        .map(|s| s.to_string())
        .unwrap_or_else(|| normalized.to_string())
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CapacitySettings, LoadBound, WarmupSettings};
    use crate::testutil::{StubResponse, StubServer};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn server_fixture(cpu: Option<f64>, memory: Option<&str>) -> ResolvedServer {
        ResolvedServer {
            name: "axum".into(),
            image: "bench/axum:latest".into(),
            container_port: 3000,
            host_port: 8080,
            base_url: url::Url::parse("http://localhost:8080").unwrap(),
            request_timeout: Duration::from_secs(5),
            cpu_limit: cpu,
            memory_limit: memory.map(String::from),
            workers: 4,
            bound: LoadBound::Iterations(10),
            testcases: Vec::new(),
            endpoint_order: Vec::new(),
            warmup: WarmupSettings::default(),
            resources_enabled: true,
            capacity: CapacitySettings::default(),
            sequences: Vec::new(),
        }
    }

    #[test]
    fn test_run_args_full() {
        let server = server_fixture(Some(1.5), Some("512mb"));
        let args = run_args(&server, Some("bench-net"));
        assert_eq!(
            args,
            vec![
                "run",
                "-d",
                "--rm",
                "-p",
                "8080:3000",
                "--cpus=1.5",
                "--memory=512m",
                "--network=bench-net",
                "bench/axum:latest",
            ]
        );
    }

    #[test]
    fn test_run_args_minimal() {
        let server = server_fixture(None, None);
        let args = run_args(&server, None);
        assert_eq!(args, vec!["run", "-d", "--rm", "-p", "8080:3000", "bench/axum:latest"]);
    }

    #[test]
    fn test_docker_memory_arg() {
        assert_eq!(docker_memory_arg("512mb"), "512m");
        assert_eq!(docker_memory_arg("1gb"), "1g");
        assert_eq!(docker_memory_arg("65536kb"), "65536k");
        // already single-letter or unexpected forms pass through
        assert_eq!(docker_memory_arg("512m"), "512m");
    }

    #[tokio::test]
    async fn test_wait_ready_flips_healthy() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_stub = calls.clone();
        let server = StubServer::spawn(move |req| {
            if req.path == "/health" {
                // unhealthy for the first two polls
                if calls_in_stub.fetch_add(1, Ordering::SeqCst) < 2 {
                    StubResponse::json(503, json!({"status": "starting"}))
                } else {
                    StubResponse::json(200, json!({"status": "ok"}))
                }
            } else {
                StubResponse::json(404, json!({}))
            }
        })
        .await;

        let controller = ContainerController::default();
        let result = controller
            .wait_ready(
                &server.base_url(),
                &[],
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.is_ok());
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_wait_ready_requires_databases() {
        let server = StubServer::spawn(|req| match req.path.as_str() {
            "/health" => StubResponse::json(200, json!({"status": "ok"})),
            "/db/postgres/health" => StubResponse::json(200, json!({})),
            // mysql never comes up
            _ => StubResponse::json(503, json!({})),
        })
        .await;

        let controller = ContainerController::default();
        let ok = controller
            .wait_ready(
                &server.base_url(),
                &["postgres".to_string()],
                Duration::from_secs(2),
                &CancellationToken::new(),
            )
            .await;
        assert!(ok.is_ok());

        let err = controller
            .wait_ready(
                &server.base_url(),
                &["postgres".to_string(), "mysql".to_string()],
                Duration::from_millis(600),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("mysql"));
    }

    #[tokio::test]
    async fn test_wait_ready_cancellation() {
        let server = StubServer::spawn(|_req| StubResponse::json(503, json!({}))).await;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let controller = ContainerController::default();
        let err = controller
            .wait_ready(&server.base_url(), &[], Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::Canceled));
    }

    #[tokio::test]
    async fn test_reset_database() {
        let server = StubServer::spawn(|req| {
            if req.method == "DELETE" && req.path == "/db/postgres/reset" {
                StubResponse::json(200, json!({"reset": true}))
            } else {
                StubResponse::json(405, json!({}))
            }
        })
        .await;

        let controller = ContainerController::default();
        assert!(controller
            .reset_database(&server.base_url(), "postgres")
            .await
            .is_ok());
        assert!(controller
            .reset_database(&server.base_url(), "mysql")
            .await
            .is_err());
    }
}
