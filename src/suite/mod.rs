//! Benchmark orchestration
//!
//! Top-level sequencer: bring up database dependencies, then for each
//! server run {container start, readiness, sampler, warmup, flat
//! endpoints, sequences, capacity, export}, always stopping the
//! container on the way out, and finally write the meta file and drain
//! the metric sink. An infrastructure failure isolates the offending
//! server; its report is written with the error recorded and the run
//! moves on.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::capacity::CapacityTester;
use crate::cli::RunOptions;
use crate::config::ResolvedConfig;
use crate::container::{ComposeManager, ContainerController, ContainerError, ResourceSampler};
use crate::engine::Dispatcher;
use crate::http;
use crate::models::{
    ConfigSummary, EndpointReport, Expectation, MetaReport, RequestBody, ResolvedServer,
    ServerReport, Stats, Testcase,
};
use crate::results::{overall_stats, ResultsWriter};
use crate::sequence::SequenceRunner;
use crate::sink::MetricSink;

/// Deadline for readiness after container start.
const READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Cleanup actions get their own budget so shutdown still makes
/// progress after the parent context is canceled.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a whole run.
#[derive(Debug)]
pub struct RunSummary {
    pub reports: Vec<ServerReport>,
    pub meta: Option<MetaReport>,
    pub canceled: bool,
}

/// Top-level benchmark driver.
pub struct BenchSuite {
    config: ResolvedConfig,
    options: RunOptions,
    writer: ResultsWriter,
    sink: MetricSink,
    controller: ContainerController,
    cancel: CancellationToken,
}

impl BenchSuite {
    pub fn new(
        config: ResolvedConfig,
        options: RunOptions,
        results_dir: &str,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let writer = ResultsWriter::new(results_dir)?;
        let sink = match &config.influx {
            Some(settings) => MetricSink::new(settings, cancel.clone()),
            None => MetricSink::disabled(),
        };

        Ok(Self {
            config,
            options,
            writer,
            sink,
            controller: ContainerController::default(),
            cancel,
        })
    }

    /// Run the full benchmark and return the collected reports.
    pub async fn run(&self) -> Result<RunSummary> {
        let run_start = Instant::now();
        let servers = self.selected_servers()?;

        let compose = self.config.compose_file.as_ref().map(ComposeManager::new);
        if let Some(compose) = &compose {
            compose.up().await.context("database dependencies failed")?;
        }

        let mut reports = Vec::with_capacity(servers.len());
        for (index, server) in servers.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!("run canceled, skipping remaining servers");
                break;
            }

            info!(server = %server.name, "benchmarking server");
            let report = self.run_server(server).await;

            println!("{}", crate::output::format_server_summary(&report));
            if let Err(e) = self.writer.write_server(&report) {
                error!(server = %report.server, error = %e, "failed to write server report");
            }
            reports.push(report);

            // Cooldown between servers, skipped after the last one.
            if index + 1 < servers.len() && !self.cancel.is_cancelled() {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.server_cooldown) => {}
                }
            }
        }

        let meta = if reports.is_empty() {
            None
        } else {
            match self
                .writer
                .write_meta(self.config_summary(), run_start.elapsed().as_millis() as u64)
            {
                Ok(meta) => {
                    self.sink.write_run_meta(&meta);
                    Some(meta)
                }
                Err(e) => {
                    error!(error = %e, "failed to write meta file");
                    None
                }
            }
        };

        if let Some(compose) = &compose {
            if let Err(e) = compose.down().await {
                warn!(error = %e, "compose teardown failed");
            }
        }

        // Drain inflight metric batches before returning.
        self.sink.wait().await;

        Ok(RunSummary {
            reports,
            meta,
            canceled: self.cancel.is_cancelled(),
        })
    }

    /// Apply the `--servers` selection, rejecting unknown names.
    fn selected_servers(&self) -> Result<Vec<&ResolvedServer>> {
        let Some(selection) = &self.options.servers else {
            return Ok(self.config.servers.iter().collect());
        };

        let mut servers = Vec::with_capacity(selection.len());
        for name in selection {
            match self.config.servers.iter().find(|s| &s.name == name) {
                Some(server) => servers.push(server),
                None => bail!("unknown server \"{name}\" in --servers"),
            }
        }
        if servers.is_empty() {
            bail!("server selection is empty");
        }
        Ok(servers)
    }

    /// Benchmark one server; the container is stopped on every exit
    /// path, with a fresh timeout so cancellation cannot wedge
    /// shutdown.
    async fn run_server(&self, server: &ResolvedServer) -> ServerReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut report = ServerReport {
            server: server.name.clone(),
            image: server.image.clone(),
            started_at,
            duration_ms: 0,
            error: String::new(),
            overall: Stats::default(),
            endpoints: Vec::new(),
            sequences: Vec::new(),
            resources: None,
            capacity: None,
        };

        let container_id = match self.controller.start(server, self.config.network.as_deref()).await
        {
            Ok(id) => id,
            Err(e) => {
                error!(server = %server.name, error = %e, "container start failed");
                report.error = e.to_string();
                report.duration_ms = start.elapsed().as_millis() as u64;
                return report;
            }
        };

        self.benchmark_server(server, &container_id, &mut report).await;

        match tokio::time::timeout(CLEANUP_TIMEOUT, self.controller.stop(&container_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(server = %server.name, error = %e, "container stop failed"),
            Err(_) => warn!(server = %server.name, "container stop timed out"),
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        report
    }

    /// The measurement body between container start and stop.
    async fn benchmark_server(
        &self,
        server: &ResolvedServer,
        container_id: &str,
        report: &mut ServerReport,
    ) {
        match self
            .controller
            .wait_ready(
                &server.base_url,
                &self.config.databases,
                READY_TIMEOUT,
                &self.cancel,
            )
            .await
        {
            Ok(()) => {}
            Err(ContainerError::Canceled) => return,
            Err(e) => {
                error!(server = %server.name, error = %e, "server never became ready");
                report.error = e.to_string();
                return;
            }
        }

        let sample_resources = self.options.resources && server.resources_enabled;
        let mut sampler = ResourceSampler::new();

        let client = match http::build_client(server.workers, server.request_timeout) {
            Ok(client) => client,
            Err(e) => {
                report.error = e.to_string();
                return;
            }
        };

        let server_start = Instant::now();
        let dispatcher = Dispatcher::new(client.clone(), server.request_timeout, server_start);

        if self.options.warmup && server.warmup.enabled && !server.testcases.is_empty() {
            info!(server = %server.name, duration = ?server.warmup.duration, "warmup");
            dispatcher
                .warmup(
                    &server.testcases,
                    server.workers,
                    server.warmup.duration,
                    &self.cancel,
                )
                .await;
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(server.warmup.pause) => {}
            }
        }

        // Resource sampling covers the measured window only, not the
        // warmup.
        if sample_resources {
            sampler.start(container_id);
        }

        // Flat endpoints, in declaration order. All testcases expanded
        // from one declared endpoint (variations, per-database) share
        // a single bounded run, round-robined by the dispatcher.
        for (endpoint, testcases) in group_by_endpoint(&server.testcases) {
            if self.cancel.is_cancelled() {
                break;
            }
            let run = dispatcher
                .run_endpoint(&testcases, server.workers, server.bound, &self.cancel)
                .await;

            self.sink.write_endpoint_latencies(
                &server.name,
                endpoint,
                report.started_at,
                &run.timed,
            );

            let first = &testcases[0];
            report.endpoints.push(EndpointReport {
                name: endpoint.to_string(),
                method: first.method.clone(),
                path: first.path().to_string(),
                stats: run.stats,
                canceled: run.canceled_count,
                last_error: run.last_error,
            });
        }

        // Sequences.
        let runner = SequenceRunner::new(
            client.clone(),
            server.base_url.clone(),
            server.request_timeout,
        );
        for sequence in &server.sequences {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Some(db) = &sequence.database {
                if let Err(e) = self.controller.reset_database(&server.base_url, db).await {
                    warn!(sequence = %sequence.id, error = %e, "database reset failed");
                }
            }

            let run = runner
                .run(sequence, server.workers, server.bound, &self.cancel)
                .await;
            self.sink.write_sequence_latencies(
                &server.name,
                &sequence.display_name(),
                report.started_at,
                &run.cycle_durations,
            );
            report.sequences.push(run.report);
        }

        // Capacity search against the root endpoint.
        if self.options.capacity && server.capacity.enabled && !self.cancel.is_cancelled() {
            let root = root_testcase(server);
            let tester = CapacityTester::new(server.capacity.clone(), server.request_timeout);
            report.capacity = Some(tester.run(&root, &self.cancel).await);
        }

        if sample_resources {
            report.resources = Some(sampler.stop().await);
            if let Some(resources) = &report.resources {
                self.sink
                    .write_resource_stats(&server.name, report.started_at, resources);
            }
        }

        report.overall = overall_stats(&report.endpoints);
    }

    fn config_summary(&self) -> ConfigSummary {
        let first = self.config.servers.first();
        ConfigSummary {
            workers: first.map(|s| s.workers).unwrap_or(0),
            bound: first
                .map(|s| s.bound.describe())
                .unwrap_or_else(|| "-".to_string()),
            request_timeout_ms: first
                .map(|s| s.request_timeout.as_millis() as u64)
                .unwrap_or(0),
            warmup: self.options.warmup,
            resources: self.options.resources,
            capacity: self.options.capacity,
            databases: self.config.databases.clone(),
        }
    }
}

/// Group expanded testcases under their declared endpoint, preserving
/// first-seen order. One group is one `run_endpoint` call, so an
/// endpoint's variations and per-database expansions share a single
/// load bound instead of getting one each.
fn group_by_endpoint(testcases: &[Testcase]) -> IndexMap<&str, Vec<Testcase>> {
    let mut groups: IndexMap<&str, Vec<Testcase>> = IndexMap::new();
    for testcase in testcases {
        groups
            .entry(testcase.endpoint.as_str())
            .or_default()
            .push(testcase.clone());
    }
    groups
}

/// The capacity root: the declared `/` endpoint if present, otherwise
/// a plain `GET /` expecting 200.
fn root_testcase(server: &ResolvedServer) -> Testcase {
    server
        .testcases
        .iter()
        .find(|tc| tc.method == "GET" && tc.path() == "/")
        .cloned()
        .unwrap_or_else(|| Testcase {
            name: "root".to_string(),
            endpoint: "root".to_string(),
            method: "GET".to_string(),
            url: server.base_url.clone(),
            headers: IndexMap::new(),
            body: RequestBody::None,
            expect: Expectation {
                status: 200,
                ..Default::default()
            },
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::resolve;

    fn resolved() -> ResolvedConfig {
        let raw: crate::config::RawConfig = serde_json::from_str(
            r#"{
                "benchmark": {"concurrency": 2, "requests_per_endpoint": 5},
                "servers": [
                    {"name": "ghost", "image": "server-bench-test/does-not-exist:404", "port": 59999}
                ],
                "endpoints": {
                    "root": {"path": "/"},
                    "items": {"path": "/items"}
                }
            }"#,
        )
        .unwrap();
        resolve(&raw).unwrap()
    }

    fn options() -> RunOptions {
        RunOptions {
            warmup: false,
            resources: false,
            capacity: false,
            servers: None,
        }
    }

    #[test]
    fn test_selected_servers_rejects_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options();
        opts.servers = Some(vec!["nope".to_string()]);

        let suite = BenchSuite::new(
            resolved(),
            opts,
            dir.path().to_str().unwrap(),
            CancellationToken::new(),
        )
        .unwrap();
        let err = suite.selected_servers().unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_group_by_endpoint_combines_expansions() {
        let raw: crate::config::RawConfig = serde_json::from_str(
            r#"{
                "databases": ["postgres", "mysql"],
                "servers": {"axum": 3000},
                "endpoints": {
                    "root": {"path": "/"},
                    "db_read": {"path": "/db/{database}/items", "per_database": true},
                    "create": {
                        "method": "POST",
                        "path": "/items",
                        "body": {"name": "a"},
                        "variations": [{"name": "bad", "expected_status": 422}]
                    }
                }
            }"#,
        )
        .unwrap();
        let config = resolve(&raw).unwrap();
        let server = &config.servers[0];

        // One group per declared endpoint, first-seen order, with the
        // per-database and variation expansions folded in.
        let groups = group_by_endpoint(&server.testcases);
        let keys: Vec<&str> = groups.keys().copied().collect();
        assert_eq!(keys, ["root", "db_read", "create"]);
        assert_eq!(groups["db_read"].len(), 2);
        assert_eq!(groups["create"].len(), 2);
        assert_eq!(keys, server.endpoint_order);
    }

    #[test]
    fn test_root_testcase_prefers_declared_root() {
        let config = resolved();
        let server = &config.servers[0];
        let root = root_testcase(server);
        assert_eq!(root.name, "root");
        assert_eq!(root.path(), "/");
    }

    #[test]
    fn test_root_testcase_synthesized_when_absent() {
        let mut config = resolved();
        config.servers[0].testcases.retain(|tc| tc.path() != "/");
        let root = root_testcase(&config.servers[0]);
        assert_eq!(root.method, "GET");
        assert_eq!(root.expect.status, 200);
    }

    #[tokio::test]
    async fn test_infra_failure_isolated_and_written() {
        let dir = tempfile::tempdir().unwrap();
        let suite = BenchSuite::new(
            resolved(),
            options(),
            dir.path().to_str().unwrap(),
            CancellationToken::new(),
        )
        .unwrap();

        // The image cannot exist, so the server fails at container
        // start; the run must still produce a report file and a meta
        // file rather than an error.
        let summary = suite.run().await.unwrap();
        assert_eq!(summary.reports.len(), 1);
        assert!(!summary.reports[0].error.is_empty());

        assert!(dir.path().join("ghost.json").exists());
        let meta = summary.meta.expect("meta written");
        assert_eq!(meta.summary.total_servers, 1);
        assert_eq!(meta.summary.failed, 1);
        assert_eq!(meta.summary.successful, 0);
    }
}
