//! Capacity search
//!
//! Binary search over worker count for the highest concurrency at
//! which a root endpoint still meets the success-rate and p99-latency
//! SLOs. Each probe runs an isolated HTTP client sized to its worker
//! count so connection reuse from earlier probes cannot skew results.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::Dispatcher;
use crate::http;
use crate::models::{CapacityReport, CapacitySettings, LoadBound, Testcase};

/// Outcome of one measured probe at a fixed worker count.
#[derive(Clone, Copy, Debug)]
struct Probe {
    passed: bool,
    rps: f64,
    p99_ms: f64,
    success_rate: f64,
}

/// Binary-search capacity tester.
pub struct CapacityTester {
    settings: CapacitySettings,
    request_timeout: Duration,
}

impl CapacityTester {
    pub fn new(settings: CapacitySettings, request_timeout: Duration) -> Self {
        Self {
            settings,
            request_timeout,
        }
    }

    /// Find the highest worker count meeting the SLO for `root`.
    pub async fn run(&self, root: &Testcase, cancel: &CancellationToken) -> CapacityReport {
        let cfg = &self.settings;
        let mut iterations = 0u32;
        let mut best: Option<Probe> = None;

        info!(
            min = cfg.min_workers,
            max = cfg.max_workers,
            p99_threshold_ms = cfg.p99_threshold.as_millis() as u64,
            "capacity search starting"
        );

        tokio::select! {
            _ = cancel.cancelled() => return self.report(0, best, iterations),
            _ = tokio::time::sleep(cfg.pre_run_pause) => {}
        }

        // Probe the floor: if the minimum fails there is no capacity.
        let floor = self.probe(root, cfg.min_workers, cancel).await;
        iterations += 1;
        if !floor.passed {
            return self.report(0, Some(floor), iterations);
        }
        best = Some(floor);

        // Probe the ceiling: if the maximum passes, stop early.
        let ceiling = self.probe(root, cfg.max_workers, cancel).await;
        iterations += 1;
        if ceiling.passed {
            return self.report(cfg.max_workers, Some(ceiling), iterations);
        }

        // Binary search between the two, converging within `step`.
        let step = ((cfg.max_workers - cfg.min_workers) as f64 * cfg.search_precision) as usize;
        let step = step.max(1);
        let mut low = cfg.min_workers;
        let mut high = cfg.max_workers - 1;

        while high.saturating_sub(low) > step {
            if cancel.is_cancelled() {
                break;
            }
            tokio::time::sleep(cfg.iteration_pause).await;

            let mid = low + (high - low) / 2;
            let probe = self.probe(root, mid, cancel).await;
            iterations += 1;

            debug!(
                workers = mid,
                passed = probe.passed,
                p99_ms = probe.p99_ms,
                success_rate = probe.success_rate,
                "capacity probe"
            );

            if probe.passed {
                best = Some(probe);
                low = mid;
            } else {
                high = mid - 1;
            }
        }

        self.report(low, best, iterations)
    }

    /// One probe: warm up at the worker count with results discarded,
    /// then measure, then judge against the SLO.
    async fn probe(&self, root: &Testcase, workers: usize, cancel: &CancellationToken) -> Probe {
        let failed = Probe {
            passed: false,
            rps: 0.0,
            p99_ms: 0.0,
            success_rate: 0.0,
        };

        let Ok(client) = http::build_client(workers, self.request_timeout) else {
            return failed;
        };
        let dispatcher = Dispatcher::new(client, self.request_timeout, std::time::Instant::now());
        let testcases = std::slice::from_ref(root);

        dispatcher
            .warmup(testcases, workers, self.settings.warmup_duration, cancel)
            .await;

        let run = dispatcher
            .run_endpoint(
                testcases,
                workers,
                LoadBound::Duration(self.settings.measure_duration),
                cancel,
            )
            .await;

        if cancel.is_cancelled() {
            return failed;
        }

        let rps = run.stats.count as f64 / self.settings.measure_duration.as_secs_f64();
        let threshold_ms = self.settings.p99_threshold.as_secs_f64() * 1000.0;
        let passed = run.stats.count > 0
            && run.stats.success_rate >= self.settings.min_success_rate
            && run.stats.p99_ms <= threshold_ms;

        Probe {
            passed,
            rps,
            p99_ms: run.stats.p99_ms,
            success_rate: run.stats.success_rate,
        }
    }

    fn report(&self, max_workers_passed: usize, best: Option<Probe>, iterations: u32) -> CapacityReport {
        let best = best.unwrap_or(Probe {
            passed: false,
            rps: 0.0,
            p99_ms: 0.0,
            success_rate: 0.0,
        });
        info!(
            max_workers_passed,
            achieved_rps = best.rps,
            iterations,
            "capacity search complete"
        );
        CapacityReport {
            max_workers_passed,
            achieved_rps: best.rps,
            p99_ms: best.p99_ms,
            success_rate: best.success_rate,
            iterations,
        }
    }
}
