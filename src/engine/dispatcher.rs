//! Closed-loop load dispatch
//!
//! One generator task feeds work items round-robin over an endpoint's
//! testcases; N worker tasks each pull the next item, issue one
//! request, and push a classified result; the caller fans results in.
//! The generator closing the work channel is the only stop signal the
//! workers need.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::validate::validate;
use crate::http;
use crate::models::{LoadBound, Stats, Testcase, TimedLatency};

/// Outcome of one endpoint run.
#[derive(Clone, Debug, Default)]
pub struct EndpointRun {
    pub stats: Stats,
    pub timed: Vec<TimedLatency>,
    pub failure_count: u64,
    pub canceled_count: u64,
    pub last_error: Option<String>,
}

/// Result of a single dispatched request.
enum RequestOutcome {
    Success(TimedLatency),
    Failure(String),
    Canceled,
}

/// Worker-pool load engine for one server.
///
/// Holds the server's shared HTTP client and the server-start instant
/// that anchors `TimedLatency.server_offset`.
pub struct Dispatcher {
    client: Client,
    request_timeout: Duration,
    server_start: Instant,
}

impl Dispatcher {
    pub fn new(client: Client, request_timeout: Duration, server_start: Instant) -> Self {
        Self {
            client,
            request_timeout,
            server_start,
        }
    }

    /// Drive one endpoint's load with `workers` parallel tasks until
    /// the bound is exhausted or the parent token cancels.
    ///
    /// Individual request failures never abort the run; they are
    /// aggregated into `failure_count`/`last_error`. Requests cut off
    /// by the duration bound or parent cancellation count as canceled
    /// and do not affect the success rate.
    pub async fn run_endpoint(
        &self,
        testcases: &[Testcase],
        workers: usize,
        bound: LoadBound,
        cancel: &CancellationToken,
    ) -> EndpointRun {
        if testcases.is_empty() || workers == 0 {
            return EndpointRun::default();
        }

        let endpoint_start = Instant::now();
        let bound_token = cancel.child_token();

        // In duration mode the bound token doubles as the duration
        // context: in-flight requests are cut off when it fires.
        let timer = if let LoadBound::Duration(limit) = bound {
            let token = bound_token.clone();
            Some(tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(limit) => token.cancel(),
                }
            }))
        } else {
            None
        };

        let (work_tx, work_rx) = mpsc::channel::<usize>(workers * 2);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let generator_token = bound_token.clone();
        let generator = tokio::spawn(async move {
            let mut item: usize = 0;
            loop {
                if let LoadBound::Iterations(n) = bound {
                    if item as u64 >= n {
                        break;
                    }
                }
                tokio::select! {
                    biased;
                    _ = generator_token.cancelled() => break,
                    sent = work_tx.send(item) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
                item += 1;
            }
            // work_tx drops here, closing the channel.
        });

        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<RequestOutcome>();
        let testcases: Arc<[Testcase]> = testcases.to_vec().into();

        let mut pool = JoinSet::new();
        for _ in 0..workers {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let testcases = testcases.clone();
            let token = bound_token.clone();
            let client = self.client.clone();
            let request_timeout = self.request_timeout;
            let server_start = self.server_start;

            pool.spawn(async move {
                loop {
                    let item = { work_rx.lock().await.recv().await };
                    let Some(item) = item else { break };

                    let tc = &testcases[item % testcases.len()];
                    let outcome = execute_one(
                        &client,
                        tc,
                        request_timeout,
                        &token,
                        server_start,
                        endpoint_start,
                    )
                    .await;

                    if result_tx.send(outcome).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        // Fan-in: the result channel closes once every worker exits.
        let hint = bound.count_hint(workers);
        let mut latencies: Vec<Duration> = Vec::with_capacity(hint);
        let mut timed: Vec<TimedLatency> = Vec::with_capacity(hint);
        let mut failure_count = 0u64;
        let mut canceled_count = 0u64;
        let mut last_error = None;

        while let Some(outcome) = result_rx.recv().await {
            match outcome {
                RequestOutcome::Success(sample) => {
                    latencies.push(sample.duration);
                    timed.push(sample);
                }
                RequestOutcome::Failure(message) => {
                    failure_count += 1;
                    last_error = Some(message);
                }
                RequestOutcome::Canceled => canceled_count += 1,
            }
        }

        while pool.join_next().await.is_some() {}
        let _ = generator.await;
        if let Some(timer) = timer {
            timer.abort();
        }

        debug!(
            successes = latencies.len(),
            failures = failure_count,
            canceled = canceled_count,
            "endpoint run drained"
        );

        EndpointRun {
            stats: Stats::from_latencies(&mut latencies, failure_count),
            timed,
            failure_count,
            canceled_count,
            last_error,
        }
    }

    /// Run the same pool against the same testcases with results
    /// discarded, letting the server reach steady state.
    pub async fn warmup(
        &self,
        testcases: &[Testcase],
        workers: usize,
        duration: Duration,
        cancel: &CancellationToken,
    ) {
        let _ = self
            .run_endpoint(testcases, workers, LoadBound::Duration(duration), cancel)
            .await;
    }
}

/// Issue one request and classify the result.
///
/// The bound token wins the race against the in-flight request, so
/// duration expiry and parent cancellation both cut the call short and
/// classify it as canceled rather than failed.
async fn execute_one(
    client: &Client,
    tc: &Testcase,
    request_timeout: Duration,
    token: &CancellationToken,
    server_start: Instant,
    endpoint_start: Instant,
) -> RequestOutcome {
    let start = Instant::now();
    let server_offset = start.duration_since(server_start);
    let endpoint_offset = start.duration_since(endpoint_start);

    tokio::select! {
        biased;
        _ = token.cancelled() => RequestOutcome::Canceled,
        result = http::issue(client, tc, request_timeout) => match result {
            Ok(response) => match validate(&tc.expect, &response) {
                Ok(()) => RequestOutcome::Success(TimedLatency {
                    server_offset,
                    endpoint_offset,
                    duration: start.elapsed(),
                }),
                Err(mismatch) => RequestOutcome::Failure(format!("{}: {mismatch}", tc.name)),
            },
            Err(e) => RequestOutcome::Failure(format!("{}: {e}", tc.name)),
        },
    }
}
