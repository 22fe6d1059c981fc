//! Multi-step sequence execution
//!
//! Runs ordered request chains with per-cycle variable generation,
//! `{name}` placeholder substitution, and response-field capture
//! shared across steps. Uses the same closed-loop worker-pool shape as
//! the flat endpoint dispatcher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::{Client, Method};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::engine::json_subset;
use crate::models::{
    nearest_rank, LoadBound, ResolvedSequence, SequenceReport, SequenceStep, StepStats, VarKind,
    VarSpec,
};

/// Variable scope for one cycle: generated vars (None = omitted
/// optional) plus values captured from step responses.
#[derive(Clone, Debug, Default)]
pub struct Scope {
    vars: HashMap<String, Option<Value>>,
    captured: HashMap<String, Value>,
}

impl Scope {
    /// Look up a name: captured values shadow generated vars.
    fn lookup(&self, name: &str) -> Option<Option<&Value>> {
        if let Some(v) = self.captured.get(name) {
            return Some(Some(v));
        }
        self.vars.get(name).map(|v| v.as_ref())
    }

    fn capture(&mut self, name: &str, value: Value) {
        self.captured.insert(name.to_string(), value);
    }
}

/// Generate the cycle's variables from their specs.
///
/// With probability `optional` a variable is omitted for the cycle;
/// omitted values substitute as null and drop their containing map
/// keys.
pub fn materialize_vars(
    specs: &indexmap::IndexMap<String, VarSpec>,
    worker_id: usize,
    cycle: u64,
) -> Scope {
    let mut rng = rand::thread_rng();
    let mut vars = HashMap::with_capacity(specs.len());

    for (name, spec) in specs {
        let omitted = spec.optional > 0.0 && rng.gen::<f64>() < spec.optional;
        let value = if omitted {
            None
        } else {
            Some(match spec.kind {
                VarKind::Email => Value::String(format!("user-{worker_id}-{cycle}@test.com")),
                VarKind::Int => Value::from(rng.gen_range(spec.min..=spec.max)),
            })
        };
        vars.insert(name.clone(), value);
    }

    Scope {
        vars,
        captured: HashMap::new(),
    }
}

/// String form used for path and textual substitution: strings render
/// without quotes, everything else via its JSON form.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace `{name}` placeholders in a path template.
///
/// An unknown or omitted variable is a step failure, not an empty
/// segment.
pub fn substitute_path(template: &str, scope: &Scope) -> Result<String, String> {
    substitute_text(template, scope, false)
}

fn substitute_text(template: &str, scope: &Scope, allow_null: bool) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let Some(close) = rest[open..].find('}') else {
            out.push_str(&rest[open..]);
            return Ok(out);
        };
        let name = &rest[open + 1..open + close];
        match scope.lookup(name) {
            Some(Some(value)) => out.push_str(&render(value)),
            Some(None) if allow_null => {}
            Some(None) => return Err(format!("variable \"{name}\" omitted")),
            None => return Err(format!("unresolved placeholder \"{name}\"")),
        }
        rest = &rest[open + close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Substitute placeholders in a JSON body.
///
/// A string that is exactly `"{name}"` is replaced by the typed value
/// (preserving numbers and objects); other strings substitute
/// textually. Values resolving to an omitted variable return `None`,
/// which drops the containing map key.
pub fn substitute_body(body: &Value, scope: &Scope) -> Result<Option<Value>, String> {
    match body {
        Value::String(s) => {
            if let Some(name) = exact_placeholder(s) {
                return match scope.lookup(name) {
                    Some(Some(value)) => Ok(Some(value.clone())),
                    Some(None) => Ok(None),
                    None => Err(format!("unresolved placeholder \"{name}\"")),
                };
            }
            Ok(Some(Value::String(substitute_text(s, scope, true)?)))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                if let Some(substituted) = substitute_body(value, scope)? {
                    out.insert(key.clone(), substituted);
                }
            }
            Ok(Some(Value::Object(out)))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(substitute_body(item, scope)?.unwrap_or(Value::Null));
            }
            Ok(Some(Value::Array(out)))
        }
        other => Ok(Some(other.clone())),
    }
}

/// `"{name}"` if the whole string is one placeholder.
fn exact_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix('{')?.strip_suffix('}')?;
    if inner.is_empty() || inner.contains('{') || inner.contains('}') {
        return None;
    }
    Some(inner)
}

/// A finished sequence run: the report plus the raw successful-cycle
/// durations kept for the metric sink.
#[derive(Clone, Debug)]
pub struct SequenceRun {
    pub report: SequenceReport,
    pub cycle_durations: Vec<Duration>,
}

/// Result of one executed cycle.
struct CycleResult {
    total: Duration,
    /// Duration and success flag per executed step; steps after the
    /// failing one are absent.
    steps: Vec<(Duration, bool)>,
    failed_step: Option<usize>,
    error: Option<String>,
}

/// Sequence execution engine for one server.
pub struct SequenceRunner {
    client: Client,
    base_url: Url,
    request_timeout: Duration,
}

impl SequenceRunner {
    pub fn new(client: Client, base_url: Url, request_timeout: Duration) -> Self {
        Self {
            client,
            base_url,
            request_timeout,
        }
    }

    /// Run a sequence with `workers` parallel cycles until the bound is
    /// exhausted. A count bound runs that many cycles; a duration bound
    /// scales to `duration * step_count` since each cycle issues
    /// `step_count` requests.
    pub async fn run(
        &self,
        seq: &ResolvedSequence,
        workers: usize,
        bound: LoadBound,
        cancel: &CancellationToken,
    ) -> SequenceRun {
        let step_count = seq.steps.len();
        if step_count == 0 || workers == 0 {
            return SequenceRun {
                report: empty_report(seq),
                cycle_durations: Vec::new(),
            };
        }

        let bound_token = cancel.child_token();
        let cycle_bound = match bound {
            LoadBound::Iterations(n) => Some(n),
            LoadBound::Duration(d) => {
                let limit = d * step_count as u32;
                let token = bound_token.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(limit) => token.cancel(),
                    }
                });
                None
            }
        };

        let (work_tx, work_rx) = mpsc::channel::<u64>(workers * 2);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let generator_token = bound_token.clone();
        tokio::spawn(async move {
            let mut cycle: u64 = 0;
            loop {
                if let Some(n) = cycle_bound {
                    if cycle >= n {
                        break;
                    }
                }
                tokio::select! {
                    biased;
                    _ = generator_token.cancelled() => break,
                    sent = work_tx.send(cycle) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
                cycle += 1;
            }
        });

        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<CycleResult>();
        let seq = Arc::new(seq.clone());

        let mut pool = JoinSet::new();
        for worker_id in 0..workers {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let seq = seq.clone();
            let token = bound_token.clone();
            let client = self.client.clone();
            let base_url = self.base_url.clone();
            let request_timeout = self.request_timeout;

            pool.spawn(async move {
                loop {
                    let item = { work_rx.lock().await.recv().await };
                    let Some(cycle) = item else { break };

                    let result = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        result = run_cycle(
                            &client,
                            &base_url,
                            &seq,
                            worker_id,
                            cycle,
                            request_timeout,
                        ) => result,
                    };

                    if result_tx.send(result).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        // Fan-in.
        let mut totals: Vec<Duration> = Vec::new();
        let mut successes = 0u64;
        let mut failures = 0u64;
        let mut last_error = None;
        let mut failed_step = None;
        let mut per_step: Vec<StepAccumulator> = seq
            .steps
            .iter()
            .map(|s| StepAccumulator::new(&s.name))
            .collect();

        while let Some(cycle) = result_rx.recv().await {
            if cycle.failed_step.is_none() {
                successes += 1;
                totals.push(cycle.total);
            } else {
                failures += 1;
                failed_step = cycle.failed_step;
                if cycle.error.is_some() {
                    last_error = cycle.error;
                }
            }
            for (i, (duration, ok)) in cycle.steps.iter().enumerate() {
                per_step[i].record(*duration, *ok);
            }
        }

        while pool.join_next().await.is_some() {}

        debug!(
            sequence = %seq.display_name(),
            successes,
            failures,
            "sequence run drained"
        );

        let cycle_durations = totals.clone();
        let report =
            build_report(&seq, totals, successes, failures, per_step, last_error, failed_step);
        SequenceRun {
            report,
            cycle_durations,
        }
    }
}

/// Execute one full cycle; short-circuits at the first failing step.
async fn run_cycle(
    client: &Client,
    base_url: &Url,
    seq: &ResolvedSequence,
    worker_id: usize,
    cycle: u64,
    request_timeout: Duration,
) -> CycleResult {
    let mut scope = materialize_vars(&seq.vars, worker_id, cycle);
    let cycle_start = Instant::now();
    let mut steps: Vec<(Duration, bool)> = Vec::with_capacity(seq.steps.len());

    for (index, step) in seq.steps.iter().enumerate() {
        let step_start = Instant::now();
        match run_step(client, base_url, step, &mut scope, request_timeout).await {
            Ok(()) => steps.push((step_start.elapsed(), true)),
            Err(message) => {
                steps.push((step_start.elapsed(), false));
                return CycleResult {
                    total: cycle_start.elapsed(),
                    steps,
                    failed_step: Some(index),
                    error: Some(format!("{} step {index} ({}): {message}", seq.id, step.name)),
                };
            }
        }
    }

    CycleResult {
        total: cycle_start.elapsed(),
        steps,
        failed_step: None,
        error: None,
    }
}

/// Execute one step: substitute, issue, validate, capture.
async fn run_step(
    client: &Client,
    base_url: &Url,
    step: &SequenceStep,
    scope: &mut Scope,
    request_timeout: Duration,
) -> Result<(), String> {
    let path = substitute_path(&step.path_template, scope)?;
    let url = base_url
        .join(&path)
        .map_err(|e| format!("invalid path \"{path}\": {e}"))?;

    let method = Method::from_bytes(step.method.as_bytes())
        .map_err(|_| format!("invalid method {}", step.method))?;

    let mut builder = client.request(method, url).timeout(request_timeout);
    for (name, value) in &step.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &step.body {
        let substituted = substitute_body(body, scope)?.unwrap_or(Value::Null);
        builder = builder
            .header("Content-Type", "application/json")
            .body(substituted.to_string());
    }

    let response = builder.send().await.map_err(|e| e.to_string())?;
    let status = response.status().as_u16();
    let body = response.bytes().await.map_err(|e| e.to_string())?;

    if status != step.expected_status {
        return Err(format!(
            "status: expected {}, got {status}",
            step.expected_status
        ));
    }

    let parsed: Option<Value> = serde_json::from_slice(&body).ok();

    if let Some(expected) = &step.expected_body {
        let actual = parsed
            .as_ref()
            .ok_or_else(|| "body: invalid JSON".to_string())?;
        if !json_subset(expected, actual) {
            return Err(format!("body: expected subset {expected}, got {actual}"));
        }
    }

    for (field, var_name) in &step.capture {
        let value = parsed
            .as_ref()
            .and_then(|v| v.get(field))
            .ok_or_else(|| format!("capture: field \"{field}\" missing from response"))?;
        scope.capture(var_name, value.clone());
    }

    Ok(())
}

/// Running per-step aggregation.
struct StepAccumulator {
    name: String,
    latencies: Vec<Duration>,
    attempts: u64,
    failures: u64,
}

impl StepAccumulator {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            latencies: Vec::new(),
            attempts: 0,
            failures: 0,
        }
    }

    fn record(&mut self, duration: Duration, ok: bool) {
        self.attempts += 1;
        if ok {
            self.latencies.push(duration);
        } else {
            self.failures += 1;
        }
    }

    fn finish(mut self) -> StepStats {
        self.latencies.sort_unstable();
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        let (avg, low, high, p50, p95, p99) = if self.latencies.is_empty() {
            (0.0, 0.0, 0.0, 0.0, 0.0, 0.0)
        } else {
            let sum: Duration = self.latencies.iter().sum();
            (
                ms(sum / self.latencies.len() as u32),
                ms(self.latencies[0]),
                ms(self.latencies[self.latencies.len() - 1]),
                ms(nearest_rank(&self.latencies, 50)),
                ms(nearest_rank(&self.latencies, 95)),
                ms(nearest_rank(&self.latencies, 99)),
            )
        };

        StepStats {
            name: self.name,
            count: self.latencies.len() as u64,
            attempts: self.attempts,
            failures: self.failures,
            avg_ms: avg,
            low_ms: low,
            high_ms: high,
            p50_ms: p50,
            p95_ms: p95,
            p99_ms: p99,
        }
    }
}

fn empty_report(seq: &ResolvedSequence) -> SequenceReport {
    SequenceReport {
        id: seq.id.clone(),
        database: seq.database.clone(),
        total_runs: 0,
        successes: 0,
        failures: 0,
        success_rate: 0.0,
        avg_ms: 0.0,
        p50_ms: 0.0,
        p95_ms: 0.0,
        p99_ms: 0.0,
        steps: Vec::new(),
        last_error: None,
        failed_step: None,
    }
}

fn build_report(
    seq: &ResolvedSequence,
    mut totals: Vec<Duration>,
    successes: u64,
    failures: u64,
    per_step: Vec<StepAccumulator>,
    last_error: Option<String>,
    failed_step: Option<usize>,
) -> SequenceReport {
    totals.sort_unstable();
    let ms = |d: Duration| d.as_secs_f64() * 1000.0;
    let (avg, p50, p95, p99) = if totals.is_empty() {
        (0.0, 0.0, 0.0, 0.0)
    } else {
        let sum: Duration = totals.iter().sum();
        (
            ms(sum / totals.len() as u32),
            ms(nearest_rank(&totals, 50)),
            ms(nearest_rank(&totals, 95)),
            ms(nearest_rank(&totals, 99)),
        )
    };

    let total_runs = successes + failures;
    SequenceReport {
        id: seq.id.clone(),
        database: seq.database.clone(),
        total_runs,
        successes,
        failures,
        success_rate: if total_runs > 0 {
            successes as f64 / total_runs as f64
        } else {
            0.0
        },
        avg_ms: avg,
        p50_ms: p50,
        p95_ms: p95,
        p99_ms: p99,
        steps: per_step.into_iter().map(StepAccumulator::finish).collect(),
        last_error,
        failed_step,
    }
}
