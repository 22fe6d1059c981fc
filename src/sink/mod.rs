//! Time-series metric sink
//!
//! Fire-and-forget InfluxDB line-protocol export. Raw latency points
//! are Bernoulli-sampled per point; aggregated points are always
//! emitted. Points batch in memory and flush asynchronously; the
//! orchestrator awaits `wait()` before shutdown so inflight batches
//! are not lost. Sink failures are logged once and never fail a
//! benchmark.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::{MetaReport, ResourceStats, TimedLatency};

/// Buffer flushes once it holds this many points.
const BATCH_SIZE: usize = 5000;

/// Sink connection settings from the `influx` config section.
#[derive(Clone, Debug, Deserialize)]
pub struct InfluxSettings {
    pub url: String,
    pub database: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

fn default_sample_rate() -> f64 {
    1.0
}

struct SinkInner {
    client: reqwest::Client,
    write_url: String,
    token: Option<String>,
    sample_rate: f64,
    buffer: Mutex<Vec<String>>,
    inflight: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    error_logged: AtomicBool,
}

/// Handle to the metric sink. Every write is a no-op when the sink is
/// unconfigured or its context has been canceled.
#[derive(Clone)]
pub struct MetricSink {
    inner: Option<Arc<SinkInner>>,
}

impl MetricSink {
    /// A sink that drops everything.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn new(settings: &InfluxSettings, cancel: CancellationToken) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("sink client");

        let write_url = format!(
            "{}/write?db={}",
            settings.url.trim_end_matches('/'),
            settings.database
        );

        Self {
            inner: Some(Arc::new(SinkInner {
                client,
                write_url,
                token: settings.token.clone(),
                sample_rate: settings.sample_rate.clamp(0.0, 1.0),
                buffer: Mutex::new(Vec::new()),
                inflight: Mutex::new(Vec::new()),
                cancel,
                error_logged: AtomicBool::new(false),
            })),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Raw per-request latency points, Bernoulli-sampled.
    pub fn write_endpoint_latencies(
        &self,
        server: &str,
        endpoint: &str,
        anchor: DateTime<Utc>,
        samples: &[TimedLatency],
    ) {
        let Some(inner) = self.active() else { return };

        let points: Vec<String> = samples
            .iter()
            .filter(|_| inner.sample_rate >= 1.0 || rand::random::<f64>() < inner.sample_rate)
            .map(|sample| endpoint_point(server, endpoint, anchor, sample))
            .collect();
        self.push(points);
    }

    /// Raw per-cycle sequence durations, Bernoulli-sampled.
    pub fn write_sequence_latencies(
        &self,
        server: &str,
        sequence: &str,
        anchor: DateTime<Utc>,
        cycle_durations: &[Duration],
    ) {
        let Some(inner) = self.active() else { return };

        let ns = timestamp_ns(anchor);
        let points: Vec<String> = cycle_durations
            .iter()
            .filter(|_| inner.sample_rate >= 1.0 || rand::random::<f64>() < inner.sample_rate)
            .map(|duration| {
                format!(
                    "sequence_latency,server={},sequence={} duration_ms={} {}",
                    escape_tag(server),
                    escape_tag(sequence),
                    duration.as_secs_f64() * 1000.0,
                    ns
                )
            })
            .collect();
        self.push(points);
    }

    /// Aggregated resource usage, always emitted.
    pub fn write_resource_stats(&self, server: &str, anchor: DateTime<Utc>, stats: &ResourceStats) {
        if self.active().is_none() {
            return;
        }
        let point = format!(
            "resource_usage,server={} memory_mb_min={},memory_mb_avg={},memory_mb_max={},cpu_pct_min={},cpu_pct_avg={},cpu_pct_max={},samples={}i {}",
            escape_tag(server),
            stats.memory_mb.min,
            stats.memory_mb.avg,
            stats.memory_mb.max,
            stats.cpu_percent.min,
            stats.cpu_percent.avg,
            stats.cpu_percent.max,
            stats.samples,
            timestamp_ns(anchor),
        );
        self.push(vec![point]);
    }

    /// Run-level summary, always emitted.
    pub fn write_run_meta(&self, meta: &MetaReport) {
        if self.active().is_none() {
            return;
        }
        let point = format!(
            "benchmark_run total_servers={}i,successful={}i,failed={}i,total_duration_ms={}i {}",
            meta.summary.total_servers,
            meta.summary.successful,
            meta.summary.failed,
            meta.summary.total_duration_ms,
            timestamp_ns(meta.meta.timestamp),
        );
        self.push(vec![point]);
    }

    /// Flush whatever is buffered without waiting for a full batch.
    pub fn flush(&self) {
        let Some(inner) = self.active() else { return };
        let batch = {
            let mut buffer = inner.buffer.lock().expect("sink buffer");
            std::mem::take(&mut *buffer)
        };
        if !batch.is_empty() {
            spawn_flush(inner, batch);
        }
    }

    /// Drain the buffer and await every inflight write.
    pub async fn wait(&self) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        self.flush();

        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut inflight = inner.inflight.lock().expect("sink inflight");
                std::mem::take(&mut *inflight)
            };
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    fn active(&self) -> Option<&Arc<SinkInner>> {
        let inner = self.inner.as_ref()?;
        if inner.cancel.is_cancelled() {
            return None;
        }
        Some(inner)
    }

    fn push(&self, points: Vec<String>) {
        let Some(inner) = self.active() else { return };
        if points.is_empty() {
            return;
        }

        let batch = {
            let mut buffer = inner.buffer.lock().expect("sink buffer");
            buffer.extend(points);
            if buffer.len() >= BATCH_SIZE {
                std::mem::take(&mut *buffer)
            } else {
                Vec::new()
            }
        };

        if !batch.is_empty() {
            spawn_flush(inner, batch);
        }
    }
}

fn spawn_flush(inner: &Arc<SinkInner>, batch: Vec<String>) {
    let sink = inner.clone();
    let handle = tokio::spawn(async move {
        let body = batch.join("\n");
        let mut request = sink.client.post(&sink.write_url).body(body);
        if let Some(token) = &sink.token {
            request = request.header("Authorization", format!("Token {token}"));
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(points = batch.len(), "metric batch written");
            }
            Ok(response) => log_once(&sink, &format!("sink returned {}", response.status())),
            Err(e) => log_once(&sink, &e.to_string()),
        }
    });

    let mut inflight = inner.inflight.lock().expect("sink inflight");
    inflight.retain(|h| !h.is_finished());
    inflight.push(handle);
}

fn log_once(inner: &SinkInner, message: &str) {
    if !inner.error_logged.swap(true, Ordering::Relaxed) {
        warn!(error = message, "metric sink write failed; further errors suppressed");
    }
}

fn endpoint_point(
    server: &str,
    endpoint: &str,
    anchor: DateTime<Utc>,
    sample: &TimedLatency,
) -> String {
    // Points are timestamped at their actual dispatch time so the
    // series reconstructs the run's temporal layout.
    let ns = timestamp_ns(anchor) + sample.server_offset.as_nanos() as i64;
    format!(
        "endpoint_latency,server={},endpoint={} duration_ms={},endpoint_offset_ms={} {}",
        escape_tag(server),
        escape_tag(endpoint),
        sample.duration.as_secs_f64() * 1000.0,
        sample.endpoint_offset.as_secs_f64() * 1000.0,
        ns
    )
}

fn timestamp_ns(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt().unwrap_or(0)
}

/// Escape line-protocol tag values: spaces, commas and equals signs.
fn escape_tag(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace(' ', "\\ ")
        .replace(',', "\\,")
        .replace('=', "\\=")
}
