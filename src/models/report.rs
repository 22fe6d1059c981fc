//! Report records and latency statistics
//!
//! Everything serialized into `results/{server}.json` and the
//! `results.json` meta file lives here, together with the statistics
//! math that fills it in.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A latency sample tagged with offsets from server start and endpoint
/// start, so downstream consumers can reconstruct temporal layout.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimedLatency {
    pub server_offset: Duration,
    pub endpoint_offset: Duration,
    pub duration: Duration,
}

/// Latency statistics over one endpoint run.
///
/// `count` is the number of successes, `total_count` the number of
/// completed attempts (successes plus failures); canceled requests are
/// tracked separately and appear in neither.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub count: u64,
    pub total_count: u64,
    pub avg_ms: f64,
    pub low_ms: f64,
    pub high_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    /// `count / total_count`, 0.0 when nothing completed.
    pub success_rate: f64,
}

impl Stats {
    /// Compute statistics from success latencies and a failure count.
    ///
    /// Sorts the slice in place. All duration fields are zero when
    /// there were no successes.
    pub fn from_latencies(latencies: &mut [Duration], failures: u64) -> Self {
        let count = latencies.len() as u64;
        let total_count = count + failures;
        let success_rate = if total_count > 0 {
            count as f64 / total_count as f64
        } else {
            0.0
        };

        if latencies.is_empty() {
            return Self {
                count,
                total_count,
                success_rate,
                ..Default::default()
            };
        }

        latencies.sort_unstable();

        let sum: Duration = latencies.iter().sum();
        let avg = sum / latencies.len() as u32;

        Self {
            count,
            total_count,
            avg_ms: to_ms(avg),
            low_ms: to_ms(latencies[0]),
            high_ms: to_ms(latencies[latencies.len() - 1]),
            p50_ms: to_ms(nearest_rank(latencies, 50)),
            p95_ms: to_ms(nearest_rank(latencies, 95)),
            p99_ms: to_ms(nearest_rank(latencies, 99)),
            success_rate,
        }
    }

    /// Number of failed attempts.
    pub fn failures(&self) -> u64 {
        self.total_count - self.count
    }
}

/// Nearest-rank percentile: index `p * n / 100` into the sorted slice,
/// clamped to the last element.
pub fn nearest_rank(sorted: &[Duration], p: u64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = (p as usize * sorted.len()) / 100;
    sorted[idx.min(sorted.len() - 1)]
}

fn to_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// min/avg/max of one resource gauge.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GaugeStats {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

impl GaugeStats {
    /// Aggregate a sample series; all zeros when empty.
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        let mut sum = 0.0;
        for &s in samples {
            min = min.min(s);
            max = max.max(s);
            sum += s;
        }
        Self {
            min,
            avg: sum / samples.len() as f64,
            max,
        }
    }
}

/// Container resource usage over a server's benchmark window.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceStats {
    pub memory_mb: GaugeStats,
    pub cpu_percent: GaugeStats,
    pub samples: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Per-endpoint section of a server report.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointReport {
    pub name: String,
    pub method: String,
    pub path: String,
    pub stats: Stats,
    #[serde(default)]
    pub canceled: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Per-step section of a sequence report.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StepStats {
    pub name: String,
    /// Successful executions within fully or partially successful
    /// cycles.
    pub count: u64,
    /// All executions, including the failing step of failed cycles.
    pub attempts: u64,
    pub failures: u64,
    pub avg_ms: f64,
    pub low_ms: f64,
    pub high_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Per-sequence section of a server report.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SequenceReport {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    pub total_runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    /// Statistics over whole-cycle durations.
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub steps: Vec<StepStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Zero-based index of the first failing step of the last failed
    /// cycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<usize>,
}

/// Capacity search result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapacityReport {
    pub max_workers_passed: usize,
    pub achieved_rps: f64,
    pub p99_ms: f64,
    pub success_rate: f64,
    pub iterations: u32,
}

/// Full per-server result, the unit persisted to
/// `results/{server}.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerReport {
    pub server: String,
    pub image: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Empty on success; infrastructure failures land here and the
    /// rest of the report stays partial.
    #[serde(default)]
    pub error: String,
    pub overall: Stats,
    pub endpoints: Vec<EndpointReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sequences: Vec<SequenceReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<CapacityReport>,
}

/// Run-level configuration echo embedded in the meta file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub workers: usize,
    pub bound: String,
    pub request_timeout_ms: u64,
    pub warmup: bool,
    pub resources: bool,
    pub capacity: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub databases: Vec<String>,
}

/// `results.json` meta record built from the per-server files.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetaReport {
    pub meta: MetaInfo,
    pub summary: MetaSummary,
    pub servers: Vec<ServerReport>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetaInfo {
    pub timestamp: DateTime<Utc>,
    pub config: ConfigSummary,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetaSummary {
    pub total_servers: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_duration_ms: u64,
}
