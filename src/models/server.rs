//! Resolved server and sequence definitions
//!
//! These are the immutable products of configuration resolution. The
//! orchestrator owns a `ResolvedServer` for the duration of that
//! server's benchmark; nothing mutates it during execution.

use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value;
use url::Url;

use super::testcase::Testcase;

/// Per-endpoint load bound. The resolver picks exactly one form for a
/// whole run; the two are never mixed for a single endpoint.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LoadBound {
    /// Fixed number of requests per endpoint.
    Iterations(u64),
    /// Fixed wall-clock duration per endpoint.
    Duration(Duration),
}

impl LoadBound {
    /// Human-readable form for summaries and the meta file.
    pub fn describe(&self) -> String {
        match self {
            LoadBound::Iterations(n) => format!("{n} requests/endpoint"),
            LoadBound::Duration(d) => format!("{:.1}s/endpoint", d.as_secs_f64()),
        }
    }

    /// Expected sample count hint used to pre-size latency buffers.
    pub fn count_hint(&self, workers: usize) -> usize {
        match self {
            LoadBound::Iterations(n) => *n as usize,
            // Rough guess: a worker completing a request every 10ms.
            LoadBound::Duration(d) => (d.as_millis() as usize / 10).max(16) * workers,
        }
    }
}

/// Warmup phase settings.
#[derive(Clone, Copy, Debug)]
pub struct WarmupSettings {
    pub enabled: bool,
    pub duration: Duration,
    pub pause: Duration,
}

impl Default for WarmupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            duration: Duration::from_secs(5),
            pause: Duration::from_secs(1),
        }
    }
}

/// Capacity search settings.
#[derive(Clone, Debug)]
pub struct CapacitySettings {
    pub enabled: bool,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Search convergence window as a fraction of `max - min`.
    pub search_precision: f64,
    /// Success-rate SLO as a fraction in (0, 1].
    pub min_success_rate: f64,
    /// p99 latency SLO.
    pub p99_threshold: Duration,
    pub warmup_duration: Duration,
    pub measure_duration: Duration,
    pub iteration_pause: Duration,
    pub pre_run_pause: Duration,
}

impl Default for CapacitySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            min_workers: 1,
            max_workers: 256,
            search_precision: 0.05,
            min_success_rate: 0.99,
            p99_threshold: Duration::from_millis(200),
            warmup_duration: Duration::from_secs(2),
            measure_duration: Duration::from_secs(5),
            iteration_pause: Duration::from_secs(1),
            pre_run_pause: Duration::from_secs(2),
        }
    }
}

/// One server under test, fully resolved.
#[derive(Clone, Debug)]
pub struct ResolvedServer {
    pub name: String,
    pub image: String,
    pub container_port: u16,
    pub host_port: u16,
    pub base_url: Url,
    pub request_timeout: Duration,
    /// Docker `--cpus` value, if limited.
    pub cpu_limit: Option<f64>,
    /// Docker `--memory` value, normalized (e.g. `512mb`), if limited.
    pub memory_limit: Option<String>,
    pub workers: usize,
    pub bound: LoadBound,
    /// Flat testcases in declaration order.
    pub testcases: Vec<Testcase>,
    /// Declared endpoint names in declaration order, one entry per
    /// endpoint; the report iterates this.
    pub endpoint_order: Vec<String>,
    pub warmup: WarmupSettings,
    pub resources_enabled: bool,
    pub capacity: CapacitySettings,
    pub sequences: Vec<ResolvedSequence>,
}

/// Variable kinds a sequence can generate per cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarKind {
    /// `user-{worker}-{cycle}@test.com`
    Email,
    /// Uniform integer in `[min, max]`.
    Int,
}

/// Generator spec for one sequence variable.
#[derive(Clone, Debug)]
pub struct VarSpec {
    pub kind: VarKind,
    pub min: i64,
    pub max: i64,
    /// Probability the variable is omitted for a cycle (0.0 = always
    /// present).
    pub optional: f64,
}

/// One step of a resolved sequence.
#[derive(Clone, Debug)]
pub struct SequenceStep {
    /// Declared endpoint name of this step.
    pub name: String,
    pub method: String,
    /// Path with `{database}` already substituted; `{var}` placeholders
    /// remain for runtime substitution.
    pub path_template: String,
    pub headers: IndexMap<String, String>,
    pub body: Option<Value>,
    pub expected_status: u16,
    pub expected_body: Option<Value>,
    /// response field -> variable name to capture into the cycle scope.
    pub capture: IndexMap<String, String>,
}

/// An ordered multi-step request chain.
#[derive(Clone, Debug)]
pub struct ResolvedSequence {
    pub id: String,
    pub database: Option<String>,
    pub vars: IndexMap<String, VarSpec>,
    pub steps: Vec<SequenceStep>,
}

impl ResolvedSequence {
    /// Display name: `id` or `id (database)`.
    pub fn display_name(&self) -> String {
        match &self.database {
            Some(db) => format!("{} ({db})", self.id),
            None => self.id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_bound_describe() {
        assert_eq!(LoadBound::Iterations(100).describe(), "100 requests/endpoint");
        assert_eq!(
            LoadBound::Duration(Duration::from_secs(10)).describe(),
            "10.0s/endpoint"
        );
    }

    #[test]
    fn test_count_hint() {
        assert_eq!(LoadBound::Iterations(500).count_hint(8), 500);
        assert!(LoadBound::Duration(Duration::from_secs(1)).count_hint(4) >= 64);
    }

    #[test]
    fn test_sequence_display_name() {
        let seq = ResolvedSequence {
            id: "signup".into(),
            database: Some("postgres".into()),
            vars: IndexMap::new(),
            steps: Vec::new(),
        };
        assert_eq!(seq.display_name(), "signup (postgres)");
    }
}
