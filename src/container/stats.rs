//! Container resource sampling
//!
//! Streams memory and CPU samples from the Docker stats endpoint
//! (roughly one record per second) on a dedicated task while the load
//! engine runs, then aggregates min/avg/max on stop.

use std::sync::{Arc, Mutex};

use bollard::container::StatsOptions;
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::models::{GaugeStats, ResourceStats};

/// Fewer samples than this triggers a "low samples" warning: the
/// aggregate is too coarse to mean much.
const MIN_SAMPLES: usize = 3;

#[derive(Default)]
struct SamplerState {
    memory_mb: Vec<f64>,
    cpu_percent: Vec<f64>,
    samples: usize,
}

/// Streams resource samples for one container between `start` and
/// `stop`. `start` is idempotent; `stop` may be called from any task.
#[derive(Default)]
pub struct ResourceSampler {
    state: Arc<Mutex<SamplerState>>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ResourceSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin streaming samples for `container_id`. Calling twice
    /// without an intervening `stop` is a no-op.
    pub fn start(&mut self, container_id: &str) {
        if self.task.is_some() {
            return;
        }

        let docker = match Docker::connect_with_socket_defaults() {
            Ok(docker) => docker,
            Err(e) => {
                warn!(error = %e, "docker socket unavailable, resource sampling disabled");
                return;
            }
        };

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let state = self.state.clone();
        let id = container_id.to_string();

        let task = tokio::spawn(async move {
            let options = StatsOptions {
                stream: true,
                one_shot: false,
            };
            let mut stream = Box::pin(docker.stats(&id, Some(options)));

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    item = stream.next() => match item {
                        Some(Ok(stats)) => record_sample(&state, &stats),
                        Some(Err(e)) => {
                            debug!(error = %e, "stats stream ended");
                            break;
                        }
                        None => break,
                    },
                }
            }
        });

        self.stop_tx = Some(stop_tx);
        self.task = Some(task);
    }

    /// Signal the stream to terminate, await the task, and aggregate.
    pub async fn stop(&mut self) -> ResourceStats {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }

        // Move the sample vectors out under the lock, reduce after
        // releasing it.
        let (memory, cpu, samples) = {
            let mut state = self.state.lock().expect("sampler state");
            (
                std::mem::take(&mut state.memory_mb),
                std::mem::take(&mut state.cpu_percent),
                std::mem::replace(&mut state.samples, 0),
            )
        };

        aggregate(&memory, &cpu, samples)
    }
}

fn record_sample(state: &Arc<Mutex<SamplerState>>, stats: &bollard::container::Stats) {
    let memory_mb = stats
        .memory_stats
        .usage
        .map(|bytes| bytes as f64 / (1024.0 * 1024.0));
    let cpu = cpu_percent(
        stats.cpu_stats.cpu_usage.total_usage,
        stats.precpu_stats.cpu_usage.total_usage,
        stats.cpu_stats.system_cpu_usage,
        stats.precpu_stats.system_cpu_usage,
        stats.cpu_stats.online_cpus,
    );

    let mut state = state.lock().expect("sampler state");
    state.samples += 1;
    if let Some(mb) = memory_mb {
        state.memory_mb.push(mb);
    }
    if let Some(pct) = cpu {
        state.cpu_percent.push(pct);
    }
}

/// CPU% = (Δcpu / Δsystem) × online_cpus × 100, clamped to
/// `online_cpus × 100`. Non-positive deltas (typically the stream's
/// first record, whose precpu counters are zero) yield `None`.
pub(crate) fn cpu_percent(
    cpu_total: u64,
    precpu_total: u64,
    system: Option<u64>,
    presystem: Option<u64>,
    online_cpus: Option<u64>,
) -> Option<f64> {
    let cpu_delta = cpu_total as i64 - precpu_total as i64;
    let system_delta = system.unwrap_or(0) as i64 - presystem.unwrap_or(0) as i64;
    if cpu_delta <= 0 || system_delta <= 0 {
        return None;
    }

    let online = online_cpus.unwrap_or(1).max(1) as f64;
    let pct = (cpu_delta as f64 / system_delta as f64) * online * 100.0;
    Some(pct.min(online * 100.0))
}

pub(crate) fn aggregate(memory_mb: &[f64], cpu_percent: &[f64], samples: usize) -> ResourceStats {
    let mut warnings = Vec::new();
    if samples < MIN_SAMPLES {
        warnings.push("low samples".to_string());
    }

    ResourceStats {
        memory_mb: GaugeStats::from_samples(memory_mb),
        cpu_percent: GaugeStats::from_samples(cpu_percent),
        samples,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_percent_formula() {
        // 25% of one of four CPUs worth of system time
        let pct = cpu_percent(1_000, 0, Some(16_000), Some(0), Some(4)).unwrap();
        assert!((pct - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_cpu_percent_clamped() {
        let pct = cpu_percent(100_000, 0, Some(1_000), Some(0), Some(2)).unwrap();
        assert_eq!(pct, 200.0);
    }

    #[test]
    fn test_cpu_percent_skips_first_sample() {
        // Zeroed precpu with zero system delta: skip.
        assert_eq!(cpu_percent(1_000, 0, Some(0), Some(0), Some(4)), None);
        // Counter went backwards: skip.
        assert_eq!(cpu_percent(500, 1_000, Some(10_000), Some(0), Some(4)), None);
    }

    #[test]
    fn test_aggregate_low_samples_warning() {
        let stats = aggregate(&[100.0, 110.0], &[5.0], 2);
        assert_eq!(stats.samples, 2);
        assert!(stats.warnings.iter().any(|w| w == "low samples"));

        let stats = aggregate(&[100.0, 110.0, 120.0], &[5.0, 6.0, 7.0], 3);
        assert!(stats.warnings.is_empty());
        assert_eq!(stats.memory_mb.min, 100.0);
        assert_eq!(stats.memory_mb.max, 120.0);
        assert_eq!(stats.cpu_percent.avg, 6.0);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_empty() {
        let mut sampler = ResourceSampler::new();
        let stats = sampler.stop().await;
        assert_eq!(stats.samples, 0);
        assert!(stats.warnings.iter().any(|w| w == "low samples"));
    }
}
