//! Result aggregation and persistence
//!
//! Streams per-server JSON reports to the results directory and builds
//! the `results.json` meta file from directory contents. Per-server
//! files are the source of truth: if the run is interrupted midway,
//! the files already written still form a consistent record.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::models::{
    ConfigSummary, EndpointReport, MetaInfo, MetaReport, MetaSummary, ServerReport, Stats,
};

/// Name of the meta file; excluded when enumerating per-server files.
const META_FILE: &str = "results.json";

/// Combine per-endpoint stats into server-level overall stats.
///
/// Averages and percentiles are weighted by each endpoint's success
/// count; low/high aggregate across endpoints; the success rate is
/// recomputed from the summed counts rather than averaged.
pub fn overall_stats(endpoints: &[EndpointReport]) -> Stats {
    let mut count = 0u64;
    let mut total_count = 0u64;
    let mut low = f64::MAX;
    let mut high = 0.0f64;
    let mut avg_weighted = 0.0;
    let mut p50_weighted = 0.0;
    let mut p95_weighted = 0.0;
    let mut p99_weighted = 0.0;

    for endpoint in endpoints {
        let s = &endpoint.stats;
        count += s.count;
        total_count += s.total_count;
        if s.count > 0 {
            let weight = s.count as f64;
            avg_weighted += s.avg_ms * weight;
            p50_weighted += s.p50_ms * weight;
            p95_weighted += s.p95_ms * weight;
            p99_weighted += s.p99_ms * weight;
            low = low.min(s.low_ms);
            high = high.max(s.high_ms);
        }
    }

    if count == 0 {
        return Stats {
            count,
            total_count,
            ..Default::default()
        };
    }

    let weight = count as f64;
    Stats {
        count,
        total_count,
        avg_ms: avg_weighted / weight,
        low_ms: low,
        high_ms: high,
        p50_ms: p50_weighted / weight,
        p95_ms: p95_weighted / weight,
        p99_ms: p99_weighted / weight,
        success_rate: count as f64 / total_count as f64,
    }
}

/// Writes per-server reports and the meta file.
pub struct ResultsWriter {
    dir: PathBuf,
}

impl ResultsWriter {
    /// Create the writer, ensuring the directory exists.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create results directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write one server report to `{dir}/{server}.json` with owner-only
    /// permissions. Pretty-printed with two-space indentation; field
    /// order is fixed, so identical reports produce identical bytes.
    pub fn write_server(&self, report: &ServerReport) -> Result<PathBuf> {
        let path = self.dir.join(format!("{}.json", report.server));
        let file = File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        restrict_permissions(&file)?;

        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, report)
            .with_context(|| format!("Failed to serialize report for {}", report.server))?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        info!(server = %report.server, path = %path.display(), "server report written");
        Ok(path)
    }

    /// Enumerate the per-server files and write the meta file.
    pub fn write_meta(&self, config: ConfigSummary, total_duration_ms: u64) -> Result<MetaReport> {
        let servers = self.load_server_reports()?;

        let successful = servers.iter().filter(|s| s.error.is_empty()).count();
        let meta = MetaReport {
            meta: MetaInfo {
                timestamp: Utc::now(),
                config,
            },
            summary: MetaSummary {
                total_servers: servers.len(),
                successful,
                failed: servers.len() - successful,
                total_duration_ms,
            },
            servers,
        };

        let path = self.dir.join(META_FILE);
        let file = File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        restrict_permissions(&file)?;

        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &meta).context("Failed to serialize meta")?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        info!(path = %path.display(), servers = meta.summary.total_servers, "meta file written");
        Ok(meta)
    }

    /// Load every `{server}.json` in the directory, skipping the meta
    /// file and anything unparsable.
    pub fn load_server_reports(&self) -> Result<Vec<ServerReport>> {
        let mut reports = Vec::new();

        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read {}", self.dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if !name.ends_with(".json") || name == META_FILE {
                continue;
            }

            let file = match File::open(&path) {
                Ok(file) => file,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable result file");
                    continue;
                }
            };
            match serde_json::from_reader::<_, ServerReport>(BufReader::new(file)) {
                Ok(report) => reports.push(report),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unparsable result file");
                }
            }
        }

        reports.sort_by(|a, b| a.server.cmp(&b.server));
        debug!(count = reports.len(), "loaded server reports");
        Ok(reports)
    }
}

#[cfg(unix)]
fn restrict_permissions(file: &File) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = fs::Permissions::from_mode(0o600);
    file.set_permissions(permissions)
        .context("Failed to set result file permissions")?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &File) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Stats;
    use tempfile::tempdir;

    fn endpoint(name: &str, count: u64, failures: u64, avg: f64, p99: f64) -> EndpointReport {
        EndpointReport {
            name: name.to_string(),
            method: "GET".into(),
            path: format!("/{name}"),
            stats: Stats {
                count,
                total_count: count + failures,
                avg_ms: avg,
                low_ms: avg / 2.0,
                high_ms: p99 * 1.5,
                p50_ms: avg,
                p95_ms: p99 * 0.9,
                p99_ms: p99,
                success_rate: if count + failures > 0 {
                    count as f64 / (count + failures) as f64
                } else {
                    0.0
                },
            },
            canceled: 0,
            last_error: None,
        }
    }

    fn report(server: &str, error: &str) -> ServerReport {
        let endpoints = vec![endpoint("a", 10, 0, 5.0, 9.0)];
        ServerReport {
            server: server.to_string(),
            image: format!("bench/{server}"),
            started_at: Utc::now(),
            duration_ms: 100,
            error: error.to_string(),
            overall: overall_stats(&endpoints),
            endpoints,
            sequences: Vec::new(),
            resources: None,
            capacity: None,
        }
    }

    #[test]
    fn test_overall_stats_weighted() {
        let endpoints = vec![
            // 100 successes at 10ms avg
            endpoint("fast", 100, 0, 10.0, 20.0),
            // 300 successes at 30ms avg
            endpoint("slow", 300, 100, 30.0, 60.0),
        ];
        let overall = overall_stats(&endpoints);

        assert_eq!(overall.count, 400);
        assert_eq!(overall.total_count, 500);
        // (10*100 + 30*300) / 400 = 25
        assert!((overall.avg_ms - 25.0).abs() < 1e-9);
        assert_eq!(overall.success_rate, 0.8);
        assert_eq!(overall.low_ms, 5.0);
        assert_eq!(overall.high_ms, 90.0);
    }

    #[test]
    fn test_overall_stats_empty() {
        let overall = overall_stats(&[]);
        assert_eq!(overall.count, 0);
        assert_eq!(overall.avg_ms, 0.0);
    }

    #[test]
    fn test_write_server_is_deterministic() {
        let dir = tempdir().unwrap();
        let writer = ResultsWriter::new(dir.path()).unwrap();

        let report = report("axum", "");
        let path = writer.write_server(&report).unwrap();
        let first = fs::read(&path).unwrap();
        writer.write_server(&report).unwrap();
        let second = fs::read(&path).unwrap();

        assert_eq!(first, second);
        assert!(path.file_name().unwrap().to_string_lossy() == "axum.json");
    }

    #[cfg(unix)]
    #[test]
    fn test_write_server_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let writer = ResultsWriter::new(dir.path()).unwrap();
        let path = writer.write_server(&report("axum", "")).unwrap();

        let mode = fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_meta_from_directory() {
        let dir = tempdir().unwrap();
        let writer = ResultsWriter::new(dir.path()).unwrap();

        writer.write_server(&report("axum", "")).unwrap();
        writer.write_server(&report("actix", "container failed")).unwrap();

        let config = ConfigSummary {
            workers: 8,
            bound: "100 requests/endpoint".into(),
            request_timeout_ms: 5000,
            warmup: true,
            resources: true,
            capacity: false,
            databases: Vec::new(),
        };
        let meta = writer.write_meta(config, 12345).unwrap();

        assert_eq!(meta.summary.total_servers, 2);
        assert_eq!(meta.summary.successful, 1);
        assert_eq!(meta.summary.failed, 1);
        assert_eq!(meta.summary.total_duration_ms, 12345);
        // sorted by name
        assert_eq!(meta.servers[0].server, "actix");

        // meta file itself is excluded from a rebuild
        let meta2 = writer
            .write_meta(meta.meta.config.clone(), 12345)
            .unwrap();
        assert_eq!(meta2.summary.total_servers, 2);
    }
}
