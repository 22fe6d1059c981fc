//! Terminal output formatting
//!
//! Renders per-server summaries and the cross-server comparison table,
//! plus CSV export of the comparison.

use std::path::Path;

use anyhow::{Context, Result};

use crate::models::{EndpointReport, ServerReport};

/// Per-endpoint status cell: `OK` at full success, `FAIL` at zero,
/// otherwise the success percentage.
pub fn endpoint_status(endpoint: &EndpointReport) -> String {
    let stats = &endpoint.stats;
    if stats.total_count == 0 {
        return "--".to_string();
    }
    if stats.count == stats.total_count {
        "OK".to_string()
    } else if stats.count == 0 {
        "FAIL".to_string()
    } else {
        format!("{:.0}%", stats.success_rate * 100.0)
    }
}

/// Render one server's section of the summary.
pub fn format_server_summary(report: &ServerReport) -> String {
    let mut out = String::new();

    out.push_str("\n┌──────────────────────────────────────────────────────────────────────────┐\n");
    out.push_str(&format!(
        "│ {:72} │\n",
        truncate(&format!("{} ({})", report.server, report.image), 72)
    ));
    out.push_str("├────────────────────────────────┬────────┬───────────┬────────┬──────────┤\n");
    out.push_str("│ Endpoint                       │ Status │   Avg(ms) │  Fails │ Canceled │\n");
    out.push_str("├────────────────────────────────┼────────┼───────────┼────────┼──────────┤\n");

    for endpoint in &report.endpoints {
        out.push_str(&format!(
            "│ {:30} │ {:>6} │ {:>9.2} │ {:>6} │ {:>8} │\n",
            truncate(&endpoint.name, 30),
            endpoint_status(endpoint),
            endpoint.stats.avg_ms,
            endpoint.stats.failures(),
            endpoint.canceled,
        ));
    }

    for sequence in &report.sequences {
        let display = match &sequence.database {
            Some(db) => format!("{} ({db}) [seq]", sequence.id),
            None => format!("{} [seq]", sequence.id),
        };
        let status = if sequence.total_runs == 0 {
            "--".to_string()
        } else if sequence.failures == 0 {
            "OK".to_string()
        } else if sequence.successes == 0 {
            "FAIL".to_string()
        } else {
            format!("{:.0}%", sequence.success_rate * 100.0)
        };
        out.push_str(&format!(
            "│ {:30} │ {:>6} │ {:>9.2} │ {:>6} │ {:>8} │\n",
            truncate(&display, 30),
            status,
            sequence.avg_ms,
            sequence.failures,
            0,
        ));
    }

    out.push_str("└────────────────────────────────┴────────┴───────────┴────────┴──────────┘\n");

    if !report.error.is_empty() {
        out.push_str(&format!("  error: {}\n", truncate(&report.error, 100)));
    }
    for endpoint in &report.endpoints {
        if let Some(last_error) = &endpoint.last_error {
            out.push_str(&format!(
                "  {}: {}\n",
                truncate(&endpoint.name, 30),
                truncate(last_error, 100)
            ));
        }
    }

    if let Some(resources) = &report.resources {
        out.push_str(&format!(
            "  resources: mem {:.1}/{:.1}/{:.1} MB, cpu {:.1}/{:.1}/{:.1}% ({} samples)\n",
            resources.memory_mb.min,
            resources.memory_mb.avg,
            resources.memory_mb.max,
            resources.cpu_percent.min,
            resources.cpu_percent.avg,
            resources.cpu_percent.max,
            resources.samples,
        ));
        for warning in &resources.warnings {
            out.push_str(&format!("  warning: {warning}\n"));
        }
    }
    if let Some(capacity) = &report.capacity {
        out.push_str(&format!(
            "  capacity: {} workers ({:.1} rps, p99 {:.1}ms, {} iterations)\n",
            capacity.max_workers_passed,
            capacity.achieved_rps,
            capacity.p99_ms,
            capacity.iterations,
        ));
    }

    out
}

/// Cross-server comparison, best average latency first.
pub fn format_comparison(reports: &[ServerReport]) -> String {
    let mut sorted: Vec<&ServerReport> = reports.iter().filter(|r| r.error.is_empty()).collect();
    sorted.sort_by(|a, b| {
        a.overall
            .avg_ms
            .partial_cmp(&b.overall.avg_ms)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut out = String::new();
    out.push_str("\n┌────────────────────────┬──────────┬──────────┬──────────┬──────────┐\n");
    out.push_str("│ Server                 │  Avg(ms) │  p99(ms) │ Success% │ Requests │\n");
    out.push_str("├────────────────────────┼──────────┼──────────┼──────────┼──────────┤\n");

    for report in &sorted {
        out.push_str(&format!(
            "│ {:22} │ {:>8.2} │ {:>8.2} │ {:>7.1}% │ {:>8} │\n",
            truncate(&report.server, 22),
            report.overall.avg_ms,
            report.overall.p99_ms,
            report.overall.success_rate * 100.0,
            report.overall.total_count,
        ));
    }
    for report in reports.iter().filter(|r| !r.error.is_empty()) {
        out.push_str(&format!(
            "│ {:22} │ {:>8} │ {:>8} │ {:>8} │ {:>8} │\n",
            truncate(&report.server, 22),
            "ERROR",
            "-",
            "-",
            "-",
        ));
    }

    out.push_str("└────────────────────────┴──────────┴──────────┴──────────┴──────────┘\n");
    out
}

/// Export the comparison as CSV.
pub fn write_comparison_csv(reports: &[ServerReport], path: impl AsRef<Path>) -> Result<()> {
    let mut writer = csv::Writer::from_path(path.as_ref())
        .with_context(|| format!("Failed to create {}", path.as_ref().display()))?;

    writer.write_record([
        "server",
        "image",
        "avg_ms",
        "p50_ms",
        "p95_ms",
        "p99_ms",
        "success_rate",
        "requests",
        "error",
    ])?;

    for report in reports {
        let row = vec![
            report.server.clone(),
            report.image.clone(),
            format!("{:.3}", report.overall.avg_ms),
            format!("{:.3}", report.overall.p50_ms),
            format!("{:.3}", report.overall.p95_ms),
            format!("{:.3}", report.overall.p99_ms),
            format!("{:.4}", report.overall.success_rate),
            report.overall.total_count.to_string(),
            report.error.clone(),
        ];
        writer.write_record(&row)?;
    }

    writer.flush().context("Failed to flush CSV")?;
    Ok(())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
