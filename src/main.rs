//! server-bench - Comparative HTTP Server Benchmarking Harness
//!
//! Benchmarks a set of HTTP server container images against a shared
//! catalog of endpoints and multi-step sequences, producing per-server
//! latency statistics, resource usage, and an optional capacity
//! figure. Results are written as JSON files and, optionally, to an
//! InfluxDB-style time-series sink.
//!
//! ## Usage
//!
//! ```bash
//! # Interactive phase selection
//! server-bench --config bench.json
//!
//! # Everything, no questions
//! server-bench --config bench.json --all
//!
//! # Resources only, a subset of servers
//! server-bench --config bench.json --quick --servers=axum,actix
//! ```

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod capacity;
mod cli;
mod config;
mod container;
mod engine;
mod http;
mod models;
mod output;
mod results;
mod sequence;
mod sink;
mod suite;
#[cfg(test)]
mod testutil;

use cli::Args;
use suite::BenchSuite;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    FmtSubscriber::builder()
        .with_max_level(if args.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .compact()
        .init();

    let config_path = match &args.config {
        Some(path) => PathBuf::from(path),
        None => config::find_config().ok_or_else(|| {
            anyhow!("no configuration file found; pass --config or create ./bench.json")
        })?,
    };
    info!(path = %config_path.display(), "loading configuration");

    let raw = config::load_config(&config_path)?;
    let resolved = config::resolve(&raw)?;

    let options = if args.has_phase_flags() {
        args.resolve_phases(resolved.defaults)
    } else {
        let names: Vec<String> = resolved.servers.iter().map(|s| s.name.clone()).collect();
        cli::prompt_options(resolved.defaults, &names)?
    };

    cli::print_run_plan(&resolved, &options);

    // One parent context threads through the whole run; Ctrl-C cancels
    // it and the suite writes partial results on the way out.
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, writing partial results");
            signal_token.cancel();
        }
    });

    let csv_path = args.csv.clone();
    let suite = BenchSuite::new(resolved, options, &args.results_dir, cancel)?;
    let summary = suite.run().await?;

    println!("{}", output::format_comparison(&summary.reports));
    if let Some(path) = csv_path {
        output::write_comparison_csv(&summary.reports, &path)?;
        println!("Comparison exported to: {path}");
    }

    if summary.canceled {
        info!("run canceled; partial results are on disk");
        return Ok(());
    }

    let failed = summary
        .reports
        .iter()
        .filter(|report| !report.error.is_empty())
        .count();
    if failed > 0 {
        anyhow::bail!("{failed} server(s) failed; see the results directory for details");
    }

    Ok(())
}
