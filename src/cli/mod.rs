//! CLI argument parsing
//!
//! Defines the flag surface using clap and resolves flags against the
//! config's phase defaults. With no phase flags given, the interactive
//! prompt takes over.

mod prompt;

pub use prompt::{print_run_plan, prompt_options};

use clap::Parser;

use crate::config::RunDefaults;

/// Comparative HTTP Server Benchmarking Harness
#[derive(Parser, Debug)]
#[command(name = "server-bench")]
#[command(version = "0.1.0")]
#[command(about = "Benchmark and compare HTTP server images")]
#[command(long_about = None)]
pub struct Args {
    /// Configuration file (defaults to standard search locations)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Directory for result JSON files
    #[arg(long, default_value = "results")]
    pub results_dir: String,

    /// Run all phases without prompting
    #[arg(long)]
    pub all: bool,

    /// Quick run: resources only, no warmup, no capacity
    #[arg(long, conflicts_with = "all")]
    pub quick: bool,

    /// Enable the warmup phase
    #[arg(long, conflicts_with = "no_warmup")]
    pub warmup: bool,

    /// Disable the warmup phase
    #[arg(long)]
    pub no_warmup: bool,

    /// Enable resource sampling
    #[arg(long, conflicts_with = "no_resources")]
    pub resources: bool,

    /// Disable resource sampling
    #[arg(long)]
    pub no_resources: bool,

    /// Enable the capacity search
    #[arg(long, conflicts_with = "no_capacity")]
    pub capacity: bool,

    /// Disable the capacity search
    #[arg(long)]
    pub no_capacity: bool,

    /// Benchmark only these servers (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub servers: Option<Vec<String>>,

    /// Also export the comparison table as CSV
    #[arg(long)]
    pub csv: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// Phase and server selection for one run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunOptions {
    pub warmup: bool,
    pub resources: bool,
    pub capacity: bool,
    /// Subset of servers to benchmark; `None` means all.
    pub servers: Option<Vec<String>>,
}

impl Args {
    /// Whether any phase/server selection was given on the command
    /// line. Without one, the interactive prompt decides.
    pub fn has_phase_flags(&self) -> bool {
        self.all
            || self.quick
            || self.warmup
            || self.no_warmup
            || self.resources
            || self.no_resources
            || self.capacity
            || self.no_capacity
            || self.servers.is_some()
    }

    /// Resolve flags against the config defaults. `--all`/`--quick`
    /// set a baseline; individual flags override it.
    pub fn resolve_phases(&self, defaults: RunDefaults) -> RunOptions {
        let mut options = RunOptions {
            warmup: defaults.warmup,
            resources: defaults.resources,
            capacity: defaults.capacity,
            servers: self.servers.clone(),
        };

        if self.all {
            options.warmup = true;
            options.resources = true;
            options.capacity = true;
        }
        if self.quick {
            options.warmup = false;
            options.resources = true;
            options.capacity = false;
        }

        if self.warmup {
            options.warmup = true;
        }
        if self.no_warmup {
            options.warmup = false;
        }
        if self.resources {
            options.resources = true;
        }
        if self.no_resources {
            options.resources = false;
        }
        if self.capacity {
            options.capacity = true;
        }
        if self.no_capacity {
            options.capacity = false;
        }

        options
    }
}
