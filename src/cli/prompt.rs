//! Interactive phase and server selection
//!
//! When no phase flags are given the harness asks which phases to run
//! and which servers to include, then prints the run plan before
//! proceeding.

use std::io::{BufRead, Write};

use anyhow::Result;

use super::RunOptions;
use crate::config::{ResolvedConfig, RunDefaults};

/// Prompt on stdin for phases and server selection.
pub fn prompt_options(defaults: RunDefaults, server_names: &[String]) -> Result<RunOptions> {
    let stdin = std::io::stdin();
    let mut reader = stdin.lock();
    prompt_options_from(&mut reader, defaults, server_names)
}

fn prompt_options_from(
    reader: &mut impl BufRead,
    defaults: RunDefaults,
    server_names: &[String],
) -> Result<RunOptions> {
    println!("\nConfigure this run (enter for default):");

    let warmup = ask_yes_no(reader, "  Run warmup phase?", defaults.warmup)?;
    let resources = ask_yes_no(reader, "  Sample container resources?", defaults.resources)?;
    let capacity = ask_yes_no(reader, "  Run capacity search?", defaults.capacity)?;

    println!(
        "  Servers [{}] (comma separated, enter for all):",
        server_names.join(", ")
    );
    print!("  > ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let selection = line.trim();
    let servers = if selection.is_empty() {
        None
    } else {
        Some(
            selection
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    };

    Ok(RunOptions {
        warmup,
        resources,
        capacity,
        servers,
    })
}

fn ask_yes_no(reader: &mut impl BufRead, question: &str, default: bool) -> Result<bool> {
    let hint = if default { "Y/n" } else { "y/N" };
    print!("{question} [{hint}] ");
    std::io::stdout().flush()?;

    let mut line = String::new();
    reader.read_line(&mut line)?;
    Ok(match line.trim().to_ascii_lowercase().as_str() {
        "" => default,
        "y" | "yes" => true,
        _ => false,
    })
}

/// Print the resolved run plan before starting.
pub fn print_run_plan(config: &ResolvedConfig, options: &RunOptions) {
    let server_list: Vec<&str> = config
        .servers
        .iter()
        .map(|s| s.name.as_str())
        .filter(|name| match &options.servers {
            Some(selected) => selected.iter().any(|s| s == name),
            None => true,
        })
        .collect();

    println!("\n┌─────────────────────────────────────────────────────────────┐");
    println!("│ Benchmark Plan                                              │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ Servers:   {:48} │", truncate(&server_list.join(", "), 48));
    if let Some(server) = config.servers.first() {
        println!("│ Load:      {:48} │", server.bound.describe());
        println!(
            "│ Workers:   {:<48} │",
            server.workers
        );
        println!(
            "│ Timeout:   {:<48} │",
            format!("{:?}", server.request_timeout)
        );
        println!("│ Endpoints: {:<48} │", server.testcases.len());
        println!("│ Sequences: {:<48} │", server.sequences.len());
    }
    println!(
        "│ Phases:    {:48} │",
        phase_list(options)
    );
    if !config.databases.is_empty() {
        println!("│ Databases: {:48} │", truncate(&config.databases.join(", "), 48));
    }
    println!("└─────────────────────────────────────────────────────────────┘\n");
}

fn phase_list(options: &RunOptions) -> String {
    let mut phases = vec!["benchmark"];
    if options.warmup {
        phases.push("warmup");
    }
    if options.resources {
        phases.push("resources");
    }
    if options.capacity {
        phases.push("capacity");
    }
    phases.join(", ")
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
