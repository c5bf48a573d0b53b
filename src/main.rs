// natra - Main Entry Point
//
// Command-line front end to the shaping core:
// - parse: resolve a pod bandwidth declaration into a policy
// - replay: run a recorded traffic trace through a shaping handle

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use natra::config::Settings;
use natra::logging::LogLevel;
use natra::metrics;
use natra::policy::{humanize_bandwidth, parse_policy};
use natra::replay::{read_trace, replay};
use natra::shaping::{CoreHandle, Timestamp};
use serde_json::json;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// natra: per-pod bandwidth enforcement
#[derive(Parser, Debug)]
#[command(name = "natra")]
#[command(author = "natra contributors")]
#[command(version = "0.1.0")]
#[command(about = "Heavy-hitter aware bandwidth shaping for pods", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve a bandwidth declaration and print it as JSON
    Parse {
        /// Bandwidth declaration, e.g. "10M" or a JSON document
        policy: String,
    },
    /// Replay a JSON-lines traffic trace through a shaping handle
    Replay {
        /// Bandwidth declaration for the replayed pod
        #[arg(long)]
        policy: String,

        /// Trace file, one {"flow","bytes","at_ms"} object per line
        #[arg(long)]
        trace: PathBuf,

        /// Print Prometheus metrics after the summary
        #[arg(long)]
        metrics: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => Settings::load_from_path(path)?,
        None => Settings::load()?,
    };
    if args.verbose {
        settings.logging.level = settings.logging.level.min(LogLevel::Debug);
    }
    settings.logging.init()?;

    if settings.metrics.enabled {
        metrics::init()?;
    }

    match args.command {
        Commands::Parse { policy } => parse_command(&policy),
        Commands::Replay {
            policy,
            trace,
            metrics,
        } => replay_command(&settings, &policy, &trace, metrics),
    }
}

fn parse_command(input: &str) -> Result<()> {
    let policy = parse_policy(input).context("Failed to parse bandwidth policy")?;
    policy.validate().context("Bandwidth policy is out of range")?;

    let output = json!({
        "unlimited": policy.is_unlimited(),
        "rate_human": humanize_bandwidth(policy.rate),
        "policy": policy,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn replay_command(settings: &Settings, input: &str, trace: &Path, show_metrics: bool) -> Result<()> {
    let policy = parse_policy(input).context("Failed to parse bandwidth policy")?;
    let handle = CoreHandle::init_at(policy, settings.engine.clone(), Timestamp::ZERO)
        .context("Bandwidth policy is out of range")?;

    let file = File::open(trace).with_context(|| format!("Failed to open trace {:?}", trace))?;
    let events = read_trace(BufReader::new(file))?;
    info!(events = events.len(), "replaying trace");

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut write_error = None;
    let summary = replay(&handle, &events, |record| {
        if write_error.is_some() {
            return;
        }
        let line = serde_json::to_string(record).map_err(anyhow::Error::from);
        if let Err(e) = line.and_then(|line| writeln!(out, "{line}").map_err(anyhow::Error::from)) {
            write_error = Some(e);
        }
    })?;
    if let Some(e) = write_error {
        return Err(e.context("Failed to write replay output"));
    }

    writeln!(out, "{}", serde_json::to_string(&json!({ "summary": summary }))?)?;
    handle.teardown();

    if show_metrics {
        write!(out, "{}", metrics::gather_metrics()?)?;
    }
    Ok(())
}
