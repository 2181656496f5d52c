//! Production Line Simulator - Main Entry Point
//!
//! Runs a production line headless for a fixed duration and prints a summary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prodline::pipeline::{LineCounts, StationStats};
use prodline::{LineConfig, ProductionController, ProductionEvent};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "prodline")]
#[command(about = "Simulate a five-stage production line", long_about = None)]
struct Cli {
    /// Path to a line configuration file (TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to daily rolling files in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the line (default if no command specified)
    Run {
        /// Seconds to run before stopping
        #[arg(short, long, default_value_t = 30)]
        duration: u64,

        /// Pause the line this many seconds after start
        #[arg(long)]
        pause_at: Option<u64>,

        /// Seconds to stay paused
        #[arg(long, default_value_t = 5)]
        pause_for: u64,

        /// Print every production event
        #[arg(long)]
        events: bool,

        /// Print the final summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a configuration file
    Validate,

    /// Write the default configuration to a file
    GenerateConfig {
        /// Output path (`.toml` for TOML, anything else for JSON)
        #[arg(short, long, default_value = "prodline.toml")]
        output: PathBuf,
    },
}

#[derive(Serialize)]
struct Summary {
    elapsed_secs: f64,
    counts: LineCounts,
    conserved: bool,
    stations: Vec<StationStats>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.log_dir.as_deref())?;

    match cli.command {
        None => run_command(cli.config.as_deref(), 30, None, 5, false, false),
        Some(Commands::Run {
            duration,
            pause_at,
            pause_for,
            events,
            json,
        }) => run_command(cli.config.as_deref(), duration, pause_at, pause_for, events, json),
        Some(Commands::Validate) => validate_command(cli.config.as_deref()),
        Some(Commands::GenerateConfig { output }) => generate_config_command(&output),
    }
}

fn init_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {:?}", dir))?;
            let appender = tracing_appender::rolling::daily(dir, "prodline.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,prodline=debug")),
        )
        .with(fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

fn load_config(path: Option<&Path>) -> Result<LineConfig> {
    let config = match path {
        Some(path) => LineConfig::load(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => LineConfig::default(),
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn run_command(
    config_path: Option<&Path>,
    duration: u64,
    pause_at: Option<u64>,
    pause_for: u64,
    print_events: bool,
    json: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let controller = ProductionController::new(config)?;
    let events = controller.subscribe();

    tracing::info!("Running production line for {} s", duration);
    let started = Instant::now();
    let run_for = Duration::from_secs(duration);
    let pause_window = pause_at.map(|at| {
        let from = Duration::from_secs(at);
        (from, from + Duration::from_secs(pause_for))
    });

    controller.start();
    while started.elapsed() < run_for {
        if let Some((from, until)) = pause_window {
            let elapsed = started.elapsed();
            if elapsed >= from && elapsed < until && !controller.is_paused() {
                controller.pause();
            } else if elapsed >= until && controller.is_paused() {
                controller.resume();
            }
        }

        if let Some(event) = events.recv_timeout(Duration::from_millis(200)) {
            if print_events && !matches!(event, ProductionEvent::StatisticsUpdated(_)) {
                println!("{}", event);
            }
        }
    }
    controller.stop();

    let counts = controller.counts();
    let summary = Summary {
        elapsed_secs: started.elapsed().as_secs_f64(),
        counts,
        conserved: counts.is_conserved(),
        stations: controller.stations().map(|s| s.stats()).collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &Summary) {
    let counts = &summary.counts;
    println!("Ran for {:.1} s", summary.elapsed_secs);
    println!(
        "created {}  finished {}  rejected {}  wip {}{}",
        counts.created,
        counts.finished,
        counts.rejected,
        counts.wip(),
        if summary.conserved { "" } else { "  (accounting mismatch)" }
    );
    println!(
        "{:<20} {:>9} {:>9} {:>9} {:>7} {:>10} {:>9}",
        "station", "state", "processed", "rejected", "rework", "per min", "queue"
    );
    for stats in &summary.stations {
        println!(
            "{:<20} {:>9} {:>9} {:>9} {:>7} {:>10.1} {:>9}",
            stats.stage.name(),
            stats.state.display_name(),
            stats.processed,
            stats.rejected,
            stats.reworked,
            stats.throughput,
            stats.queue_depth
        );
    }
}

fn validate_command(config_path: Option<&Path>) -> Result<()> {
    let path = config_path.context("validate requires --config <FILE>")?;
    let config = load_config(Some(path))?;
    println!(
        "Configuration OK: channel capacity {}, {} products/min",
        config.channel_capacity, config.intake.production_rate_per_minute
    );
    Ok(())
}

fn generate_config_command(output: &Path) -> Result<()> {
    LineConfig::default()
        .save(output)
        .with_context(|| format!("Failed to write {:?}", output))?;
    println!("Wrote default configuration to {:?}", output);
    Ok(())
}
