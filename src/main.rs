mod analysis;
mod chart;
mod checkpoint;
mod client_stats;
mod compress;
mod config;
mod data_dir;
mod flush_queue;
mod launch;
mod log_events;
mod manifest;
mod monitor;
mod runner;
mod signals;
mod watcher;

use clap::{Parser, Subcommand};
use config::HarnessConfig;
use data_dir::ExperimentDir;
use std::io::Write;
use std::path::{Path, PathBuf};

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Launch YCSB/RocksDB experiments and turn their logs into CSV timeseries
/// and charts.
#[derive(Parser, Debug)]
#[command(name = "ycsb-harness", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, global = true, default_value = "experiment.toml")]
    config: PathBuf,

    /// Experiment directory; relative artifact paths resolve against it
    #[arg(short, long, global = true, default_value = ".")]
    dir: PathBuf,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the benchmark with monitors until it exits or is interrupted
    Run {
        /// Print the resolved benchmark command line and exit
        #[arg(long)]
        dry_run: bool,
    },
    /// Extract compaction, flush and stall events from a RocksDB LOG into output.csv
    Extract {
        /// RocksDB LOG file
        #[arg(long)]
        log: PathBuf,
        /// Client progress CSV appended as client<N> rows (default: client_progress.csv)
        #[arg(long)]
        client_progress: Option<PathBuf>,
        /// Skip the client rows
        #[arg(long)]
        no_clients: bool,
        /// Output CSV (default: output.csv)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Parse per-client status lines from benchmark output into a CSV
    ClientStats {
        /// Benchmark output (default: status_thread.txt)
        #[arg(long)]
        input: Option<PathBuf>,
        /// Output CSV (default: client_stats.csv)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Convert raw iostat/mpstat captures into CSV
    MonitorCsv,
    /// Plot client throughput, compactions and stalls from the events CSV
    Plot {
        /// Events CSV (default: output.csv)
        #[arg(long)]
        events: Option<PathBuf>,
    },
    /// Plot pending flush requests per reason and dump them as metrics
    FlushQueue {
        /// Flush-queue log (default: logs/WAL_logs.csv)
        #[arg(long)]
        log: Option<PathBuf>,
        /// Reference time in seconds for the x axis
        #[arg(long)]
        start_time_s: Option<f64>,
        /// Also append the series to flush_queue_metrics.txt
        #[arg(long)]
        metrics: bool,
    },
    /// Copy run artifacts and the database LOG into results/<NAME>/
    Checkpoint {
        /// Checkpoint name
        name: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "ycsb_harness=debug"
    } else {
        "ycsb_harness=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();
    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match HarnessConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };
    let dir = ExperimentDir::new(&cli.dir);

    let result = match cli.command {
        Command::Run { dry_run } => run(&config, &dir, dry_run).await,
        Command::Extract {
            log,
            client_progress,
            no_clients,
            out,
        } => extract(&dir, &log, client_progress, no_clients, out),
        Command::ClientStats { input, out } => client_stats(&dir, input, out),
        Command::MonitorCsv => monitor_csv(&config, &dir),
        Command::Plot { events } => plot(&config, &dir, events),
        Command::FlushQueue {
            log,
            start_time_s,
            metrics,
        } => flush_queue(&config, &dir, log, start_time_s, metrics),
        Command::Checkpoint { name } => checkpoint(&config, &dir, &name),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(config: &HarnessConfig, dir: &ExperimentDir, dry_run: bool) -> CliResult {
    if dry_run {
        println!("{}", launch::BenchmarkInvocation::from_config(config).command_line());
        return Ok(());
    }

    let shutdown = async {
        match signals::wait_for_shutdown().await {
            Ok(signal) => signal,
            Err(e) => {
                tracing::error!(error = %e, "failed to install signal handlers");
                std::future::pending().await
            }
        }
    };

    match runner::run_experiment(config, dir, shutdown).await? {
        runner::RunOutcome::Completed { exit_code: Some(0) } => Ok(()),
        runner::RunOutcome::Completed { exit_code } => {
            tracing::error!(?exit_code, "benchmark failed");
            std::process::exit(1);
        }
        runner::RunOutcome::Interrupted(signal) => {
            tracing::info!(%signal, "run interrupted, cleanup complete");
            std::process::exit(130);
        }
    }
}

fn create_output(path: &Path) -> std::io::Result<std::io::BufWriter<std::fs::File>> {
    Ok(std::io::BufWriter::new(std::fs::File::create(path)?))
}

fn extract(
    dir: &ExperimentDir,
    log: &Path,
    client_progress: Option<PathBuf>,
    no_clients: bool,
    out: Option<PathBuf>,
) -> CliResult {
    let log = dir.resolve(log);
    let out_path = out.map(|p| dir.resolve(p)).unwrap_or_else(|| dir.events_csv());
    let progress = match (no_clients, client_progress) {
        (true, _) => None,
        (false, Some(p)) => Some(dir.resolve(p)),
        (false, None) => Some(dir.client_progress_csv()),
    };

    // Open the LOG before truncating the output.
    std::fs::File::open(&log).map_err(|e| format!("cannot open {}: {e}", log.display()))?;

    let mut out = create_output(&out_path)?;
    let summary = log_events::extract_to_csv(&log, progress.as_deref(), &mut out)?;
    out.flush()?;
    tracing::info!(
        compactions = summary.compactions,
        flushes = summary.flushes,
        stalls = summary.stalls,
        clients = summary.clients,
        out = %out_path.display(),
        "events extracted"
    );
    Ok(())
}

fn client_stats(dir: &ExperimentDir, input: Option<PathBuf>, out: Option<PathBuf>) -> CliResult {
    let input = input.map(|p| dir.resolve(p)).unwrap_or_else(|| dir.status_log());
    let out_path = out.map(|p| dir.resolve(p)).unwrap_or_else(|| dir.client_stats_csv());

    let file = std::fs::File::open(&input).map_err(|e| format!("cannot open {}: {e}", input.display()))?;
    let stats = client_stats::ClientStats::parse(std::io::BufReader::new(file))?;
    if stats.is_empty() {
        tracing::warn!(input = %input.display(), "no client stats found");
    }
    let mut out = create_output(&out_path)?;
    stats.write_csv(&mut out)?;
    out.flush()?;
    tracing::info!(out = %out_path.display(), "client stats written");
    Ok(())
}

fn monitor_csv(config: &HarnessConfig, dir: &ExperimentDir) -> CliResult {
    for kind in monitor::enabled_monitors(&config.monitor) {
        let (raw, csv) = match kind {
            monitor::MonitorKind::Iostat { .. } => (dir.iostat_raw(), dir.iostat_csv()),
            monitor::MonitorKind::Mpstat => (dir.mpstat_raw(), dir.mpstat_csv()),
        };
        kind.capture_to_csv(&raw, &csv)?;
    }
    Ok(())
}

fn report_render(name: &str, outcome: chart::RenderOutcome) {
    match outcome {
        chart::RenderOutcome::Rendered(path) => println!("{}", path.display()),
        chart::RenderOutcome::ScriptOnly(path) => {
            tracing::info!(chart = name, script = %path.display(), "chart script written")
        }
    }
}

fn plot(config: &HarnessConfig, dir: &ExperimentDir, events: Option<PathBuf>) -> CliResult {
    let events = events.map(|p| dir.resolve(p)).unwrap_or_else(|| dir.events_csv());
    let table = analysis::EventTable::load(&events)
        .map_err(|e| format!("cannot read {}: {e}", events.display()))?;
    let chart = analysis::events_chart(&table, &config.analysis);
    let outcome = chart::render(&chart, &dir.chart_script("events"), &dir.chart_image("events"))?;
    report_render("events", outcome);
    Ok(())
}

fn flush_queue(
    config: &HarnessConfig,
    dir: &ExperimentDir,
    log: Option<PathBuf>,
    start_time_s: Option<f64>,
    metrics: bool,
) -> CliResult {
    let log = log.map(|p| dir.resolve(p)).unwrap_or_else(|| dir.flush_queue_log());
    let snapshots = match flush_queue::load_snapshots(&log) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %log.display(), "flush-queue log not found");
            Vec::new()
        }
        Err(e) => return Err(format!("cannot read {}: {e}", log.display()).into()),
    };
    if snapshots.is_empty() {
        tracing::warn!(path = %log.display(), "no flush_queue data lines");
    }

    let table = flush_queue::FlushQueueTable::build(
        &snapshots,
        start_time_s.or(config.analysis.start_time_s),
    );
    if metrics && !table.is_empty() {
        let path = dir.flush_queue_metrics();
        let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        let mut out = std::io::BufWriter::new(file);
        table.write_metrics(&mut out)?;
        out.flush()?;
        tracing::info!(path = %path.display(), reasons = table.reasons.len(), "flush-queue metrics appended");
    }

    let chart = flush_queue::flush_queue_chart(&table, config.analysis.xlim);
    let outcome = chart::render(
        &chart,
        &dir.chart_script("flush_queue"),
        &dir.chart_image("flush_queue"),
    )?;
    report_render("flush_queue", outcome);
    Ok(())
}

fn checkpoint(config: &HarnessConfig, dir: &ExperimentDir, name: &str) -> CliResult {
    let user = std::env::var("USER").ok();
    let summary = checkpoint::save_checkpoint(dir, &config.checkpoint, name, user.as_deref())?;
    for path in &summary.failed {
        eprintln!("warning: could not copy {}", path.display());
    }
    println!("{}", summary.dest.display());
    Ok(())
}
