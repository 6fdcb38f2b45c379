//! bench-history CLI - inspect and publish benchmark history

use anyhow::{Context, Result};
use bench_history::{
    export, source, store, Aggregate, Error, FetchConfig, Schema, Session,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

/// bench-history: benchmark history across commits and machines
#[derive(Parser, Debug)]
#[command(name = "bench-history")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print chart-ready series for a selection
    Series(SeriesArgs),
    /// Show machines, benchmarked commits and system info
    Info(InfoArgs),
    /// Write git-graph.json from a local repository
    Graph(GraphArgs),
    /// Rebuild manifest.json from a results directory
    Index(IndexArgs),
    /// Regenerate every run.json from the result files, then manifest.json
    Sync(IndexArgs),
    /// Write all-data.json from any source
    Export(ExportArgs),
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// Directory or http(s) URL serving the artifacts
    #[arg(short, long, env = "BENCH_HISTORY_SOURCE")]
    source: String,

    /// Artifact layout: split or combined
    #[arg(long, default_value = "split")]
    schema: Schema,

    /// Maximum retrievals in flight
    #[arg(long, default_value = "32")]
    max_in_flight: usize,

    /// Deadline per retrieval, e.g. "500ms", "30s", "1m"
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    task_timeout: Duration,
}

impl SourceArgs {
    async fn open(&self) -> Result<Session> {
        let config = FetchConfig::new(self.max_in_flight, self.task_timeout)?;
        let store = store::open_store(&self.source)?;
        let source = source::open_source(store, self.schema);

        match Session::open(source, config).await {
            Ok(session) => Ok(session),
            Err(e @ Error::LoadError(_)) => {
                error!("failed to load data");
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Json,
    Text,
}

#[derive(Args, Debug)]
struct SeriesArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Restrict to ancestors and descendants of this commit
    #[arg(long)]
    pivot: Option<String>,

    /// Machines to include (default: all)
    #[arg(short, long = "machine")]
    machines: Vec<String>,

    #[arg(long, value_enum, default_value = "text")]
    format: Format,
}

#[derive(Args, Debug)]
struct InfoArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Fetch and show system info for this machine
    #[arg(short, long)]
    machine: Option<String>,
}

#[derive(Args, Debug)]
struct GraphArgs {
    /// Repository to read
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    #[arg(short, long, default_value = "git-graph.json")]
    out: PathBuf,
}

#[derive(Args, Debug)]
struct IndexArgs {
    /// Results directory holding <commit>/<machine>/ run directories
    #[arg(long, default_value = "db")]
    db: PathBuf,
}

#[derive(Args, Debug)]
struct ExportArgs {
    #[command(flatten)]
    source: SourceArgs,

    #[arg(short, long, default_value = "all-data.json")]
    out: PathBuf,
}

/// Parse duration string (e.g., "50ms", "1s", "1m")
fn parse_duration(duration_str: &str) -> std::result::Result<Duration, String> {
    let invalid = || format!("Invalid duration '{}'", duration_str);

    if let Some(millis) = duration_str.strip_suffix("ms") {
        millis.parse().map(Duration::from_millis).map_err(|_| invalid())
    } else if let Some(secs) = duration_str.strip_suffix('s') {
        secs.parse().map(Duration::from_secs).map_err(|_| invalid())
    } else if let Some(mins) = duration_str.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
            .ok_or_else(invalid)
    } else {
        Err(invalid())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Series(args) => series_command(args).await,
        Commands::Info(args) => info_command(args).await,
        Commands::Graph(args) => graph_command(args),
        Commands::Index(args) => index_command(args),
        Commands::Sync(args) => sync_command(args),
        Commands::Export(args) => export_command(args).await,
    }
}

async fn series_command(args: SeriesArgs) -> Result<()> {
    let session = args.source.open().await?;

    let machines = if args.machines.is_empty() {
        session.machines()
    } else {
        args.machines.clone()
    };

    let view = session
        .aggregate(args.pivot.as_deref(), &machines)
        .await
        .context("Failed to aggregate benchmark series")?;

    info!(
        "{} benchmarks over {} commits ({} retrievals, {} failed)",
        view.series.len(),
        view.commits.len(),
        view.stats.requests(),
        view.stats.failures
    );

    match args.format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&view)?),
        Format::Text => print_series(&view, &machines),
    }

    Ok(())
}

fn print_series(view: &Aggregate, machines: &[String]) {
    if view.is_empty() {
        println!("No benchmark data for this selection.");
        return;
    }

    for group in &view.groups {
        println!("## {}\n", group.name);

        for id in &group.benchmarks {
            let Some(series) = view.series.get(id) else {
                continue;
            };
            println!("### {} ({})", id, series.unit);

            for point in &series.points {
                let cells: Vec<String> = machines
                    .iter()
                    .map(|m| match point.values.get(m) {
                        Some(v) => format!("{}={:.2}", m, v),
                        None => format!("{}=-", m),
                    })
                    .collect();
                println!(
                    "  {} {}  {}",
                    point.short_hash,
                    point.date.format("%Y-%m-%d"),
                    cells.join("  ")
                );
            }
            println!();
        }
    }
}

async fn info_command(args: InfoArgs) -> Result<()> {
    let session = args.source.open().await?;

    println!("Machines:");
    for machine in session.machines() {
        println!("  - {}", machine);
    }

    let with_data = session.commits_with_data();
    println!(
        "\nCommits: {} in graph, {} with benchmark data",
        session.commits().len(),
        with_data.len()
    );

    if let Some(machine) = args.machine {
        // System info comes from cached manifests, so fetch this machine's runs
        session
            .aggregate(None, std::slice::from_ref(&machine))
            .await
            .context("Failed to fetch run manifests")?;

        match session.system_info(&machine) {
            Some(system) => {
                println!("\n{}:", machine);
                println!("  OS:     {} ({})", system.os_version, system.arch);
                if let Some(kernel) = &system.kernel_version {
                    println!("  Kernel: {}", kernel);
                }
                if let Some(cpu) = system.cpus.first() {
                    println!("  CPU:    {} ({} cores)", cpu.brand, system.cpus.len());
                }
                println!(
                    "  Memory: {:.1} GB",
                    system.memory as f64 / 1024.0 / 1024.0 / 1024.0
                );
                if let Some(gpu) = &system.wgpu_adapter_info {
                    println!("  GPU:    {} ({} - {})", gpu.name, gpu.backend, gpu.driver);
                }
            }
            None => println!("\nNo runs recorded for '{}'", machine),
        }
    }

    Ok(())
}

fn graph_command(args: GraphArgs) -> Result<()> {
    let records = export::export_graph(&args.repo)
        .with_context(|| format!("Failed to read repository at {:?}", args.repo))?;

    export::save_json(&args.out, &records).with_context(|| "Failed to save commit graph")?;
    info!("Saved {} commits to {:?}", records.len(), args.out);

    Ok(())
}

fn index_command(args: IndexArgs) -> Result<()> {
    let index = export::rebuild_index(&args.db)
        .with_context(|| format!("Failed to index {:?}", args.db))?;
    info!("Indexed {} benchmarked commits", index.benches.len());
    Ok(())
}

fn sync_command(args: IndexArgs) -> Result<()> {
    let synced = export::sync_runs(&args.db)
        .with_context(|| format!("Failed to sync runs in {:?}", args.db))?;
    info!("Synced {} runs", synced);
    index_command(args)
}

async fn export_command(args: ExportArgs) -> Result<()> {
    let config = FetchConfig::new(args.source.max_in_flight, args.source.task_timeout)?;
    let store = store::open_store(&args.source.source)?;
    let source = source::open_source(store, args.source.schema);

    let doc = export::export_combined(source, config)
        .await
        .context("failed to load data")?;

    export::save_json(&args.out, &doc).with_context(|| "Failed to save combined document")?;
    info!("Saved {:?}", args.out);

    Ok(())
}
