//! # drivetime-matrix CLI
//!
//! Command-line interface for the drivetime-matrix library.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use drivetime_matrix::{plan, Config, EntitySource, RouteMode, SyncOptions, SyncState};
use log::{error, info, warn};

mod cli;

/// Command-line interface for drivetime-matrix
#[derive(Parser)]
#[command(name = "drivetime-matrix")]
#[command(version)]
#[command(about = "Incremental driving-time/distance matrix between clubs")]
#[command(long_about = "Keeps a driving-time/distance matrix in step with a club address list:
  drivetime-matrix update --entities clubs.csv     # Re-geocode and re-route only what changed
  drivetime-matrix rebuild --entities clubs.csv    # Recompute the whole matrix in table batches
  drivetime-matrix update --entities clubs.csv --dry-run
  drivetime-matrix status                          # Coverage of the persisted matrix

State files (entity list, matrix, geocode cache) are read from and written to
the paths in the config file, relative to --data-dir when given.")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory the state file paths are resolved against
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Incremental run: pairwise routes for added and modified clubs
    Update(RunArgs),
    /// Full run: rebuild the matrix with bulk table requests
    Rebuild(RunArgs),
    /// Show coverage of the persisted matrix
    Status,
}

#[derive(Args)]
struct RunArgs {
    /// New entity list (.json or .csv)
    #[arg(long)]
    entities: PathBuf,

    /// Show what would be done without calling any service or writing files
    #[arg(long)]
    dry_run: bool,

    /// Also recompute pairs that are missing from the matrix
    #[arg(long)]
    repair_missing: bool,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("❌ Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging to stderr; RUST_LOG takes precedence
    env_logger::Builder::new()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .init();

    let config = load_config(cli.config.as_deref(), cli.data_dir.as_deref())?;

    match cli.command {
        Command::Update(args) => run_sync(config, args, RouteMode::Pairwise).await,
        Command::Rebuild(args) => run_sync(config, args, RouteMode::Table).await,
        Command::Status => show_status(&config),
    }
}

fn load_config(path: Option<&Path>, data_dir: Option<&Path>) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(dir) = data_dir {
        config.paths = config.paths.relative_to(dir);
    }
    Ok(config)
}

async fn run_sync(mut config: Config, args: RunArgs, mode: RouteMode) -> anyhow::Result<()> {
    config.repair_missing |= args.repair_missing;

    if args.dry_run {
        return dry_run(&config, &args.entities, mode);
    }

    eprintln!("🚗 drivetime-matrix v{} starting...", env!("CARGO_PKG_VERSION"));
    let progress = cli::ProgressManager::new(match mode {
        RouteMode::Pairwise => "🌐 Routing changed pairs",
        RouteMode::Table => "🌐 Rebuilding matrix in table batches",
    });

    let result = drivetime_matrix::synchronize(
        &config,
        &args.entities,
        mode,
        Some(progress.callback()),
    )
    .await;
    progress.finish();

    let report = result.context("synchronisation failed, no files were written")?;
    if report.has_failures() {
        warn!("⚠️  Run completed with partial data");
    }
    Ok(())
}

fn dry_run(config: &Config, entities: &Path, mode: RouteMode) -> anyhow::Result<()> {
    let new_entities = EntitySource::new(entities)
        .load()
        .with_context(|| format!("reading {}", entities.display()))?;
    let state = SyncState::load(&config.paths).context("loading previous state")?;
    let options = SyncOptions {
        batch_size: config.router.batch_size,
        repair_missing: config.repair_missing,
        ..Default::default()
    };
    let plan = plan(&state, &new_entities, &config.overrides(), mode, &options);

    eprintln!(
        "🔍 [DRY RUN] {} added, {} modified, {} removed, {} unchanged",
        plan.diff.added.len(),
        plan.diff.modified.len(),
        plan.diff.removed.len(),
        plan.diff.unchanged.len()
    );
    for entity in plan.diff.added.iter().chain(plan.diff.modified.iter()) {
        eprintln!("   ~ {}", entity.name);
    }
    for name in &plan.diff.removed {
        eprintln!("   - {name}");
    }
    eprintln!("🔍 [DRY RUN] Would geocode {} clubs", plan.to_geocode.len());
    match plan.mode {
        RouteMode::Pairwise => eprintln!("🔍 [DRY RUN] Would compute up to {} routes", plan.route_calls),
        RouteMode::Table => eprintln!("🔍 [DRY RUN] Would send {} table batches", plan.route_calls),
    }
    Ok(())
}

fn show_status(config: &Config) -> anyhow::Result<()> {
    let state = SyncState::load(&config.paths).context("loading persisted state")?;
    let overrides = config.overrides();
    let coverage = state.matrix.coverage(state.located(&overrides));

    info!(
        "📋 {} clubs in {}",
        state.entities.len(),
        config.paths.entities.display()
    );
    let unlocated: Vec<&str> = state
        .entities
        .iter()
        .map(|e| e.name.as_str())
        .filter(|name| overrides.get(name).is_none() && state.cache.get(name).is_none())
        .collect();
    if !unlocated.is_empty() {
        warn!("⚠️  {} clubs without coordinates: {}", unlocated.len(), unlocated.join(", "));
    }

    println!("clubs:            {}", state.entities.len());
    println!("with coordinates: {}", coverage.live_geocoded);
    println!("expected entries: {}", coverage.expected);
    println!("present entries:  {}", coverage.present);
    println!("missing:          {} ({:.1}%)", coverage.missing, coverage.missing_percent());

    if coverage.is_degraded() {
        warn!("⚠️  More than 5% of the matrix is missing; run update with --repair-missing");
    }
    Ok(())
}
