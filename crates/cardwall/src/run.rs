use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ctxpool::SoftwareBackend;
use poolconfig::CardPoolConfig;
use tracing_subscriber::EnvFilter;

use crate::cli::{BackendArg, Cli, Command, ConfigCommand, RunArgs};
use crate::paths::AppPaths;
use crate::sim::{self, SimulationOptions, SimulationReport};

const DEFAULT_CONFIG: &str = r#"version = 1

[pool]
size = 8
width = 320
height = 448
# borrow_timeout = "2s"

[lifecycle]
deactivate_debounce = "150ms"
intersection_threshold = 0.1

[static_render]
mode = "sequential"
batch_size = 4
"#;

pub fn run(cli: Cli) -> Result<()> {
    initialise_tracing();
    let paths = AppPaths::discover()?;

    match cli.command {
        Some(Command::Config { action }) => run_config(action, &cli.run, &paths),
        None => run_simulation(&cli.run, &paths),
    }
}

fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_config(action: ConfigCommand, args: &RunArgs, paths: &AppPaths) -> Result<()> {
    match action {
        ConfigCommand::Where => {
            println!("config dir:  {}", paths.config_dir().display());
            println!("config file: {}", paths.config_file().display());
            println!("data dir:    {}", paths.data_dir().display());
        }
        ConfigCommand::Check { path } => {
            let path = path
                .or_else(|| args.config.clone())
                .unwrap_or_else(|| paths.config_file());
            let config = read_config(&path)?;
            println!("# {} is valid", path.display());
            println!(
                "# static render batch limit: {}",
                config.static_batch_limit()
            );
            print!("{}", effective_toml(&config)?);
        }
        ConfigCommand::Init { force } => {
            let path = paths.config_file();
            if path.exists() && !force {
                bail!(
                    "{} already exists; pass --force to overwrite",
                    path.display()
                );
            }
            paths.ensure_config_dir()?;
            fs::write(&path, DEFAULT_CONFIG)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("wrote {}", path.display());
        }
    }
    Ok(())
}

fn run_simulation(args: &RunArgs, paths: &AppPaths) -> Result<()> {
    let config = resolve_config(args, paths)?;
    let options = SimulationOptions {
        cards: args.cards,
        ticks: args.ticks,
        tick: args.tick,
        seed: args.seed,
        snapshots: args.snapshots.clone(),
    };

    let report = match args.backend {
        BackendArg::Software => sim::simulate(SoftwareBackend::new(), &config, &options)?,
        BackendArg::Wgpu => simulate_gpu(&config, &options)?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

#[cfg(feature = "wgpu")]
fn simulate_gpu(config: &CardPoolConfig, options: &SimulationOptions) -> Result<SimulationReport> {
    let backend = ctxpool::GpuBackend::new(ctxpool::wgpu::PowerPreference::HighPerformance);
    sim::simulate(backend, config, options)
}

#[cfg(not(feature = "wgpu"))]
fn simulate_gpu(_: &CardPoolConfig, _: &SimulationOptions) -> Result<SimulationReport> {
    bail!("cardwall was built without the `wgpu` feature")
}

/// Loads the explicit `--config` file, else `cardwall.toml` from the config
/// directory when present, else defaults; then applies CLI overrides.
fn resolve_config(args: &RunArgs, paths: &AppPaths) -> Result<CardPoolConfig> {
    let mut config = match config_source(args, paths) {
        Some(path) => read_config(&path)?,
        None => CardPoolConfig::default(),
    };

    if let Some(size) = args.pool_size {
        config.pool.size = size;
    }
    if let Some(mode) = args.mode {
        config.static_render.mode = mode.into();
    }
    if let Some(batch) = args.batch_size {
        config.static_render.batch_size = batch;
    }
    if let Some(timeout) = args.borrow_timeout {
        config.pool.borrow_timeout = Some(timeout);
    }

    config.validate().context("invalid configuration after overrides")?;
    tracing::debug!(?config, "resolved configuration");
    Ok(config)
}

fn config_source(args: &RunArgs, paths: &AppPaths) -> Option<PathBuf> {
    if let Some(path) = &args.config {
        return Some(path.clone());
    }
    let default = paths.config_file();
    default.is_file().then_some(default)
}

fn read_config(path: &Path) -> Result<CardPoolConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config = CardPoolConfig::from_toml_str(&raw)
        .with_context(|| format!("failed to load config {}", path.display()))?;
    tracing::info!(path = %path.display(), "loaded pool configuration");
    Ok(config)
}

fn effective_toml(config: &CardPoolConfig) -> Result<String> {
    toml::to_string_pretty(config).context("failed to serialise configuration")
}

fn print_report(report: &SimulationReport) {
    println!(
        "{} cards, {} ticks, seed {} ({} backend)",
        report.cards, report.ticks, report.seed, report.backend
    );
    println!(
        "pool: {} slots, batch limit {}, peak in use {}, peak queue {}",
        report.pool_size, report.batch_limit, report.peak_in_use, report.peak_queue_length
    );
    println!(
        "frames: {}  deactivations: {}  timeouts: {}  recovered: {}  failures: {}",
        report.frames_drawn,
        report.deactivations,
        report.timed_out,
        report.recovered,
        report.failures
    );
    println!(
        "stills: {}  replaced cards: {}  snapshots written: {}",
        report.stills, report.torn_down, report.snapshots_written
    );
    for (state, count) in &report.states {
        println!("  {state:<22} {count}");
    }
}
