//! Operator command line for the beamline.
//!
//! Every subcommand loads the layered iconfig (defaults, `iconfig.toml`,
//! `BEAMLINE_*` environment) before doing anything else. Devices talk to the
//! in-process simulated IOC.
//!
//! # Usage
//!
//! ```bash
//! beamline --config config/iconfig.toml setup
//! beamline devices --json
//! beamline count --num 5 --det scaler1
//! beamline scan m1 -1 1 11 --rel --det noisy
//! beamline catalog --create
//! beamline catalog --last
//! beamline config --check
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use beamline_core::settings::Settings;
use beamline_experiment::plans::{Count, LineScan, PrintPlan};
use beamline_experiment::setup::setup_devices;
use beamline_experiment::{Instrument, Plan, RunResult};
use beamline_hardware::{DevicesFile, FactoryTable, SoftIoc};
use beamline_storage::{Catalog, Metadata};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "beamline")]
#[command(about = "Beamline instrument control", long_about = None)]
struct Cli {
    /// Instrument configuration file
    #[arg(long, env = "BEAMLINE_ICONFIG", default_value = "iconfig.toml", global = true)]
    config: PathBuf,

    /// Devices file, overriding `devices_file` from the configuration
    #[arg(long, global = true)]
    devices: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the local controls (runs `setup_devices`)
    Setup,

    /// List the devices built from the devices file
    Devices {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the runs in the configured catalog
    Catalog {
        /// Show only the most recent run, with its primary stream
        #[arg(long)]
        last: bool,
        /// Create the configured catalog if it does not exist yet
        #[arg(long)]
        create: bool,
    },

    /// Print the effective configuration
    Config {
        /// Also validate the devices file against the known device types
        #[arg(long)]
        check: bool,
    },

    /// Read detectors a number of times
    Count {
        #[arg(long, default_value = "1")]
        num: usize,
        /// Detector names or labels
        #[arg(long = "det")]
        detectors: Vec<String>,
        /// Seconds between readings
        #[arg(long, default_value = "0")]
        delay: f64,
    },

    /// Step one positioner and read detectors at every point
    Scan {
        motor: String,
        start: f64,
        stop: f64,
        num: usize,
        /// Positions are relative to the current position
        #[arg(long)]
        rel: bool,
        #[arg(long = "det")]
        detectors: Vec<String>,
    },

    /// Record a message as a run
    Print { message: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(Some(cli.config.as_path()))
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(devices) = &cli.devices {
        settings.devices_file = Some(devices.clone());
    }

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.to_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Setup => run_plan(settings, Box::new(setup_devices())).await,
        Commands::Devices { json } => list_devices(settings, json),
        Commands::Catalog { last, create } => list_runs(&settings, last, create),
        Commands::Config { check } => show_config(&settings, check),
        Commands::Count {
            num,
            detectors,
            delay,
        } => {
            let plan = Count::new(num)
                .with_detectors(&as_strs(&detectors))
                .with_delay(delay);
            run_plan(settings, Box::new(plan)).await
        }
        Commands::Scan {
            motor,
            start,
            stop,
            num,
            rel,
            detectors,
        } => {
            let mut plan = LineScan::new(&motor, start, stop, num).with_detectors(&as_strs(&detectors));
            if rel {
                plan = plan.relative();
            }
            run_plan(settings, Box::new(plan)).await
        }
        Commands::Print { message } => run_plan(settings, Box::new(PrintPlan::new(message))).await,
    }
}

fn as_strs(values: &[String]) -> Vec<&str> {
    values.iter().map(String::as_str).collect()
}

fn start_instrument(settings: Settings) -> Result<Instrument> {
    Instrument::load(settings, Arc::new(SoftIoc::new()), Metadata::new())
}

async fn run_plan(settings: Settings, plan: Box<dyn Plan>) -> Result<()> {
    let instrument = start_instrument(settings)?;
    let engine = instrument.engine.clone();

    let abort_on_interrupt = engine.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, aborting the run");
            if let Err(e) = abort_on_interrupt.abort("interrupted by operator").await {
                warn!("Abort failed: {e:#}");
            }
        }
    });

    let result = engine.run(plan).await;
    interrupt.abort();
    let result = result?;
    report(&instrument, &result);
    if result.is_success() {
        Ok(())
    } else {
        anyhow::bail!("run {} ended with '{}': {}", result.run_uid, result.exit_status, result.reason)
    }
}

fn report(instrument: &Instrument, result: &RunResult) {
    println!("Run {} (scan_id {}): {}", result.run_uid, result.scan_id, result.exit_status);
    for (stream, count) in &result.num_events {
        println!("  {stream:<16} {count} event(s)");
    }
    if let Some(summary) = instrument.summaries.last() {
        for (field, value) in &summary.last_values {
            println!("  {field:<24} {value}");
        }
    }
    info!(catalog = %instrument.catalog.name(), runs = instrument.catalog.len(), "Run stored");
}

fn list_devices(settings: Settings, json: bool) -> Result<()> {
    let instrument = start_instrument(settings)?;
    let devices = instrument.registry.list_devices();
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }
    println!("{} device(s)", devices.len());
    for device in devices {
        println!(
            "  {:<20} {:>3} signal(s)  [{}]",
            device.name,
            device.num_signals,
            device.labels.join(", ")
        );
    }
    Ok(())
}

fn list_runs(settings: &Settings, last: bool, create: bool) -> Result<()> {
    if create {
        let Some(name) = settings.catalog_name() else {
            anyhow::bail!("catalog.name is not set (or is the temp catalog)");
        };
        Catalog::create(&settings.catalog.root, name)
            .with_context(|| format!("creating catalog '{name}'"))?;
    }
    let catalog = Catalog::resolve(&settings.catalog);
    if catalog.is_temp() {
        println!("Catalog '{}' is session-scoped and holds no runs", catalog.name());
        return Ok(());
    }
    if last {
        let Some(run) = catalog.last() else {
            println!("Catalog '{}' is empty", catalog.name());
            return Ok(());
        };
        println!(
            "{} scan_id={} {} ({})",
            run.uid(),
            run.scan_id(),
            run.start.plan_name,
            run.stop.exit_status
        );
        for event in run.stream("primary") {
            println!("  #{:<4} {}", event.seq_num, serde_json::to_string(&event.data)?);
        }
        return Ok(());
    }
    println!("Catalog '{}': {} run(s)", catalog.name(), catalog.len());
    for run in catalog.runs() {
        println!(
            "  {:>5}  {}  {:<24} {:<8} {} event(s)",
            run.scan_id(),
            run.uid(),
            run.start.plan_name,
            run.stop.exit_status,
            run.events.len()
        );
    }
    Ok(())
}

fn show_config(settings: &Settings, check: bool) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(settings)?);
    if !check {
        return Ok(());
    }
    let Some(path) = &settings.devices_file else {
        println!("No devices file configured");
        return Ok(());
    };
    let devices = DevicesFile::load(path)?;
    devices.validate(&FactoryTable::with_builtin())?;
    println!("{}: {} device entries OK", path.display(), devices.devices.len());
    Ok(())
}
