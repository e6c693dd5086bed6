//! CLI entry point for mooring-daq
//!
//! ```bash
//! mooring-daq run --config config/mooring.toml
//! mooring-daq check --config config/mooring.toml
//! mooring-daq replay --instrument turbidity logs/turbidity.csv
//! ```

#![allow(missing_docs)]

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use mooring_daq::config::Settings;
use mooring_daq::detector::DetectorParams;
use mooring_daq::node::Node;
use mooring_daq::{logging, monitor};
use std::path::{Path, PathBuf};
use tracing::info;

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "mooring-daq")]
#[command(about = "Instrument sampling and event alerting for a mooring node", long_about = None)]
struct Cli {
    /// Configuration file (environment overrides use MOORING_DAQ_*)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample all enabled instruments until interrupted
    Run,

    /// Validate the configuration and print the resolved instruments
    Check,

    /// Run logged values through an instrument's event detector
    Replay {
        /// Instrument name or id
        #[arg(long)]
        instrument: String,

        /// Sample interval in seconds (defaults to the instrument schedule)
        #[arg(long)]
        interval: Option<u64>,

        /// CSV sample log, or one value per line
        values: PathBuf,
    },
}

fn load(path: Option<&PathBuf>) -> Result<Settings> {
    let settings = match path {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    };
    let settings = settings.context("failed to load configuration")?;
    settings.validate().context("invalid configuration")?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(cli.config.as_ref())?;
    logging::init_from_settings(&settings)?;

    match cli.command {
        Commands::Run => run(settings).await,
        Commands::Check => check(&settings),
        Commands::Replay {
            instrument,
            interval,
            values,
        } => replay(&settings, &instrument, interval, &values),
    }
}

async fn run(settings: Settings) -> Result<()> {
    info!(
        node = settings.node.id,
        name = %settings.application.name,
        "starting mooring node"
    );
    let node = Node::from_settings(&settings).await?;
    node.run().await?;
    Ok(())
}

fn check(settings: &Settings) -> Result<()> {
    println!("configuration OK: node {}", settings.node.id);
    for instrument in &settings.instruments {
        let schedule = instrument.sample_schedule()?;
        let detection = match &instrument.detector {
            None => "off".to_string(),
            Some(d) => match DetectorParams::from_seconds(
                d.sta_width_sec,
                d.lta_width_sec,
                d.trigger_ratio,
                d.detrigger_ratio,
                d.max_trigger_sec,
                schedule.nominal_period_secs(),
            ) {
                Ok(params) => format!("on ({} / {} samples)", params.sta_width, params.lta_width),
                Err(e) => format!("disabled: {e}"),
            },
        };
        println!(
            "  [{}] {} enabled={} schedule={} power={:?} detection={}",
            instrument.id,
            instrument.name,
            instrument.enabled,
            schedule,
            instrument.power_policy,
            detection
        );
    }
    Ok(())
}

#[cfg(feature = "storage_csv")]
fn replay(
    settings: &Settings,
    instrument: &str,
    interval: Option<u64>,
    values: &Path,
) -> Result<()> {
    let instrument = settings
        .instrument(instrument)
        .ok_or_else(|| anyhow!("no instrument named {instrument}"))?;
    let detector = instrument
        .detector
        .as_ref()
        .ok_or_else(|| anyhow!("instrument {} has no detector", instrument.name))?;
    let interval = match interval {
        Some(interval) => interval,
        None => instrument.sample_schedule()?.nominal_period_secs(),
    };

    let samples = mooring_daq::parser::read_values(values)?;
    let count = samples.len();
    let events = monitor::replay_values(detector, interval, samples)?;
    for event in &events {
        println!("{}", serde_json::to_string(event)?);
    }
    info!(samples = count, transitions = events.len(), "replay finished");
    Ok(())
}

#[cfg(not(feature = "storage_csv"))]
fn replay(
    _settings: &Settings,
    _instrument: &str,
    _interval: Option<u64>,
    _values: &Path,
) -> Result<()> {
    Err(anyhow!("replay requires the storage_csv feature"))
}
