//! `daq`: run demo scans and sequences against mock hardware.
//!
//! ```bash
//! daq scan --points 11 --count-time 0.1
//! daq --hardware lab.toml scan --motor sz --start -1 --stop 1
//! daq sequence --scans 3
//! daq config
//! ```
//!
//! Settings come from `--config` (TOML) and `RUSTDAQ_*` environment
//! variables; see `daq_core::config`.

mod commands;
mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_core::Settings;
use daq_driver_mock::HardwareConfig;
use daq_experiment::EngineContext;
use std::path::PathBuf;
use std::time::Duration;

use crate::commands::ScanArgs;
use crate::logging::{LoggingConfig, OutputFormat};

#[derive(Parser)]
#[command(name = "daq")]
#[command(about = "Acquisition chain scan engine", long_about = None)]
struct Cli {
    /// Engine settings file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Mock hardware description (TOML); built-in demo hardware otherwise
    #[arg(long, global = true)]
    hardware: Option<PathBuf>,

    /// Override the configured log format (pretty, compact, json)
    #[arg(long, global = true)]
    log_format: Option<OutputFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Step one motor and count at every point
    Scan {
        /// Number of points
        #[arg(long, default_value_t = 10)]
        points: usize,

        /// Integration time per point in seconds
        #[arg(long, default_value_t = 0.1)]
        count_time: f64,

        /// Motor to step
        #[arg(long, default_value = "sy")]
        motor: String,

        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        start: f64,

        #[arg(long, default_value_t = 1.0, allow_hyphen_values = true)]
        stop: f64,
    },

    /// Run several time scans inside one sequence
    Sequence {
        /// Number of member scans
        #[arg(long, default_value_t = 3)]
        scans: usize,

        /// Points per member scan
        #[arg(long, default_value_t = 5)]
        points: usize,

        /// Integration time per point in seconds
        #[arg(long, default_value_t = 0.05)]
        count_time: f64,
    },

    /// Print the resolved settings
    Config,
}

fn count_time(seconds: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(seconds)
        .with_context(|| format!("invalid count time {}", seconds))
}

fn load_hardware(path: Option<&PathBuf>) -> Result<HardwareConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            HardwareConfig::from_toml(&text)
        }
        None => Ok(HardwareConfig::demo()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref())?;
    let mut logging = LoggingConfig::from_settings(&settings.log)?;
    if let Some(format) = cli.log_format {
        logging = logging.with_format(format);
    }
    logging::init(logging)?;

    match cli.command {
        Commands::Scan {
            points,
            count_time: seconds,
            motor,
            start,
            stop,
        } => {
            let hardware = load_hardware(cli.hardware.as_ref())?;
            let args = ScanArgs {
                motor,
                start,
                stop,
                points,
                count_time: count_time(seconds)?,
            };
            let context = EngineContext::new(settings);
            let summary = commands::run_scan(context, &hardware, &args).await?;
            print!("{}", summary);
        }
        Commands::Sequence {
            scans,
            points,
            count_time: seconds,
        } => {
            let hardware = load_hardware(cli.hardware.as_ref())?;
            let context = EngineContext::new(settings);
            let (group, members) =
                commands::run_sequence(context, &hardware, scans, points, count_time(seconds)?)
                    .await?;
            for member in &members {
                print!("{}", member);
            }
            print!("{}", group);
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&settings)?);
        }
    }

    Ok(())
}
