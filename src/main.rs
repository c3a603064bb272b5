//! CLI entry point for the MightyWatt electronic load.
//!
//! # Usage
//!
//! Print device limits:
//! ```bash
//! mightywatt --port /dev/ttyACM0 info
//! ```
//!
//! Hold 1.5 A for ten seconds while printing telemetry:
//! ```bash
//! mightywatt --port /dev/ttyACM0 set current 1.5 --hold 10s
//! ```
//!
//! Run the program from the configuration file:
//! ```bash
//! mightywatt --config config/mightywatt.toml run
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mightywatt::config::{LoadConfig, DEFAULT_CONFIG_PATH};
use mightywatt::load::ElectronicLoad;
use mightywatt::protocol::RunMode;
use mightywatt::{logging, LoadEvent};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mightywatt")]
#[command(about = "Control a MightyWatt R3 electronic load", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Serial port, overrides `serial.port`
    #[arg(long)]
    port: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print device capabilities
    Info,

    /// Print telemetry
    Monitor {
        /// How long to monitor
        #[arg(long, default_value = "10s", value_parser = humantime_serde::re::humantime::parse_duration)]
        duration: Duration,
    },

    /// Apply one set-point and hold it while printing telemetry
    Set {
        mode: ModeArg,
        value: f64,

        #[arg(long, default_value = "10s", value_parser = humantime_serde::re::humantime::parse_duration)]
        hold: Duration,
    },

    /// Run the program from the configuration file
    Run,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Current,
    Voltage,
    PowerCc,
    PowerCv,
    ResistanceCc,
    ResistanceCv,
    VoltageSoftware,
    Mppt,
    SimpleAmmeter,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Current => RunMode::Current,
            ModeArg::Voltage => RunMode::Voltage,
            ModeArg::PowerCc => RunMode::PowerCc,
            ModeArg::PowerCv => RunMode::PowerCv,
            ModeArg::ResistanceCc => RunMode::ResistanceCc,
            ModeArg::ResistanceCv => RunMode::ResistanceCv,
            ModeArg::VoltageSoftware => RunMode::VoltageSoftware,
            ModeArg::Mppt => RunMode::Mppt,
            ModeArg::SimpleAmmeter => RunMode::SimpleAmmeter,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = LoadConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(port) = cli.port {
        config.serial.port = Some(port);
    }
    config.validate().context("invalid configuration")?;
    logging::init_from_config(&config).context("initialising logging")?;

    let port = config
        .serial
        .port
        .clone()
        .ok_or_else(|| anyhow!("no serial port given (use --port or serial.port)"))?;

    let load = ElectronicLoad::from_config(&config);
    load.connect(&port, config.serial.connect_attempts)
        .await
        .with_context(|| format!("connecting to {port}"))?;

    let outcome = match cli.command {
        Commands::Info => print_info(&load),
        Commands::Monitor { duration } => monitor(&load, duration).await,
        Commands::Set { mode, value, hold } => {
            set_and_hold(&load, mode.into(), value, hold).await
        }
        Commands::Run => run_program(&load, &config).await,
    };

    load.disconnect().await.context("disconnecting")?;
    outcome
}

fn print_info(load: &ElectronicLoad) -> Result<()> {
    let caps = load
        .capabilities()
        .ok_or_else(|| anyhow!("load disconnected"))?;
    println!("Firmware:          {}", caps.firmware);
    println!("Board revision:    {}", caps.board_revision);
    println!("Calibrated:        {}", caps.calibration_date);
    println!("Max current:       {} A", caps.max_current());
    println!("Max voltage:       {} V", caps.max_voltage());
    println!("Max power:         {} W", caps.max_power);
    println!("DVM resistance:    {} Ω", caps.dvm_input_resistance);
    println!("Temperature limit: {} °C", caps.temperature_threshold);
    Ok(())
}

fn print_sample(load: &ElectronicLoad) {
    let sample = load.sample();
    println!(
        "{:>9.6} A  {:>9.6} V  {:>8.3} W  {:>3.0} °C{}",
        sample.current,
        sample.voltage,
        sample.power(),
        sample.temperature,
        if sample.status.remote_sensing() { "  4W" } else { "" }
    );
}

/// Print telemetry until `duration` passes, the link drops or Ctrl-C.
/// With `until_program_ends`, also return when the program stops.
async fn watch(
    load: &ElectronicLoad,
    duration: Option<Duration>,
    until_program_ends: bool,
) -> Result<()> {
    let mut events = load.subscribe();
    if until_program_ends && !load.scheduler().is_running() {
        return Ok(());
    }
    let deadline = duration.map(|d| tokio::time::Instant::now() + d);
    let mut last_print = tokio::time::Instant::now();

    loop {
        let sleep_until = deadline
            .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
            _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => return Ok(()),
            event = events.recv() => match event {
                Ok(LoadEvent::DataUpdated) => {
                    if last_print.elapsed() >= Duration::from_millis(500) {
                        last_print = tokio::time::Instant::now();
                        print_sample(load);
                    }
                }
                Ok(LoadEvent::ConnectionLost(reason)) => {
                    return Err(anyhow!("connection lost: {reason}"));
                }
                Ok(LoadEvent::DeviceErrors(text)) => warn!("{text}"),
                Ok(LoadEvent::WatchdogTripped) => warn!("watchdog stopped the load"),
                Ok(LoadEvent::SeriesResistanceWatchdogTripped) => {
                    warn!("series resistance watchdog stopped the load");
                }
                Ok(LoadEvent::ProgramFailed(reason)) => warn!(%reason, "program failed"),
                Ok(LoadEvent::ProgramStopped) if until_program_ends => return Ok(()),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event receiver lagged"),
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

async fn monitor(load: &ElectronicLoad, duration: Duration) -> Result<()> {
    watch(load, Some(duration), false).await
}

async fn set_and_hold(
    load: &ElectronicLoad,
    mode: RunMode,
    value: f64,
    hold: Duration,
) -> Result<()> {
    load.set(mode, value)
        .with_context(|| format!("setting {mode} to {value}"))?;
    info!(%mode, value, "set-point applied");
    let outcome = watch(load, Some(hold), false).await;
    load.stop().await.context("stopping load")?;
    outcome
}

async fn run_program(load: &ElectronicLoad, config: &LoadConfig) -> Result<()> {
    let program = config.program.clone();
    if program.items.is_empty() {
        return Err(anyhow!("the configuration has no [[program.items]]"));
    }
    for (index, item) in program.items.iter().enumerate() {
        info!(index, %item, "program item");
    }
    load.start(program).await.context("starting program")?;
    let outcome = watch(load, None, true).await;
    load.stop().await.context("stopping program")?;
    outcome
}
