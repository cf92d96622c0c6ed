//! pumpchain - command-line control of daisy-chained syringe pumps

mod config;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pumpchain_core::demo::SimulatedBus;
use pumpchain_core::protocol::{PumpAddress, PumpSession};
use pumpchain_core::RateSet;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Settings;
use crate::output::OutputContext;

/// Pumps answering in demo mode
const DEMO_PUMPS: std::ops::Range<u8> = 0..3;

#[derive(Parser)]
#[command(name = "pumpchain")]
#[command(author, version, about = "Syringe pump chain control")]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port (overrides the settings file)
    #[arg(short, long, env = "PUMPCHAIN_PORT")]
    port: Option<String>,

    /// Baud rate (overrides the settings file)
    #[arg(short, long)]
    baud: Option<u32>,

    /// Settings file path
    #[arg(short, long, env = "PUMPCHAIN_CONFIG")]
    config: Option<PathBuf>,

    /// Talk to a simulated chain of three pumps instead of a serial port
    #[arg(long)]
    demo: bool,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe the chain and list responding pumps
    Discover,

    /// Start pumps in the direction given by each rate's sign
    Run {
        /// Rates in ul/h, e.g. 0=1500,1=-20000
        rates: RateSet,
    },

    /// Program rates without starting the pumps
    SetRates {
        /// Rates in ul/h, e.g. 0=1500,1=-20000
        rates: RateSet,
    },

    /// Read back the programmed rates; the sign of each entry picks the direction queried
    GetRates {
        /// Rates in ul/h, e.g. 0=1,1=-1
        rates: RateSet,
    },

    /// Set, run, then read back in one bus session
    Apply {
        /// Rates in ul/h, e.g. 0=1500,1=-20000
        rates: RateSet,
    },

    /// Stop pumps; with no address every discovered pump is stopped
    Stop {
        addresses: Vec<PumpAddress>,
    },

    /// Run a pump forward at the priming rate
    Prime {
        address: PumpAddress,
    },

    /// Set the syringe inner diameter
    SetDiameter {
        address: PumpAddress,

        /// Diameter in mm
        #[arg(value_name = "MM")]
        diameter: String,
    },

    /// Read the syringe inner diameter
    GetDiameter {
        address: PumpAddress,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load().unwrap_or_default(),
    };
    let connection = settings.merge_with_args(cli.port.as_deref(), cli.baud);
    debug!("Connection settings: {:?}", connection);

    let session = if cli.demo {
        info!("Demo mode: simulated pumps at {:?}", DEMO_PUMPS);
        PumpSession::with_factory(connection, SimulatedBus::with_pumps(DEMO_PUMPS))
    } else {
        PumpSession::new(connection)
    };

    let ctx = OutputContext::new(cli.json);

    match &cli.command {
        Commands::Discover => {
            let pumps = session.discover().context("Discovery failed")?;
            ctx.addresses(&pumps);
        }

        Commands::Run { rates } => {
            session.run(rates)?;
            ctx.success(&format!("Running {}", rates));
        }

        Commands::SetRates { rates } => {
            session.set_rates(rates)?;
            ctx.success(&format!("Set {}", rates));
        }

        Commands::GetRates { rates } => {
            let actual = session.get_rates(rates)?;
            ctx.rates(&actual);
        }

        Commands::Apply { rates } => {
            let actual = session.apply(rates)?;
            ctx.rates(&actual);
        }

        Commands::Stop { addresses } => {
            let targets = if addresses.is_empty() {
                session.discover().context("Discovery failed")?
            } else {
                addresses.clone()
            };
            session.stop_all(&targets)?;
            ctx.success(&format!("Stopped {} pump(s)", targets.len()));
        }

        Commands::Prime { address } => {
            session.prime(*address)?;
            ctx.success(&format!("Priming pump {}", address));
        }

        Commands::SetDiameter { address, diameter } => {
            let reported = session.configure_syringe(*address, diameter)?;
            ctx.diameter(*address, &reported);
        }

        Commands::GetDiameter { address } => {
            let diameter = session.get_diameter(*address)?;
            ctx.diameter(*address, &diameter);
        }
    }

    session.close();
    Ok(())
}
