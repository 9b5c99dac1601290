//! bus-demo entry point
//!
//! Runs a scenario against the demo topology, or, when spawned by a bus as
//! a process worker, serves the requested component.

use anyhow::{Context, Result};
use bus_config::BusConfig;
use bus_demo::{catalog, register_topology, scenarios};
use clap::{Parser, ValueEnum};
use messaging_bus::{child, Bus};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Every verb once
    Basic,
    /// Sustained answer/poll traffic
    Stress,
    /// One chunked result
    Big,
    /// Steady traffic until SIGINT/SIGTERM
    Serve,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Bus configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[arg(short, long, value_enum, default_value_t = Scenario::Basic)]
    scenario: Scenario,

    /// Rounds for the stress scenario
    #[arg(long, default_value_t = 1000)]
    rounds: usize,

    /// Payload size for the big scenario
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    bytes: usize,
}

/// Logs go to stderr; stdout carries the report
fn init_logging(default_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("logging already initialised: {}", e);
    }
}

fn main() -> Result<()> {
    if child::socket_from_env().is_some() {
        init_logging("info", false);
        if let Some(outcome) = child::run_from_env(&catalog()) {
            return outcome.context("worker process");
        }
    }

    let cli = Cli::parse();
    let config = BusConfig::load(cli.config.as_deref()).context("load bus configuration")?;
    init_logging(&config.log_level, cli.json_logs);
    info!(version = env!("CARGO_PKG_VERSION"), scenario = ?cli.scenario, "Starting bus demo");

    let bus = Bus::with_catalog(config, catalog())?;
    bus.install_signal_handlers(cli.scenario == Scenario::Serve)?;
    register_topology(&bus)?;

    let report = match cli.scenario {
        Scenario::Basic => scenarios::basic(&bus),
        Scenario::Stress => scenarios::stress(&bus, cli.rounds),
        Scenario::Big => scenarios::big(&bus, cli.bytes),
        Scenario::Serve => scenarios::serve(&bus),
    };
    bus.shutdown();

    println!("{}", serde_json::to_string_pretty(&report?)?);
    Ok(())
}
