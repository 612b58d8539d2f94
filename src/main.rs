//! Entry point for `splicer`.
//!
//! Parses CLI arguments and hands a validated [`Config`] to the engine.
//! All actual broker work lives in the library; `main.rs` owns only process
//! setup (argument parsing, logger installation).

use anyhow::Result;
use clap::Parser;

use splicer::{logger, Broker, Config};

/// Two-sided TCP rendezvous broker.
///
/// Pairs each connection on the demand port with a waiting connection on the
/// supply port and forwards bytes between the two until either disconnects.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// TCP port accepting supply-side peers.
    #[arg(short = 's', long, value_name = "PORT")]
    supply_port: u16,

    /// TCP port accepting demand-side peers.
    #[arg(short = 'd', long, value_name = "PORT")]
    demand_port: u16,

    /// TCP port publishing unmet-demand counts to drivers (0 disables).
    #[arg(long, value_name = "PORT", default_value_t = 0)]
    driver_port: u16,

    /// Disconnect descriptors idle for this many seconds (0 disables).
    #[arg(long, value_name = "SECS", default_value_t = 0)]
    idle_timeout: u32,

    /// Publish the unmet-demand total every SECS seconds of driver silence
    /// (0 disables the periodic path; event-driven publishing still occurs).
    #[arg(long, value_name = "SECS", default_value_t = 0)]
    driver_period: u32,

    /// Log per-message byte counts and idle expirations.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config {
        supply_port: cli.supply_port,
        demand_port: cli.demand_port,
        driver_port: cli.driver_port,
        idle_timeout: cli.idle_timeout,
        driver_period: cli.driver_period,
        verbose: cli.verbose,
        exit_flag: false,
    };

    logger::init(config.verbose);
    config.apply_env_overrides();
    config.validate()?;

    Broker::new(config)?.run()
}
