//! # ECX Master
//!
//! EtherCAT master daemon. Brings the bus to OP, discovers named process
//! variables, and publishes the bus directory plus both process-data
//! images into shared memory, ticking registered consumers every cycle.
//!
//! Runs against the simulated backend (`ifname = "sim"`) out of the box;
//! hardware stacks plug in through the
//! [`MasterStack`](ecx_master::stack::MasterStack) trait.

use clap::Parser;
use ecx_master::config::{MasterConfig, load_config};
use ecx_master::cycle::{Orchestrator, rt_setup};
use ecx_master::sim::SimStack;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

/// Config path tried when none is given on the command line.
const DEFAULT_CONFIG_PATH: &str = "config/master.toml";

/// ECX Master — EtherCAT master with shared-memory publication
#[derive(Parser, Debug)]
#[command(name = "ecx_master")]
#[command(author = "ECX")]
#[command(version)]
#[command(about = "EtherCAT master publishing the bus over shared memory")]
struct Args {
    /// Path to the master configuration TOML.
    /// Falls back to config/master.toml, then to built-in defaults.
    config: Option<PathBuf>,

    /// Network interface to bind, or "sim" (overrides the config file).
    #[arg(long, value_name = "IF")]
    ifname: Option<String>,

    /// Bus instance id (overrides the config file).
    #[arg(long)]
    instance: Option<u32>,

    /// Cycle time in microseconds (overrides the config file).
    #[arg(long, value_name = "US")]
    cycle_us: Option<u32>,

    /// CPU core to pin the cyclic loop to (overrides the config file).
    #[arg(long)]
    cpu_core: Option<usize>,

    /// SCHED_FIFO priority (overrides the config file).
    #[arg(long)]
    rt_priority: Option<i32>,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();
    setup_tracing(&args);

    info!("ECX master v{} starting...", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&args) {
        error!("FATAL: {e}");
        process::exit(1);
    }

    info!("ECX master shutdown complete");
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                load_config(default_path)?
            } else {
                info!("no config file at {DEFAULT_CONFIG_PATH}, using defaults");
                MasterConfig::default()
            }
        }
    };

    // Command-line overrides win over the file.
    if let Some(ifname) = &args.ifname {
        config.ifname = ifname.clone();
    }
    if let Some(instance) = args.instance {
        config.instance = instance;
    }
    if let Some(cycle_us) = args.cycle_us {
        config.cycle_time_us = cycle_us;
    }
    if let Some(cpu_core) = args.cpu_core {
        config.cpu_core = cpu_core;
    }
    if let Some(rt_priority) = args.rt_priority {
        config.rt_priority = rt_priority;
    }
    config.validate()?;

    info!(
        "config OK: ifname={}, instance={}, cycle_time={}µs",
        config.ifname, config.instance, config.cycle_time_us
    );

    // RT setup (mlockall, affinity, scheduler); no-ops without `rt`.
    rt_setup(config.cpu_core, config.rt_priority)?;
    info!(
        "RT setup complete (cpu_core={}, priority={})",
        config.cpu_core, config.rt_priority
    );

    if config.ifname != "sim" {
        return Err(format!(
            "no native fieldbus backend compiled in for '{}'; use ifname = \"sim\"",
            config.ifname
        )
        .into());
    }
    let stack = SimStack::demo();

    // Signal handler for graceful shutdown.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        r.store(false, Ordering::SeqCst);
    })?;

    let mut master = Orchestrator::bring_up(stack, &config, running)?;
    master.run()?;
    master.shutdown();

    Ok(())
}

/// Setup tracing subscriber based on CLI arguments.
fn setup_tracing(args: &Args) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}
