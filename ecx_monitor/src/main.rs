//! # ECX Monitor
//!
//! Attach-side inspection tool. Maps a running master's shared segments
//! read-only-in-spirit and prints the bus directory: state, slave names,
//! and every published process variable with its offset and size.
//!
//! With `--watch` it additionally registers a tick-semaphore slot and
//! streams one line per bus cycle (timestamp, cycle times, the first
//! input variable as raw hex), which makes it easy to verify that data
//! is actually moving without writing a consumer.

use clap::Parser;
use ecx::bus::PdDirection;
use ecx_shm::{BusClient, ShmError};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

/// ECX Monitor — inspect a running bus over shared memory
#[derive(Parser, Debug)]
#[command(name = "ecx_monitor")]
#[command(author = "ECX")]
#[command(version)]
#[command(about = "Inspect the shared bus directory of a running ECX master")]
struct Args {
    /// Bus instance to attach to.
    #[arg(long, default_value_t = 0)]
    instance: u32,

    /// Follow the bus: register for cycle ticks and stream updates.
    #[arg(long)]
    watch: bool,

    /// In watch mode, stop after N cycles (0 = run until Ctrl-C).
    #[arg(long, value_name = "N", default_value_t = 0)]
    cycles: u64,

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

    if let Err(e) = run(&args) {
        error!("FATAL: {e}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = match BusClient::attach(args.instance) {
        Ok(client) => client,
        Err(ShmError::NotReady { name }) => {
            return Err(format!(
                "'{name}' is missing - is the master for instance {} running?",
                args.instance
            )
            .into());
        }
        Err(e) => return Err(e.into()),
    };

    print_snapshot(&client)?;

    if args.watch {
        watch(&mut client, args.cycles)?;
    }
    Ok(())
}

fn print_snapshot(client: &BusClient) -> Result<(), Box<dyn std::error::Error>> {
    let state = client.state().map_or_else(
        || format!("unknown ({:#04x})", client.state_raw()),
        |s| s.to_string(),
    );
    let times = client.cycle_times();

    println!("State ............ : {state}");
    println!("Authorized ....... : {}", client.is_authorized());
    println!("Slaves ........... : {}", client.slave_count());
    println!("Last cycle ....... : t={} µs since epoch", client.timestamp_us());
    println!(
        "Cycle time [µs] .. : cur {:.1}  min {:.1}  max {:.1}  avg {:.1}",
        times.current_us, times.min_us, times.max_us, times.avg_us
    );

    for id in 0..client.slave_count() {
        let slave = client.directory().slave(id)?;
        println!("---------------------------------------------------------------");
        println!("Slave {id}: {}", slave.name());
        for (label, dir) in [
            ("inputs", PdDirection::Input),
            ("outputs", PdDirection::Output),
        ] {
            let vars = slave.vars(dir);
            println!("  {label} ({}):", vars.len());
            for var in vars {
                println!(
                    "    {:<40} offset {:>4}  size {}",
                    var.name(),
                    var.offset,
                    var.size
                );
            }
        }
    }
    Ok(())
}

fn watch(client: &mut BusClient, cycles: u64) -> Result<(), Box<dyn std::error::Error>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || r.store(false, Ordering::SeqCst))?;

    let token = client.register()?;
    info!(slot = token.slot(), "registered for cycle ticks");

    // Poll instead of blocking: the semaphore wait retries EINTR, so a
    // blocking wait would sit on a Ctrl-C until the next tick - which
    // never comes once the master is gone.
    let mut seen = 0u64;
    while running.load(Ordering::SeqCst) && (cycles == 0 || seen < cycles) {
        if !client.try_wait_cycle(&token)? {
            thread::sleep(Duration::from_millis(1));
            continue;
        }
        seen += 1;

        let times = client.cycle_times();
        let first_input = match client.input_view(0, 0) {
            Ok(view) => view
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(" "),
            Err(_) => "-".to_string(),
        };
        println!(
            "[{seen:>6}] t={} µs  cycle cur {:.1} avg {:.1} µs  in[0][0] = {first_input}",
            client.timestamp_us(),
            times.current_us,
            times.avg_us
        );
    }
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
