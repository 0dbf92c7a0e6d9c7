//! One task session against a device.
//!
//! Demonstrates:
//! - Opening a serial or TCP link and waiting for the device
//! - Printing device messages as they arrive
//! - Parsing results and tallying statuses
//! - Tracking device configuration and task mode
//! - Running a bounded repeat of a trial command, aborted by Ctrl+C
//!
//! Usage:
//!   cargo run --example session -- /dev/ttyACM0
//!   cargo run --example session -- tcp://127.0.0.1:5000 --trials 20 --interval 500
//!   cargo run --example session -- serial:///dev/ttyUSB0?baud=115200 --strict --debug

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use ublock::{
    ConfigEntry, ConfigReadback, Connection, ConnectionOptions, Criteria, Event, LoopEvent,
    LoopScheduler, ModeEntry, ModeReadback, ParseEvent, ReadyPolicy, RepeatOptions, ResultNames,
    ResultParser, ResultStats,
};

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_ADDRESS: &str = "/dev/ttyACM0";
const STATUSES: &[&str] = &["hit", "miss", "catch", "reject", "noresp"];

// ============================================================================
// Types
// ============================================================================

/// Command-line arguments.
#[derive(Debug, Clone)]
struct Args {
    address: String,
    trials: u32,
    interval: Duration,
    strict: bool,
    debug: bool,
}

impl Args {
    /// Parse command-line arguments.
    fn parse() -> Result<Self> {
        let mut args = Self {
            address: DEFAULT_ADDRESS.to_string(),
            trials: 10,
            interval: Duration::ZERO,
            strict: false,
            debug: false,
        };

        let mut iter = std::env::args().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--debug" => args.debug = true,
                "--strict" => args.strict = true,
                "--trials" => {
                    let value = iter.next().context("--trials needs a value")?;
                    args.trials = value.parse().context("--trials must be a number")?;
                }
                "--interval" => {
                    let value = iter.next().context("--interval needs a value")?;
                    let ms: u64 = value.parse().context("--interval must be milliseconds")?;
                    args.interval = Duration::from_millis(ms);
                }
                _ => args.address = arg,
            }
        }
        Ok(args)
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = match Args::parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("[ERROR] {e:#}");
            std::process::exit(2);
        }
    };
    init_logging(args.debug);

    if let Err(e) = run(args).await {
        eprintln!("\n[ERROR] {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(debug: bool) {
    let filter = if debug { "ublock=trace" } else { "ublock=info" };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}

async fn run(args: Args) -> Result<()> {
    println!("=== Session: {} ===\n", args.address);

    // ========================================================================
    // Open
    // ========================================================================

    let options = ConnectionOptions::new()
        .with_ready(ReadyPolicy::FirstLine)
        .with_ready_timeout(Duration::from_secs(5));
    let connection = Connection::open(&args.address, options)
        .await
        .with_context(|| format!("opening {}", args.address))?;
    println!("[1] Connected\n");

    connection.subscribe(|event| match event {
        Event::Info(body) => println!("    > {body}"),
        Event::Error(body) => println!("    * {body}"),
        Event::Output(body) => println!("    < {body}"),
        Event::Closed {
            reason: Some(reason),
        } => println!("    closed: {reason}"),
        _ => {}
    });

    // ========================================================================
    // Results and configuration
    // ========================================================================

    let names = ResultNames::new()
        .with_status(STATUSES.iter().copied())
        .with_values(["wait", "visual", "audio"])
        .with_arrays(["whisk", "lick"]);
    let parser = Arc::new(ResultParser::new(names.clone())?);
    parser.attach(&connection, |event| {
        if let ParseEvent::Record(record) = event {
            println!("    + {record:?}");
        }
    });

    let stats = Arc::new(ResultStats::new(&names, STATUSES.iter().copied(), ["hit"])?);
    stats.attach(&parser, &connection);

    let configs = Arc::new(ConfigReadback::new([
        ConfigEntry::new("delay", "d"),
        ConfigEntry::new("window", "w"),
    ])?);
    configs.attach(&connection);

    let modes = Arc::new(ModeReadback::new([
        ModeEntry::new("Pair", 'P'),
        ModeEntry::new("Test", 'T'),
    ])?);
    modes.attach(&connection);
    configs.refresh(&connection).await?;

    // ========================================================================
    // Trials
    // ========================================================================

    println!("\n[2] Running {} trials...", args.trials);

    let mut repeat = RepeatOptions::new("X", args.trials).with_interval(args.interval);
    if args.strict {
        repeat = repeat.with_criteria(Criteria::strict(["hit", "miss", "reject", "noresp"]));
    }
    let scheduler = LoopScheduler::new(connection.clone(), repeat)?;
    scheduler.on_event(|event| match event {
        LoopEvent::IterationStarting { index, planned, .. } => {
            println!("    Running: {} of {planned}...", index + 1);
        }
        LoopEvent::RunDone {
            actual, planned, ..
        } => println!("    Done: {actual} of {planned}."),
    });
    scheduler.start()?;

    let summary = tokio::select! {
        summary = scheduler.wait() => summary,
        _ = tokio::signal::ctrl_c() => {
            println!("    Aborting...");
            scheduler.abort();
            scheduler.wait().await
        }
    };

    // ========================================================================
    // Report
    // ========================================================================

    println!("\n[3] Summary");
    if let Some(summary) = summary {
        println!("    State: {:?}", summary.state);
    }
    let snapshot = stats.snapshot();
    for (status, count) in &snapshot.counts {
        println!("    {status:>8}: {count}");
    }
    println!("    {:>8}: {}", "(reward)", snapshot.rewarded);
    println!("    mode: {}", modes.current().unwrap_or("?"));
    for entry in configs.entries() {
        let value = configs.value(&entry.name).unwrap_or_else(|| "?".into());
        println!("    {}: {value}", entry.name);
    }

    connection.close().await;
    println!("\n=== Session Complete ===");
    Ok(())
}
