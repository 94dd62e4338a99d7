//! Scoped Stream Demo - Streaming Records Out of Bounded Scopes
//!
//! Streams synthetic person records through the bridge from one or more
//! consumer threads, against an in-memory scope provider with a fixed number
//! of slots, and prints a JSON summary.
//!
//! # Usage
//!
//! ```bash
//! # 10000 persons, buffer of 1000, flush every 1000 items, 20 rounds
//! scoped-stream-demo --count 10000 --buffer 1000 --clear-every 1000 --repeat 20
//!
//! # Several consumers competing for 4 scope slots
//! scoped-stream-demo --consumers 8 --max-open 4
//!
//! # Stop consuming early / inject a source failure
//! scoped-stream-demo --abort-after 250
//! scoped-stream-demo --fail-after 5000
//!
//! # Synchronous fallback only
//! scoped-stream-demo --disabled
//!
//! # Verbose logging
//! RUST_LOG=debug scoped-stream-demo
//! ```

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use scoped_stream_core::{
    load_config_from_path, BridgeStats, ConfigOverrides, DiagnosticContext, InMemoryScopeProvider,
    ScopeOutcome, StreamBridge, StreamError, StreamOptions,
};

/// Scoped Stream Demo - stream records out of thread-bound scopes
#[derive(Parser, Debug)]
#[command(name = "scoped-stream-demo")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Records per stream
    #[arg(short = 'n', long, default_value_t = 10_000)]
    count: u32,

    /// Requested buffer capacity per stream
    #[arg(short = 'b', long, default_value_t = 1000)]
    buffer: usize,

    /// Flush the scope every N records (0 = never; default from config)
    #[arg(long, value_name = "N")]
    clear_every: Option<usize>,

    /// Worker pool size (default: provider slots)
    #[arg(short = 'w', long, env = "SCOPED_STREAM_WORKERS")]
    workers: Option<usize>,

    /// Scope slots offered by the in-memory provider
    #[arg(long, default_value_t = 10)]
    max_open: usize,

    /// Disable concurrent streaming (materialize on the caller)
    #[arg(long)]
    disabled: bool,

    /// Number of consumer threads
    #[arg(long, default_value_t = 1)]
    consumers: usize,

    /// Streams per consumer
    #[arg(short = 'r', long, default_value_t = 1)]
    repeat: usize,

    /// Stop consuming each stream after this many records
    #[arg(long, value_name = "N")]
    abort_after: Option<usize>,

    /// Make the source fail when it reaches this record
    #[arg(long, value_name = "N")]
    fail_after: Option<u32>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "SCOPED_STREAM_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "SCOPED_STREAM_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// A synthetic record
#[derive(Clone, Debug, Serialize)]
struct Person {
    id: u32,
    first_name: String,
    last_name: String,
}

impl Person {
    fn generate(id: u32) -> Self {
        Self {
            id,
            first_name: format!("first-{id}"),
            last_name: format!("last-{}", id % 97),
        }
    }
}

/// Outcome of one consumed stream
#[derive(Debug, Serialize)]
struct RunReport {
    consumer: usize,
    round: usize,
    items: usize,
    in_order: bool,
    error: Option<String>,
    elapsed_ms: u128,
}

/// Printed at the end
#[derive(Debug, Serialize)]
struct Summary {
    streams: usize,
    items: usize,
    errors: usize,
    out_of_order: usize,
    scopes_committed: usize,
    scopes_rolled_back: usize,
    peak_open_scopes: usize,
    peak_scope_cache: usize,
    pool_size: usize,
    peak_active_workers: usize,
    bridge: BridgeStats,
    elapsed_ms: u128,
    runs: Vec<RunReport>,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "scoped_stream_demo={level},scoped_stream_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Consume one stream of persons
fn run_once(
    bridge: &StreamBridge<InMemoryScopeProvider>,
    args: &Args,
    options: StreamOptions,
) -> Result<(usize, bool), StreamError> {
    let count = args.count;
    let fail_after = args.fail_after;

    let stream = bridge.stream(
        move |scope| {
            let cache = scope.cache();
            Ok::<_, String>((0..count).map(move |id| {
                if fail_after == Some(id) {
                    return Err(format!("record {id} could not be loaded"));
                }
                cache.track();
                Ok(Person::generate(id))
            }))
        },
        options,
    )?;

    let mut items = 0usize;
    let mut in_order = true;
    for person in stream {
        let person = person?;
        in_order &= person.id as usize == items;
        items += 1;
        if args.abort_after == Some(items) {
            break;
        }
    }
    Ok((items, in_order))
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let mut config = load_config_from_path(args.config.clone())
        .context("Failed to load bridge configuration")?;

    let mut overrides = ConfigOverrides::new();
    if args.disabled {
        overrides = overrides.with_enabled(false);
    }
    if let Some(workers) = args.workers {
        overrides = overrides.with_worker_pool_size(workers);
    }
    if let Some(every) = args.clear_every {
        overrides = overrides.with_clear_resource_interval(every);
    }
    overrides.apply(&mut config);
    config
        .validate()
        .context("Invalid bridge configuration")?;

    let provider = InMemoryScopeProvider::with_max_open(args.max_open);
    let bridge = StreamBridge::new(provider.clone(), config).context("Failed to start stream bridge")?;
    let options = bridge.default_options().with_buffer_capacity(args.buffer);

    info!(
        count = args.count,
        consumers = args.consumers,
        repeat = args.repeat,
        enabled = bridge.config().enabled,
        pool_size = bridge.pool().size(),
        buffer = options.effective_capacity(bridge.config().max_buffer_capacity),
        clear_every = options.clear_resource_every,
        "Starting demo"
    );

    let start = Instant::now();
    let reports: Vec<RunReport> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..args.consumers.max(1))
            .map(|consumer| {
                let bridge = bridge.clone();
                let args = &args;
                s.spawn(move || {
                    let _context = DiagnosticContext::new()
                        .with("consumer", consumer.to_string())
                        .enter();
                    (0..args.repeat.max(1))
                        .map(|round| {
                            let started = Instant::now();
                            let (items, in_order, error) = match run_once(&bridge, args, options) {
                                Ok((items, in_order)) => (items, in_order, None),
                                Err(e) => {
                                    warn!(consumer, round, error = %e, "Stream failed");
                                    (0, true, Some(e.to_string()))
                                }
                            };
                            RunReport {
                                consumer,
                                round,
                                items,
                                in_order,
                                error,
                                elapsed_ms: started.elapsed().as_millis(),
                            }
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap_or_default())
            .collect()
    });

    let expected_streams = args.consumers.max(1) * args.repeat.max(1);
    if !provider.wait_for_terminations(expected_streams, Duration::from_secs(30)) {
        warn!(expected_streams, "Not every scope terminated in time");
    }

    let records = provider.records();
    let pool = bridge.pool().stats();
    let summary = Summary {
        streams: reports.len(),
        items: reports.iter().map(|r| r.items).sum(),
        errors: reports.iter().filter(|r| r.error.is_some()).count(),
        out_of_order: reports.iter().filter(|r| !r.in_order).count(),
        scopes_committed: records
            .iter()
            .filter(|r| r.outcome == Some(ScopeOutcome::Committed))
            .count(),
        scopes_rolled_back: records
            .iter()
            .filter(|r| r.outcome == Some(ScopeOutcome::RolledBack))
            .count(),
        peak_open_scopes: provider.peak_open_scopes(),
        peak_scope_cache: records.iter().map(|r| r.peak_cache).max().unwrap_or(0),
        pool_size: pool.size,
        peak_active_workers: pool.peak_active,
        bridge: bridge.stats(),
        elapsed_ms: start.elapsed().as_millis(),
        runs: reports,
    };

    info!(
        streams = summary.streams,
        items = summary.items,
        errors = summary.errors,
        elapsed_ms = summary.elapsed_ms,
        "Demo finished"
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("Failed to serialize summary")?
    );

    bridge.shutdown();
    Ok(())
}
