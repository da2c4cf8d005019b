//! fanout-send - Background daemon for publishing curated content
//!
//! Picks up content items that are ready to go out, publishes them to every
//! selected platform and retries failed platforms with backoff.

use anyhow::Context;
use clap::Parser;
use libfanout::platforms::create_platforms;
use libfanout::{Config, Database, FanoutError, Publisher};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fanout-send")]
#[command(version)]
#[command(about = "Background daemon that publishes curated content")]
#[command(long_about = "\
fanout-send - Background daemon that publishes curated content

DESCRIPTION:
    fanout-send is a long-running daemon that watches the Fanout store and
    publishes ready content items to every platform selected for them.

    Each item is sent to its platforms one after another. A platform that
    fails with a temporary error (timeout, rate limit, server error) is
    retried later with exponential backoff; other platforms are never held
    up by it. Outcomes are recorded per platform and the item's phase is
    derived from them.

USAGE:
    # Run in foreground (logs to stderr)
    fanout-send

    # Check for ready items every 30 seconds
    fanout-send --poll-interval 30

    # Give queued work two minutes to finish on shutdown
    fanout-send --drain-timeout 2m

    # Enable verbose logging
    fanout-send --verbose

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the item being published)

CONFIGURATION:
    Configuration file: ~/.config/fanout/config.toml (or $FANOUT_CONFIG)
    Database location: ~/.local/share/fanout/fanout.db

    [publisher]
    poll_interval_secs = 300   # seconds between store polls
    pacing_delay_ms = 2000     # pause between platforms of one item
    drain_timeout_secs = 30    # time allowed for queued work on shutdown

    [retry]
    base_delay_secs = 60       # backoff base: delay = base * multiplier^attempts
    multiplier = 2.0           # growth per attempt
    max_attempts = 3           # attempts per platform, first one included

    Log output is controlled with FANOUT_LOG_FORMAT (text, json, pretty)
    and FANOUT_LOG_LEVEL, or RUST_LOG.

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration or database error
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    #[arg(help = "How often to check the store for ready items (default: 300)")]
    poll_interval: Option<u64>,

    /// How long queued work may keep running after a stop signal
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    #[arg(help = "Time allowed for queued work on shutdown, e.g. 30s or 2m (overrides config)")]
    drain_timeout: Option<Duration>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    #[arg(help = "Enable verbose logging (useful for debugging)")]
    verbose: bool,

    /// Run once and exit (for testing)
    #[arg(long, hide = true)]
    #[arg(help = "Publish ready items once and exit (for testing)")]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    libfanout::logging::init_default(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(error: &anyhow::Error) -> i32 {
    error
        .downcast_ref::<FanoutError>()
        .map_or(1, FanoutError::exit_code)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    let db = Database::new(&config.database.path)
        .await
        .with_context(|| format!("Failed to open database at {}", config.database.path))?;

    info!("fanout-send daemon starting");

    let registry = create_platforms(&config).await?;
    if registry.is_empty() {
        warn!("No platform is enabled and configured, selected platforms will be recorded as failed");
    }

    let mut publisher = Publisher::new(Arc::new(db), registry, &config);
    if let Some(secs) = cli.poll_interval {
        info!("Poll interval: {}s", secs);
        publisher = publisher.with_poll_interval(Duration::from_secs(secs));
    }
    let drain_timeout = cli
        .drain_timeout
        .unwrap_or_else(|| config.publisher.drain_timeout());

    if cli.once {
        let dispatched = publisher.run_once().await?;
        info!(dispatched, "Processed ready items once, exiting");
        log_stats(&publisher);
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone())?;

    publisher.start()?;
    shutdown.cancelled().await;

    info!(
        drain_timeout = %humantime::format_duration(drain_timeout),
        "Shutdown requested, draining queue"
    );
    publisher.shutdown(drain_timeout).await;
    log_stats(&publisher);

    info!("fanout-send daemon stopped");
    Ok(())
}

fn log_stats(publisher: &Publisher) {
    match serde_json::to_string(&publisher.stats()) {
        Ok(stats) => info!(%stats, "Publisher stats"),
        Err(e) => warn!(error = %e, "Could not serialise publisher stats"),
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM
#[cfg(unix)]
fn setup_signal_handlers(shutdown: CancellationToken) -> anyhow::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Signal setup failed")?;

    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!(signal, "Received shutdown signal, stopping gracefully...");
            shutdown.cancel();
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: CancellationToken) -> anyhow::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully...");
            shutdown.cancel();
        }
    });
    Ok(())
}
