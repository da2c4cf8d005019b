//! fanout-ctl - Inspect and correct publication state
//!
//! Unix-style tool over the Fanout store: read an item's status, record an
//! outcome obtained elsewhere, change platform selections, force a publish
//! pass and list what the daemon will pick up next.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use libfanout::dispatcher::DispatchOutcome;
use libfanout::error::{PlatformError, StoreError};
use libfanout::logging::{LogFormat, LoggingConfig};
use libfanout::platforms::{create_platforms, truncate, PlatformRegistry};
use libfanout::queue::WorkRequest;
use libfanout::{
    Config, ContentItem, Database, FanoutError, ItemId, Phase, PlatformKind, PublicationStatus,
    Publisher, Report, Result, StatusSnapshot,
};
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "fanout-ctl")]
#[command(version)]
#[command(about = "Inspect and correct publication state")]
#[command(long_about = "\
fanout-ctl - Inspect and correct publication state

DESCRIPTION:
    fanout-ctl reads and updates the publication state kept by Fanout.
    Every change goes through the same status contract the daemon uses,
    so reports are idempotent and a recorded success is never undone.

COMMANDS:
    status      Show the phase and per-platform results of an item
    report      Record a platform outcome obtained outside the daemon
    select      Replace the platforms an item should go out to
    publish     Run a publish pass for an item right now
    pending     List items the daemon would pick up now

USAGE EXAMPLES:
    # Show an item's status
    fanout-ctl status news-42

    # Same, as JSON
    fanout-ctl status news-42 --format json

    # Record a post that was made by hand
    fanout-ctl report news-42 telegram --status success --post-id 1234

    # Send an item to Telegram and Bluesky only
    fanout-ctl select news-42 telegram bluesky

    # Publish now, retrying failed platforms immediately
    fanout-ctl publish news-42

    # Publish now to one platform
    fanout-ctl publish news-42 --platform bluesky

    # List ready items
    fanout-ctl pending

CONFIGURATION:
    Configuration file: ~/.config/fanout/config.toml
    Database location: ~/.local/share/fanout/fanout.db

    Override with environment variables:
        FANOUT_CONFIG    - Path to config file
        FANOUT_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Database, configuration or authentication error
    3 - Invalid input (unknown item, platform, status, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    #[arg(help = "Enable verbose logging to stderr (useful for debugging)")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show an item's publication status
    Status {
        /// Content item ID
        item_id: String,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Record a platform outcome
    Report {
        /// Content item ID
        item_id: String,

        /// Platform the outcome belongs to
        platform: String,

        /// Outcome: success, failed or pending
        #[arg(short, long)]
        status: String,

        /// Platform post ID (required for success)
        #[arg(long)]
        post_id: Option<String>,

        /// Public URL of the post
        #[arg(long)]
        post_url: Option<String>,

        /// Error description for a failure
        #[arg(long)]
        error: Option<String>,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Replace an item's platform selection
    Select {
        /// Content item ID
        item_id: String,

        /// Platforms to publish to
        #[arg(required = true)]
        platforms: Vec<String>,
    },

    /// Run a publish pass now
    Publish {
        /// Content item ID
        item_id: String,

        /// Limit the pass to these platforms (repeatable)
        #[arg(short, long = "platform")]
        platforms: Vec<String>,
    },

    /// List items that are due for publishing
    Pending {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(FanoutError::InvalidInput(format!(
                "Invalid format '{}'. Must be 'text' or 'json'",
                other
            ))),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "error" };
    LoggingConfig::new(LogFormat::Text, level.to_string(), cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Arc::new(Database::new(&config.database.path).await?);

    match cli.command {
        Commands::Status { item_id, format } => {
            let format = format.parse()?;
            let publisher = Publisher::new(db, PlatformRegistry::new(), &config);
            cmd_status(&publisher, &ItemId::from(item_id), format).await?;
        }
        Commands::Report {
            item_id,
            platform,
            status,
            post_id,
            post_url,
            error,
            format,
        } => {
            let format = format.parse()?;
            let report = build_report(&status, post_id, post_url, error)?;
            let publisher = Publisher::new(db, PlatformRegistry::new(), &config);
            let snapshot = publisher
                .report_result(&ItemId::from(item_id), platform.parse()?, report)
                .await?;
            print_status(&snapshot, format)?;
        }
        Commands::Select { item_id, platforms } => {
            let platforms = parse_platforms(&platforms)?;
            let publisher = Publisher::new(db, PlatformRegistry::new(), &config);
            let snapshot = publisher.reselect(&ItemId::from(item_id), platforms).await?;
            print_status(&snapshot, OutputFormat::Text)?;
        }
        Commands::Publish { item_id, platforms } => {
            let registry = create_platforms(&config).await?;
            let publisher = Publisher::new(db, registry, &config);
            cmd_publish(&publisher, ItemId::from(item_id), &platforms).await?;
        }
        Commands::Pending { format } => {
            let format = format.parse()?;
            let publisher = Publisher::new(db, PlatformRegistry::new(), &config);
            cmd_pending(&publisher, format).await?;
        }
    }

    Ok(())
}

async fn cmd_status(publisher: &Publisher, item_id: &ItemId, format: OutputFormat) -> Result<()> {
    let snapshot = publisher.get_status(item_id).await?;
    print_status(&snapshot, format)
}

fn build_report(
    status: &str,
    post_id: Option<String>,
    post_url: Option<String>,
    error: Option<String>,
) -> Result<Report> {
    match status.parse::<PublicationStatus>()? {
        PublicationStatus::Success => {
            let post_id = post_id.ok_or_else(|| {
                FanoutError::InvalidInput("--post-id is required with --status success".to_string())
            })?;
            Ok(Report::success(post_id, post_url))
        }
        PublicationStatus::Failed => Ok(Report::failed(
            error.unwrap_or_else(|| "reported as failed".to_string()),
        )),
        PublicationStatus::Pending => Ok(Report {
            status: PublicationStatus::Pending,
            post_id,
            post_url,
            error,
            attempted_at: None,
            next_retry_at: None,
        }),
    }
}

fn parse_platforms(names: &[String]) -> Result<BTreeSet<PlatformKind>> {
    names.iter().map(|name| name.parse()).collect()
}

/// One forced dispatch pass in this process, bypassing the daemon's queue
async fn cmd_publish(publisher: &Publisher, item_id: ItemId, platforms: &[String]) -> Result<()> {
    let mut request = WorkRequest::item(item_id.clone()).forced();
    if !platforms.is_empty() {
        request.platforms = Some(parse_platforms(platforms)?);
    }

    let outcome = publisher.dispatch(&request).await?;
    match outcome {
        DispatchOutcome::Aborted { reason } => {
            return Err(StoreError::Unavailable(reason).into());
        }
        DispatchOutcome::NothingDue { .. } => {
            println!("Nothing to publish for {}", item_id);
        }
        DispatchOutcome::Completed { attempted, .. } => {
            let names: Vec<&str> = attempted.iter().map(|p| p.as_str()).collect();
            println!("Attempted: {}", names.join(", "));
        }
    }

    let snapshot = publisher.get_status(&item_id).await?;
    print_status(&snapshot, OutputFormat::Text)?;

    if snapshot.phase == Phase::Failed {
        return Err(PlatformError::Posting("no selected platform succeeded".to_string()).into());
    }
    Ok(())
}

async fn cmd_pending(publisher: &Publisher, format: OutputFormat) -> Result<()> {
    let items = publisher.pending().await?;

    match format {
        OutputFormat::Json => print_json(&items),
        OutputFormat::Text => {
            for item in &items {
                println!("{}", pending_line(item));
            }
            Ok(())
        }
    }
}

fn pending_line(item: &ContentItem) -> String {
    let platforms: Vec<&str> = item.selected_platforms.iter().map(|p| p.as_str()).collect();
    let platforms = if platforms.is_empty() {
        "-".to_string()
    } else {
        platforms.join(",")
    };
    format!(
        "{} | {} | {} | {}",
        item.id,
        item.phase,
        platforms,
        truncate(&item.title, 50, "...")
    )
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| FanoutError::InvalidInput(format!("Failed to serialise output: {}", e)))?;
    println!("{}", json);
    Ok(())
}

fn print_status(snapshot: &StatusSnapshot, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(snapshot),
        OutputFormat::Text => {
            print!("{}", status_text(snapshot, Utc::now()));
            Ok(())
        }
    }
}

fn status_text(snapshot: &StatusSnapshot, now: DateTime<Utc>) -> String {
    let mut out = format!(
        "{} | {} | {} attempt{}\n",
        snapshot.item_id,
        snapshot.phase,
        snapshot.attempt_count,
        if snapshot.attempt_count == 1 { "" } else { "s" }
    );

    for platform in &snapshot.selected_platforms {
        let line = match snapshot.platform_results.get(platform) {
            None => "not attempted".to_string(),
            Some(result) => match result.status {
                PublicationStatus::Success => result
                    .post_url
                    .clone()
                    .or_else(|| result.post_id.clone())
                    .map_or_else(|| "success".to_string(), |post| format!("success {}", post)),
                PublicationStatus::Failed => {
                    let mut line = format!("failed: {}", result.error.as_deref().unwrap_or("unknown error"));
                    if let Some(at) = result.next_retry_at {
                        line.push_str(&format!(" (retry {})", format_time_until(now, at)));
                    }
                    line
                }
                PublicationStatus::Pending => "pending".to_string(),
            },
        };
        out.push_str(&format!("  {:<9} {}\n", platform.as_str(), line));
    }

    if let Some(published_at) = snapshot.published_at {
        out.push_str(&format!("published: {}\n", published_at.to_rfc3339()));
    }
    if let Some(next) = snapshot.next_retry_at {
        out.push_str(&format!("next retry: {}\n", format_time_until(now, next)));
    }
    out
}

/// Human-readable distance to `at`, rounded to the second
fn format_time_until(now: DateTime<Utc>, at: DateTime<Utc>) -> String {
    match (at - now).to_std() {
        Ok(wait) if wait.as_secs() > 0 => format!(
            "in {}",
            humantime::format_duration(std::time::Duration::from_secs(wait.as_secs()))
        ),
        _ => "due now".to_string(),
    }
}
