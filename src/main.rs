//! Searchlight CLI
//!
//! Command-line interface for the search client:
//! - Run a search and stream its results
//! - List tags with ingested entries

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use searchlight::{
    inspect_query, ClientConfig, FilterUpdate, RestClient, SearchClient, SubscribeOptions,
    TimeRange,
};

#[derive(Parser)]
#[command(name = "searchlight")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Client for a remote log-search engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (default: platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a search and stream its results
    Search {
        /// Query string, e.g. "tag=web json status | count"
        query: String,

        /// Range start (RFC 3339). Defaults to the --last window
        #[arg(long)]
        start: Option<String>,

        /// Range end (RFC 3339). Defaults to now
        #[arg(long)]
        end: Option<String>,

        /// Relative window when --start is absent, e.g. 90m, 24h, 7d
        #[arg(long, default_value = "1h")]
        last: String,

        /// Entry page size
        #[arg(long, default_value = "100")]
        count: u64,

        /// Zoom histogram bucket count
        #[arg(long)]
        zoom_granularity: Option<u32>,

        /// Overview histogram bucket count
        #[arg(long)]
        overview_granularity: Option<u32>,
    },

    /// List all tags with ingested entries
    Tags,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "searchlight=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::load_default()?,
    };

    match cli.command {
        Commands::Search {
            query,
            start,
            end,
            last,
            count,
            zoom_granularity,
            overview_granularity,
        } => {
            let end = match end {
                Some(s) => parse_instant(&s)?,
                None => Utc::now(),
            };
            let start = match start {
                Some(s) => parse_instant(&s)?,
                None => end - parse_relative_window(&last)?,
            };
            let range = TimeRange::new(start, end)?;

            run_search(
                config,
                query,
                range,
                count,
                zoom_granularity,
                overview_granularity,
            )
            .await
        }
        Commands::Tags => {
            let client = RestClient::new(config.api)?;
            let tags = client.get_all_tags().await?;
            for tag in tags {
                println!("{}", tag);
            }
            Ok(())
        }
    }
}

async fn run_search(
    config: ClientConfig,
    query: String,
    range: TimeRange,
    count: u64,
    zoom_granularity: Option<u32>,
    overview_granularity: Option<u32>,
) -> anyhow::Result<()> {
    if let Ok(pipeline) = inspect_query(&query) {
        tracing::info!(modules = ?pipeline.modules, "query pipeline");
    }

    let mut filter = FilterUpdate::default().entries_offset(0, count);
    if let Some(granularity) = zoom_granularity {
        filter = filter.zoom_granularity(granularity);
    }
    if let Some(granularity) = overview_granularity {
        filter = filter.overview_granularity(granularity);
    }

    let client = SearchClient::new(config);
    let session = client
        .subscribe(query.as_str(), range, SubscribeOptions::default().with_filter(filter))
        .await?;

    tracing::info!(
        search_id = %session.search_id(),
        effective_query = %session.effective_query(),
        "search subscribed"
    );

    let mut entries = session.entries();
    let mut progress = session.progress();
    let mut stats = session.stats();
    let mut zoom = session.stats_zoom();

    let progress_task = tokio::spawn(async move {
        while let Ok(Some(value)) = progress.recv().await {
            tracing::info!("progress: {}%", value);
        }
    });

    // Stream entries until the active page closes
    let mut total = 0usize;
    while let Some(batch) = entries.recv().await? {
        for entry in &batch.entries {
            match entry.decoded_data() {
                Ok(bytes) => println!("{}", String::from_utf8_lossy(&bytes)),
                Err(e) => tracing::warn!(error = %e, "undecodable entry payload"),
            }
        }
        total += batch.entries.len();
        if batch.finished {
            break;
        }
    }

    // Final pipeline stats
    let mut last_stats = None;
    while let Some(update) = stats.recv().await? {
        let finished = update.finished;
        last_stats = Some(update);
        if finished {
            break;
        }
    }
    if let Some(stats) = last_stats {
        for module in &stats.pipeline {
            tracing::info!(
                module = %module.module,
                input = module.input_entries,
                output = module.output_entries,
                "pipeline stage"
            );
        }
    }

    // Latest zoom histogram, if any arrived
    let mut last_zoom = None;
    while let Ok(Ok(Some(histogram))) = tokio::time::timeout(
        std::time::Duration::from_millis(200),
        zoom.recv(),
    )
    .await
    {
        last_zoom = Some(histogram);
    }
    if let Some(histogram) = last_zoom {
        tracing::info!(
            buckets = histogram.buckets.len(),
            entries = histogram.total(),
            "zoom histogram"
        );
    }

    tracing::info!(total, "search finished");

    session.dispose().await;
    progress_task.abort();
    Ok(())
}

fn parse_instant(s: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("invalid instant: {}", s))
}

/// Parse a relative window like "90m", "24h", "7d"
fn parse_relative_window(s: &str) -> anyhow::Result<Duration> {
    let re = regex::Regex::new(r"^(\d+)([smhd])$").context("regex error")?;
    let caps = re
        .captures(s)
        .with_context(|| format!("invalid window: {} (expected e.g. 90m, 24h, 7d)", s))?;

    let amount: i64 = caps[1].parse().context("invalid number")?;
    let window = match &caps[2] {
        "s" => Duration::seconds(amount),
        "m" => Duration::minutes(amount),
        "h" => Duration::hours(amount),
        "d" => Duration::days(amount),
        _ => anyhow::bail!("invalid time unit"),
    };
    Ok(window)
}
