//! skyglow - Night-Light Radiance Monitoring
//!
//! # Usage
//!
//! ```bash
//! # Import the region catalogue, then backfill a month of history
//! skyglow seed --file regions.json
//! skyglow ingest --backfill 31
//!
//! # One-off pipeline steps
//! skyglow ingest --date 2025-06-01
//! skyglow detect --date 2025-06-01
//! skyglow notify
//!
//! # The autonomous loop
//! skyglow run
//! ```
//!
//! # Environment Variables
//!
//! - `SKYGLOW_CONFIG`: Path to a TOML config file (default: ./skyglow.toml)
//! - `EARTHDATA_USERNAME` / `EARTHDATA_PASSWORD`: Live tile source credentials
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use skyglow::agent::LoopScheduler;
use skyglow::calibrate::LiveThresholds;
use skyglow::config::SkyglowConfig;
use skyglow::detect::{detect_hotspots, AnomalyDetector, ScoredPoint, DEFAULT_TOP_QUANTILE};
use skyglow::ingest::Aggregator;
use skyglow::notify::{
    HttpRelayTransport, JsonFileTransport, Mailer, NotificationDispatcher,
};
use skyglow::source::LiveTileSource;
use skyglow::store::MetricStore;
use skyglow::types::Region;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "skyglow")]
#[command(about = "Night-light radiance monitoring pipeline")]
#[command(version)]
struct CliArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import the district/state catalogue from a JSON file
    Seed {
        /// Path to a JSON array of regions
        #[arg(long)]
        file: PathBuf,
    },

    /// Ingest tile summaries for one date (default: today)
    Ingest {
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Ingest this many days ending today, oldest first
        #[arg(long, conflicts_with = "date")]
        backfill: Option<u32>,
    },

    /// Run the rolling-window anomaly detection for one date (default: today)
    Detect {
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Dispatch pending alert notifications
    Notify,

    /// Run the autonomous sense/reason/act/learn loop until interrupted
    Run {
        /// Seconds between scheduler cycles
        #[arg(long, default_value = "30")]
        tick_secs: u64,
    },

    /// Print store counts and the recent agent log
    Status,
}

// ============================================================================
// Wiring
// ============================================================================

fn build_aggregator(config: &SkyglowConfig, store: &MetricStore) -> Aggregator {
    let aggregator = Aggregator::new(store.clone());
    if config.source.live {
        if let Some(endpoint) = &config.source.endpoint {
            match LiveTileSource::from_env(endpoint) {
                Ok(source) => return aggregator.with_source(Arc::new(source)),
                Err(e) => {
                    warn!(error = %e, "live tile source unavailable, using simulated values");
                }
            }
        }
    }
    aggregator
}

fn build_mailer(config: &SkyglowConfig) -> Result<Mailer> {
    let drop_transport = Box::new(JsonFileTransport::new(config.notify.drop_dir.clone()));
    match &config.notify.relay_url {
        Some(url) => {
            let relay = HttpRelayTransport::new(
                url,
                config.notify.relay_api_key.clone(),
                &config.notify.from_email,
            )
            .context("failed to construct mail relay client")?;
            Ok(Mailer::new(Box::new(relay)).with_fallback(drop_transport))
        }
        None => Ok(Mailer::new(drop_transport)),
    }
}

fn build_dispatcher(config: &SkyglowConfig, store: &MetricStore) -> Result<NotificationDispatcher> {
    Ok(NotificationDispatcher::new(
        store.clone(),
        build_mailer(config)?,
        config.notify.batch_limit,
        Duration::from_millis(config.notify.inter_send_delay_ms),
        &config.notify.operator_email,
    ))
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_seed(store: &MetricStore, file: &PathBuf) -> Result<()> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let regions: Vec<Region> = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {}", file.display()))?;

    let mut districts = 0;
    let mut states = 0;
    for region in &regions {
        store.upsert_region(region)?;
        match region.level {
            skyglow::types::RegionLevel::District => districts += 1,
            skyglow::types::RegionLevel::State => states += 1,
        }
    }
    info!(districts, states, "region catalogue imported");
    Ok(())
}

async fn cmd_ingest(
    config: &SkyglowConfig,
    store: &MetricStore,
    date: Option<NaiveDate>,
    backfill: Option<u32>,
) -> Result<()> {
    let aggregator = build_aggregator(config, store);
    let today = Utc::now().date_naive();

    let dates: Vec<NaiveDate> = match backfill {
        Some(days) => (0..days)
            .rev()
            .map(|i| today - ChronoDuration::days(i64::from(i)))
            .collect(),
        None => vec![date.unwrap_or(today)],
    };

    for d in dates {
        let summary = aggregator.ingest(d).await?;
        if !summary.success {
            anyhow::bail!("ingest failed: no districts in the store (run `skyglow seed` first)");
        }
    }
    Ok(())
}

fn cmd_detect(store: &MetricStore, date: Option<NaiveDate>) -> Result<()> {
    let day = date.unwrap_or_else(|| Utc::now().date_naive());
    let detector = AnomalyDetector::new(store.clone());
    let created = detector.detect_anomalies(day)?;

    // Quantile ranking of the day's districts, printed for the operator.
    let points: Vec<ScoredPoint> = store
        .metrics_on_date(skyglow::types::RegionLevel::District, day)?
        .into_iter()
        .map(|m| ScoredPoint {
            code: m.code,
            value: m.radiance,
        })
        .collect();
    let ranked = detect_hotspots(&points, DEFAULT_TOP_QUANTILE);
    for h in &ranked {
        println!(
            "{:8} radiance {:6.2}  p{:5.1}  {}",
            h.code,
            h.value,
            h.percentile * 100.0,
            h.severity
        );
    }

    info!(date = %day, alerts = created, ranked = ranked.len(), "detection finished");
    Ok(())
}

async fn cmd_notify(config: &SkyglowConfig, store: &MetricStore) -> Result<()> {
    let dispatcher = build_dispatcher(config, store)?;
    let summary = dispatcher.dispatch_pending().await?;
    info!(
        sent = summary.success_count,
        failed = summary.failure_count,
        "notification dispatch finished"
    );
    Ok(())
}

async fn cmd_run(config: &SkyglowConfig, store: &MetricStore, tick_secs: u64) -> Result<()> {
    let mut scheduler = LoopScheduler::new(
        store.clone(),
        build_aggregator(config, store),
        build_dispatcher(config, store)?,
        LiveThresholds::default(),
        config.agent.clone(),
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    scheduler.run(&cancel, Duration::from_secs(tick_secs)).await;
    Ok(())
}

fn cmd_status(store: &MetricStore) -> Result<()> {
    println!("regions (districts): {}", store.regions_at(skyglow::types::RegionLevel::District)?.len());
    println!("regions (states):    {}", store.regions_at(skyglow::types::RegionLevel::State)?.len());
    println!("alerts:              {}", store.alert_count());
    println!("  unsent:            {}", store.unsent_alerts(usize::MAX)?.len());
    println!("hotspots:            {}", store.hotspot_count());
    println!("  unnotified:        {}", store.unnotified_hotspots(usize::MAX)?.len());
    println!("agent log entries:   {}", store.log_count());

    // Last successful run per phase, reconstructed from the audit log.
    let mut last_success: std::collections::HashMap<skyglow::types::Component, _> =
        std::collections::HashMap::new();
    for entry in store.recent_log(500)? {
        if entry.status == skyglow::types::LogStatus::Success {
            last_success.entry(entry.component).or_insert(entry.timestamp);
        }
    }
    if !last_success.is_empty() {
        println!("\nlast successful run per phase:");
        for component in [
            skyglow::types::Component::Sense,
            skyglow::types::Component::Reason,
            skyglow::types::Component::Act,
            skyglow::types::Component::Learn,
            skyglow::types::Component::Notify,
        ] {
            match last_success.get(&component) {
                Some(ts) => println!(
                    "  {:7} {}",
                    component.to_string(),
                    ts.format("%Y-%m-%d %H:%M:%S")
                ),
                None => println!("  {:7} never", component.to_string()),
            }
        }
    }

    let recent = store.recent_log(10)?;
    if !recent.is_empty() {
        println!("\nrecent agent log (newest first):");
        for entry in recent {
            match &entry.error {
                Some(err) => println!(
                    "  {} {:7} error: {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    entry.component.to_string(),
                    err
                ),
                None => println!(
                    "  {} {:7} ok",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    entry.component.to_string()
                ),
            }
        }
    }
    Ok(())
}

// ============================================================================
// Entry point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    let config = SkyglowConfig::load();
    let store = MetricStore::open(&config.data.db_path)
        .with_context(|| format!("failed to open store at {}", config.data.db_path.display()))?;

    match args.command {
        Command::Seed { file } => cmd_seed(&store, &file),
        Command::Ingest { date, backfill } => cmd_ingest(&config, &store, date, backfill).await,
        Command::Detect { date } => cmd_detect(&store, date),
        Command::Notify => cmd_notify(&config, &store).await,
        Command::Run { tick_secs } => cmd_run(&config, &store, tick_secs).await,
        Command::Status => cmd_status(&store),
    }
}
