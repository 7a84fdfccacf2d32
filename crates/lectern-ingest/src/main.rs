//! Lectern sync daemon.
//!
//! Polls the configured relays into the local note store on a fixed interval.
//!
//! # Usage
//!
//! ```bash
//! # Run with settings from the environment (or .env)
//! lectern
//!
//! # Override the database and relays
//! lectern --db-path /var/lib/lectern/lectern.db \
//!     --relays wss://relay.damus.io,wss://nos.lol
//!
//! # One manual sync, then print the first global feed page as JSON
//! lectern --once --feed global
//!
//! # Publish a note as the local identity
//! lectern --post "hello from lectern"
//!
//! # Look up a note, asking the search relays if it is not stored
//! lectern --search <event-id>
//! ```
//!
//! # Graceful Shutdown
//!
//! The daemon handles SIGINT (Ctrl+C) and SIGTERM: the running flag is
//! cleared, the current tick finishes and the loop exits.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use lectern_core::metrics::{init_metrics, start_metrics_server};
use lectern_ingest::{
    Config, ContentFilter, FanoutConfig, FeedConfig, FeedPaginator, FeedScope, IngestionPipeline,
    NostrTransport, Pagination, Publisher, RelayAdmin, RelayFanout, RelayRegistry, Store,
    SyncConfig, SyncService, parse_keys,
};
use metrics::gauge;
use nostr::Keys;
use tracing_subscriber::EnvFilter;

/// Lectern sync daemon.
#[derive(Parser, Debug)]
#[command(name = "lectern")]
#[command(about = "Multi-relay Nostr sync into a local note store")]
#[command(version)]
struct Args {
    /// SQLite database path (overrides LECTERN_DB_PATH)
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Relays to seed an empty relay table with (comma-separated, overrides LECTERN_RELAYS)
    #[arg(long, value_delimiter = ',')]
    relays: Option<Vec<String>>,

    /// Retention window in days, 0 to keep everything (overrides LECTERN_RETENTION_DAYS)
    #[arg(long)]
    retention_days: Option<u32>,

    /// Minutes between syncs (overrides LECTERN_SYNC_INTERVAL_MINUTES)
    #[arg(long)]
    sync_interval_minutes: Option<u64>,

    /// Run one manual sync and exit
    #[arg(long)]
    once: bool,

    /// Print the first page of a feed (global, follow, bookmark) as JSON and exit
    #[arg(long)]
    feed: Option<String>,

    /// Sign and publish a text note, then exit
    #[arg(long)]
    post: Option<String>,

    /// Print a note by event id as JSON, fetching it from the relays if needed
    #[arg(long)]
    search: Option<String>,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9090")]
    metrics_port: u16,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(path) = &self.db_path {
            config.db_path = path.clone();
        }
        if let Some(relays) = &self.relays {
            config.relays = relays.clone();
        }
        if let Some(days) = self.retention_days {
            config.retention_days = days;
        }
        if let Some(minutes) = self.sync_interval_minutes {
            config.sync_interval = Duration::from_secs(minutes.max(1) * 60);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (required when both ring and aws-lc-rs are present)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("lectern_ingest=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env().context("Failed to load configuration")?;
    args.apply(&mut config);

    tracing::info!("Lectern starting...");

    let one_shot =
        args.once || args.feed.is_some() || args.post.is_some() || args.search.is_some();
    if args.metrics_port > 0 && !one_shot {
        let metrics_handle = init_metrics().context("Failed to install metrics recorder")?;
        start_metrics_server(args.metrics_port, metrics_handle).await?;
        gauge!("sync_running").set(1.0);
    }

    // Store
    let store = Arc::new(
        Store::open(&config.db_path)
            .with_context(|| format!("Failed to open store at {:?}", config.db_path))?,
    );
    tracing::info!("Store opened at {}", config.db_path.display());

    if config.retention_days > 0 {
        store.purge_older_than(config.retention_days)?;
    }

    // Identity
    let keys = match &config.secret_key {
        Some(secret) => parse_keys(secret)?,
        None => {
            tracing::warn!("No LECTERN_SECRET_KEY set; using a throwaway identity");
            Keys::generate()
        }
    };
    let local_pubkey = keys.public_key().to_hex();
    tracing::info!("Local identity: {}", local_pubkey);

    // Relays
    let fanout_config = FanoutConfig::default();
    let registry = Arc::new(RelayRegistry::new(
        fanout_config.disable_write_after_failures,
    ));
    let admin = RelayAdmin::new(Arc::clone(&store), Arc::clone(&registry));
    let seeded = admin.seed(&config.relays)?;
    if seeded > 0 {
        tracing::info!("Seeded {} relays", seeded);
    }
    if registry.is_empty() {
        tracing::warn!("No relays configured; set LECTERN_RELAYS or pass --relays");
    }
    tracing::info!("Relays: {}", registry.len());

    let fanout = Arc::new(RelayFanout::new(
        Arc::new(NostrTransport::default()),
        Arc::clone(&registry),
        fanout_config,
    ));
    let pipeline = Arc::new(IngestionPipeline::new(
        Arc::clone(&store),
        local_pubkey,
        ContentFilter::new(&config.filters),
    ));

    if let Some(content) = &args.post {
        let publisher = Publisher::new(keys, Arc::clone(&pipeline), Arc::clone(&fanout));
        let note = publisher.build_note(content)?;
        let accepted = publisher.publish(&note).await?;
        tracing::info!("Published {} to {} relays", note.id, accepted);
        return Ok(());
    }

    let sync = SyncService::new(
        Arc::clone(&fanout),
        Arc::clone(&pipeline),
        SyncConfig {
            interval: config.sync_interval,
            ..SyncConfig::default()
        },
    );

    if one_shot {
        if args.once {
            let stats = sync.sync_now().await?;
            tracing::info!(
                "Sync finished: {} events, {} missing refs, {} profiles requested",
                stats.events_received,
                stats.missing_refs,
                stats.profiles_requested
            );
        }
        if let Some(event_id) = &args.search {
            let view = sync.search_event(event_id).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        if let Some(scope) = &args.feed {
            let scope: FeedScope = scope.parse()?;
            let feed = FeedPaginator::new(Arc::clone(&store), FeedConfig::default());
            let mut pagination = Pagination::default();
            let page = feed.get_notes(scope, &mut pagination)?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
        return Ok(());
    }

    // Set up graceful shutdown
    let running = sync.running();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        running.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    sync.run_periodic().await;

    gauge!("sync_running").set(0.0);
    tracing::info!("Shutdown complete");
    Ok(())
}
