//! Periodic and manual sync from the relays into the local store.
//!
//! # Architecture
//!
//! ```text
//!   run_periodic ──tick──┐          sync_now (manual)
//!                        ▼                 │
//!              ┌───────────────────┐       │
//!              │ tick_lock.try_lock│◄──────┘   overlapping runs are skipped
//!              └─────────┬─────────┘
//!                        ▼
//!   last_timestamp → event_data_filter → RelayFanout::get_events
//!                        ▼
//!              IngestionPipeline::save_events
//!                        ▼
//!       missing refs → RelayFanout::fetch_by_ids → save_events
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use lectern_ingest::sync::{SyncConfig, SyncService};
//!
//! let service = Arc::new(SyncService::new(fanout, pipeline, SyncConfig::default()));
//! let running = service.running();
//! ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))?;
//! service.run_periodic().await;
//! ```

mod service;

pub use service::{SyncConfig, SyncService, SyncStats, TickOutcome};
