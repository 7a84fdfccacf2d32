//! Polling sync between the relays and the local store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use tokio::sync::Mutex;

use crate::pipeline::{IngestSession, IngestionPipeline};
use crate::relay::{RelayFanout, RelayFilter, SourcedEvent, event_data_filter};
use crate::store::{NoteView, unix_now};
use crate::{Error, Result};

/// Configuration for the sync service.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Time between periodic ticks (default: 5 minutes).
    pub interval: Duration,

    /// Deadline for one periodic tick (default: 120s).
    pub tick_timeout: Duration,

    /// Profiles older than this are refreshed by a manual sync (default: 24h).
    pub profile_max_age: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            tick_timeout: Duration::from_secs(120),
            profile_max_age: Duration::from_secs(24 * 3600),
        }
    }
}

/// Statistics from one sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Distinct events returned by the relays, missing refs included.
    pub events_received: usize,
    /// Referenced parents that were not stored locally.
    pub missing_refs: usize,
    /// Authors whose profiles were requested.
    pub profiles_requested: usize,
    /// Newest note timestamp after the run; the next run starts after it.
    pub last_sync: i64,
    /// True if the run was skipped (backoff or another run in progress).
    pub skipped: bool,
    pub duration: Duration,
}

/// Result of one periodic tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Completed(SyncStats),
    /// Another sync held the lock.
    Skipped,
    Failed(String),
    TimedOut,
}

impl TickOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickOutcome::Completed(_) => "ok",
            TickOutcome::Skipped => "skipped",
            TickOutcome::Failed(_) => "error",
            TickOutcome::TimedOut => "timeout",
        }
    }
}

/// Pulls new events from the relays into the store.
pub struct SyncService {
    fanout: Arc<RelayFanout>,
    pipeline: Arc<IngestionPipeline>,
    config: SyncConfig,
    /// Held for the duration of a sync run; overlapping runs are skipped.
    tick_lock: Mutex<()>,
    running: Arc<AtomicBool>,
}

impl SyncService {
    pub fn new(
        fanout: Arc<RelayFanout>,
        pipeline: Arc<IngestionPipeline>,
        config: SyncConfig,
    ) -> Self {
        Self {
            fanout,
            pipeline,
            config,
            tick_lock: Mutex::new(()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Shared running flag; clearing it stops [`Self::run_periodic`].
    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Fetch everything newer than the newest stored note, then any missing
    /// thread parents.
    pub async fn sync_once(&self) -> Result<SyncStats> {
        let start = Instant::now();
        let mut session = IngestSession::resume(self.pipeline.store().last_timestamp()?);
        let Some(filter) = event_data_filter(session.last_sync, false, unix_now()) else {
            return Ok(SyncStats {
                skipped: true,
                last_sync: session.last_sync,
                ..SyncStats::default()
            });
        };

        let events = self.fanout.get_events(&filter).await;
        self.pipeline.save_events(&events, &mut session)?;

        let mut stats = SyncStats {
            events_received: events.len(),
            ..SyncStats::default()
        };
        let fetched = self.fetch_missing(&mut session, &mut stats).await?;
        stats.events_received += fetched;
        stats.last_sync = session.last_sync;
        stats.duration = start.elapsed();

        tracing::info!(
            "Sync complete: {} events, {} missing refs in {:?}",
            stats.events_received,
            stats.missing_refs,
            stats.duration
        );
        Ok(stats)
    }

    /// Manual sync.
    ///
    /// Skipped while the newest note is inside the backoff window or another
    /// sync is running. Also refreshes stale profiles of the authors seen.
    pub async fn sync_now(&self) -> Result<SyncStats> {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            tracing::info!("Sync already in progress; skipping manual sync");
            return Ok(SyncStats {
                skipped: true,
                ..SyncStats::default()
            });
        };

        let start = Instant::now();
        let now = unix_now();
        let store = self.pipeline.store();
        let mut session = IngestSession::resume(store.last_timestamp()?);
        let Some(filter) = event_data_filter(session.last_sync, true, now) else {
            return Ok(SyncStats {
                skipped: true,
                last_sync: session.last_sync,
                ..SyncStats::default()
            });
        };

        let events = self.fanout.get_events(&filter).await;
        let authors = self.pipeline.save_events(&events, &mut session)?;

        let mut stats = SyncStats {
            events_received: events.len(),
            ..SyncStats::default()
        };
        let fetched = self.fetch_missing(&mut session, &mut stats).await?;
        stats.events_received += fetched;

        let threshold = now - self.config.profile_max_age.as_secs() as i64;
        let stale = store.check_profiles(&authors, threshold)?;
        if !stale.is_empty() {
            stats.profiles_requested = stale.len();
            let profiles = self.fanout.update_profiles(&stale).await;
            stats.events_received += profiles.len();
            self.pipeline.save_events(&profiles, &mut session)?;
        }

        stats.last_sync = session.last_sync;
        stats.duration = start.elapsed();
        tracing::info!(
            "Manual sync complete: {} events, {} profiles requested in {:?}",
            stats.events_received,
            stats.profiles_requested,
            stats.duration
        );
        Ok(stats)
    }

    /// Fetch and save the parents recorded as missing. One round only, so a
    /// parent's own missing parents wait for the next sync.
    async fn fetch_missing(
        &self,
        session: &mut IngestSession,
        stats: &mut SyncStats,
    ) -> Result<usize> {
        let missing = session.take_missing_refs();
        if missing.is_empty() {
            return Ok(0);
        }

        stats.missing_refs = missing.len();
        counter!("sync_missing_refs_total").increment(missing.len() as u64);
        tracing::debug!("Fetching {} missing thread parents", missing.len());

        let fetched: Vec<SourcedEvent> = self.fanout.fetch_by_ids(&missing).await;
        self.pipeline.save_events(&fetched, session)?;
        session.missing_refs.clear();
        Ok(fetched.len())
    }

    /// Look up a note by id, asking the search relays when it is not stored.
    ///
    /// Falls back to the read relays when no search relay is configured.
    pub async fn search_event(&self, event_id: &str) -> Result<NoteView> {
        let store = self.pipeline.store();
        match store.find_event(event_id) {
            Err(Error::NotFound(_)) => {}
            found => return found,
        }

        let filter = RelayFilter::new().ids([event_id.to_string()]).limit(1);
        let events = self.fanout.search_events(&filter).await;
        tracing::debug!("Search for {} returned {} events", event_id, events.len());
        self.pipeline.save_events(&events, &mut IngestSession::new())?;
        store.find_event(event_id)
    }

    /// One periodic tick under the tick timeout. Skipped if a sync is running.
    pub async fn tick(&self) -> TickOutcome {
        let outcome = match self.tick_lock.try_lock() {
            Err(_) => TickOutcome::Skipped,
            Ok(_guard) => {
                let start = Instant::now();
                let outcome =
                    match tokio::time::timeout(self.config.tick_timeout, self.sync_once()).await {
                        Ok(Ok(stats)) => TickOutcome::Completed(stats),
                        Ok(Err(e)) => TickOutcome::Failed(e.to_string()),
                        Err(_) => TickOutcome::TimedOut,
                    };
                histogram!("sync_tick_duration_seconds").record(start.elapsed().as_secs_f64());
                outcome
            }
        };

        counter!("sync_ticks_total", "outcome" => outcome.as_str()).increment(1);
        match &outcome {
            TickOutcome::Completed(_) => {
                gauge!("sync_last_success_unix").set(unix_now() as f64);
            }
            TickOutcome::Skipped => tracing::info!("Previous sync still running; tick skipped"),
            TickOutcome::Failed(e) => tracing::error!("Sync tick failed: {}", e),
            TickOutcome::TimedOut => tracing::warn!(
                "Sync tick timed out after {:?}",
                self.config.tick_timeout
            ),
        }
        outcome
    }

    /// Tick every `interval` until [`Self::stop`] is called.
    pub async fn run_periodic(&self) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Starting periodic sync (interval: {}s)",
            self.config.interval.as_secs()
        );

        let step = self.config.interval.min(Duration::from_secs(1));
        while self.running.load(Ordering::SeqCst) {
            self.tick().await;

            // Wait for the next interval (or until stopped)
            let start = Instant::now();
            while start.elapsed() < self.config.interval && self.running.load(Ordering::SeqCst) {
                tokio::time::sleep(step).await;
            }
        }

        tracing::info!("Periodic sync stopped");
    }
}
