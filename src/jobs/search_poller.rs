//! Upstream pending-search poller
//!
//! Pulls queued searches from the bridge, dispatches them through the
//! acquisition engine, and acknowledges each one. The bridge re-serves a
//! pending search until it is marked processed, so a local dedupe map keyed
//! by the bridge timestamp prevents double dispatch across poll cycles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::engine::AcquisitionEngine;
use crate::services::metadata::{MetadataClient, PendingSearch};
use crate::services::scorer::FormatPreference;

/// Processed-timestamp entries older than this are forgotten.
const DEDUPE_RETENTION: Duration = Duration::from_secs(3600);

/// Minimum gap between repeated cannot-reach-bridge warnings.
const OFFLINE_LOG_THROTTLE: Duration = Duration::from_secs(60);

pub struct SearchPoller {
    engine: Arc<AcquisitionEngine>,
    metadata: Arc<MetadataClient>,
    /// Bridge timestamp (ms) -> when we processed it locally.
    processed: Mutex<HashMap<u64, Instant>>,
    last_offline_warning: Mutex<Option<Instant>>,
}

impl SearchPoller {
    pub fn new(engine: Arc<AcquisitionEngine>, metadata: Arc<MetadataClient>) -> Self {
        Self {
            engine,
            metadata,
            processed: Mutex::new(HashMap::new()),
            last_offline_warning: Mutex::new(None),
        }
    }

    pub fn spawn(self: Arc<Self>, poll_interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(job = "search_poller", interval_secs = poll_interval.as_secs(), "Polling loop started");
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                self.poll_once().await;
            }
        })
    }

    pub async fn poll_once(&self) {
        let searches = match self.metadata.fetch_pending().await {
            Ok(s) => s,
            Err(e) => {
                let mut last = self.last_offline_warning.lock();
                let due = last
                    .map(|t| t.elapsed() > OFFLINE_LOG_THROTTLE)
                    .unwrap_or(true);
                if due {
                    warn!(job = "search_poller", error = %e, "Cannot reach bridge");
                    *last = Some(Instant::now());
                }
                return;
            }
        };

        self.cleanup_dedupe();

        for search in searches {
            let Some(stamp) = search.timestamp else {
                continue;
            };
            let dedupe_key = (stamp * 1000.0) as u64;
            if self.processed.lock().contains_key(&dedupe_key) {
                continue;
            }

            if self.dispatch(&search).await {
                if let Err(e) = self.metadata.mark_processed(stamp).await {
                    warn!(job = "search_poller", error = %e, "Failed to mark search processed");
                }
                self.processed.lock().insert(dedupe_key, Instant::now());
                // Small gap so simultaneous searches don't flood the daemon.
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }

    async fn dispatch(&self, search: &PendingSearch) -> bool {
        if search.query.is_empty() {
            return false;
        }
        let preference = FormatPreference::parse(&search.format_preference);

        let result = if search.is_album() {
            self.engine
                .dispatch_album_search(
                    &search.query,
                    search.album_target(),
                    preference,
                    search.auto_download,
                    search.metadata_override,
                )
                .await
        } else {
            self.engine
                .dispatch_track_search(
                    &search.query,
                    search.track_target(),
                    preference,
                    search.auto_download,
                    search.metadata_override,
                )
                .await
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(job = "search_poller", query = %search.query, error = %e, "Search dispatch failed");
                false
            }
        }
    }

    fn cleanup_dedupe(&self) {
        let mut processed = self.processed.lock();
        processed.retain(|_, at| at.elapsed() <= DEDUPE_RETENTION);
    }
}
