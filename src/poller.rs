use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::reconciler::LiveFeedReconciler;
use crate::types::{FeedOrigin, IngestReport};
use crate::ws::messages::DecodedBatch;

/// Pull source for the live matches table.
#[async_trait]
pub trait MatchFeed: Send + Sync {
    async fn fetch_matches(&self) -> Result<DecodedBatch>;
}

/// Polling fallback for the matches table. Ticks on a fixed interval and only
/// fetches while the push channel is down; `refresh` pulls on demand at any time.
pub struct Poller {
    feed: Arc<dyn MatchFeed>,
    reconciler: Arc<LiveFeedReconciler>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl Poller {
    pub fn new(
        feed: Arc<dyn MatchFeed>,
        reconciler: Arc<LiveFeedReconciler>,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self { feed, reconciler, poll_interval, shutdown }
    }

    pub async fn run(self) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // startup pull happens separately

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.reconciler.health().is_connected() {
                continue;
            }
            if let Err(e) = self.refresh().await {
                warn!("[POLL] fallback poll failed: {e}");
            }
        }
        info!("[POLL] stopped");
    }

    /// Fetch the live table and ingest it. Works regardless of push-channel state.
    pub async fn refresh(&self) -> Result<IngestReport> {
        let batch = self.feed.fetch_matches().await?;
        let health = self.reconciler.health();
        health.inc_polls();
        health.add_malformed(batch.malformed as u64);
        let rows = batch.snapshots.len();
        let report = self.reconciler.ingest(batch.snapshots, FeedOrigin::Poll);
        debug!(
            rows,
            malformed = batch.malformed,
            accepted = report.accepted,
            "[POLL] pulled {rows} rows, {} new",
            report.accepted
        );
        Ok(report)
    }
}
