use std::sync::Arc;

use tracing::debug;

use crate::state::active_view::ActiveViewTracker;
use crate::state::series_store::TimeSeriesStore;
use crate::telemetry::health::FeedHealth;
use crate::types::{FeedOrigin, IngestReport, Snapshot};

/// Single entry point for snapshot batches, whatever transport delivered them.
///
/// Every snapshot goes through `TimeSeriesStore::merge`; if the open match changed,
/// its view is recomputed once after the whole batch is in.
pub struct LiveFeedReconciler {
    store: Arc<TimeSeriesStore>,
    view: Arc<ActiveViewTracker>,
    health: Arc<FeedHealth>,
}

impl LiveFeedReconciler {
    pub fn new(
        store: Arc<TimeSeriesStore>,
        view: Arc<ActiveViewTracker>,
        health: Arc<FeedHealth>,
    ) -> Arc<Self> {
        Arc::new(Self { store, view, health })
    }

    pub fn ingest(&self, batch: Vec<Snapshot>, origin: FeedOrigin) -> IngestReport {
        let mut report = IngestReport::default();
        let active = self.view.active_match();
        let mut active_changed = false;

        for snapshot in batch {
            let match_id = snapshot.match_id.clone();
            let result = self.store.merge(&match_id, snapshot);
            if !result.accepted {
                report.rejected += 1;
                debug!(%origin, match_id, reason = %result.reason, "[INGEST] rejected snapshot");
                continue;
            }
            if result.reason.changed() {
                report.accepted += 1;
                if active.as_deref() == Some(match_id.as_str()) {
                    active_changed = true;
                }
            } else {
                report.duplicates += 1;
            }
        }

        if active_changed {
            if let Some(id) = active.as_deref() {
                report.active_refreshed = self.view.refresh(id);
            }
        }

        self.health.record_ingest(&report);
        debug!(
            %origin,
            accepted = report.accepted,
            duplicates = report.duplicates,
            rejected = report.rejected,
            refreshed = report.active_refreshed,
            "[INGEST] {origin} batch: +{} new, {} dup, {} rejected",
            report.accepted,
            report.duplicates,
            report.rejected,
        );
        report
    }

    pub fn store(&self) -> &Arc<TimeSeriesStore> {
        &self.store
    }

    pub fn view(&self) -> &Arc<ActiveViewTracker> {
        &self.view
    }

    pub fn health(&self) -> &Arc<FeedHealth> {
        &self.health
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::state::active_view::{HistorySource, MatchHistory};
    use crate::telemetry::latency::LatencyStats;
    use crate::types::ViewEvent;
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct NoHistory;

    #[async_trait]
    impl HistorySource for NoHistory {
        async fn fetch_history(&self, _match_id: &str) -> Result<MatchHistory> {
            Ok(MatchHistory::default())
        }
    }

    fn setup() -> (Arc<LiveFeedReconciler>, mpsc::Receiver<ViewEvent>) {
        let store = TimeSeriesStore::new();
        let (tx, rx) = mpsc::channel(64);
        let view = ActiveViewTracker::new(
            Arc::clone(&store),
            Arc::new(NoHistory),
            tx,
            Arc::new(LatencyStats::new()),
            40,
            CancellationToken::new(),
        );
        (LiveFeedReconciler::new(store, view, Arc::new(FeedHealth::new())), rx)
    }

    fn snap(id: &str, ts: f64, points: u32) -> Snapshot {
        Snapshot::new(id, ts).with_points(points)
    }

    #[test]
    fn out_of_order_batch_is_reconciled() {
        let (r, _rx) = setup();
        let report = r.ingest(
            vec![snap("m1", 10.0, 20), snap("m1", 9.0, 18), snap("m1", 11.0, 24)],
            FeedOrigin::Push,
        );
        assert_eq!(report.accepted, 3);
        assert!(!report.active_refreshed);

        let ts: Vec<f64> = r.store().snapshots_for("m1").iter().map(|s| s.timestamp).collect();
        assert_eq!(ts, vec![9.0, 10.0, 11.0]);
    }

    #[test]
    fn duplicates_and_rejects_are_counted() {
        let (r, _rx) = setup();
        r.ingest(vec![snap("m1", 1.0, 2)], FeedOrigin::Push);
        let report = r.ingest(
            vec![snap("m1", 1.0, 2), snap("", 2.0, 4), snap("m1", f64::NAN, 4)],
            FeedOrigin::Poll,
        );
        assert_eq!(report, IngestReport { accepted: 0, duplicates: 1, rejected: 2, active_refreshed: false });

        let health = r.health().snapshot();
        assert_eq!((health.merged, health.duplicates, health.rejected), (1, 1, 2));
    }

    #[tokio::test]
    async fn open_match_is_refreshed_once_per_batch() {
        let (r, mut rx) = setup();
        r.view().open("match_42").await.unwrap();
        assert!(matches!(rx.try_recv(), Ok(ViewEvent::Changed { .. })));

        let report = r.ingest(
            vec![snap("match_42", 0.0, 2), snap("other", 3.0, 9), snap("match_42", 0.5, 4)],
            FeedOrigin::Push,
        );
        assert!(report.active_refreshed);

        let view = r.view().current_view().unwrap();
        assert_eq!(view.snapshot_count, 2);
        assert_eq!(view.per_minute_rate[0], 4);
        assert!(matches!(rx.try_recv(), Ok(ViewEvent::Changed { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn first_live_snapshot_after_empty_seed() {
        let (r, _rx) = setup();
        r.view().open("match_42").await.unwrap();
        r.ingest(vec![snap("match_42", 0.0, 2)], FeedOrigin::Push);
        assert_eq!(r.view().current_view().unwrap().per_minute_rate[0], 2);
    }

    #[tokio::test]
    async fn other_matches_do_not_touch_the_view() {
        let (r, _rx) = setup();
        r.view().open("m1").await.unwrap();
        let before = r.view().current_view().unwrap();
        let report = r.ingest(vec![snap("m2", 1.0, 2)], FeedOrigin::Push);
        assert!(!report.active_refreshed);
        assert!(Arc::ptr_eq(&before, &r.view().current_view().unwrap()));
    }

    #[tokio::test]
    async fn duplicate_batch_does_not_republish() {
        let (r, _rx) = setup();
        r.view().open("m1").await.unwrap();
        r.ingest(vec![snap("m1", 1.0, 2)], FeedOrigin::Push);
        let report = r.ingest(vec![snap("m1", 1.0, 2)], FeedOrigin::Poll);
        assert!(!report.active_refreshed);
        assert_eq!(report.duplicates, 1);
    }
}
