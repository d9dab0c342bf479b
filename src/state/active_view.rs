use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::metrics::engine::{self, ViewContext};
use crate::state::series_store::TimeSeriesStore;
use crate::telemetry::latency::LatencyStats;
use crate::types::{BetMarker, DerivedView, Snapshot, ViewEvent};

// ---------------------------------------------------------------------------
// History source
// ---------------------------------------------------------------------------

/// Full history of one match plus the chart metadata that shapes its view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchHistory {
    pub snapshots: Vec<Snapshot>,
    pub regulation_minutes: Option<u32>,
    pub initial_total: Option<f64>,
    pub period_markers: Option<Vec<f64>>,
    pub bet_marker: Option<BetMarker>,
}

/// Where an opened match's past comes from. An empty history is a valid answer (new match);
/// `Err` means the history could not be obtained at all.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch_history(&self, match_id: &str) -> Result<MatchHistory>;
}

// ---------------------------------------------------------------------------
// ActiveViewTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// History fetch in flight. Live merges land in the store but nothing is published.
    Seeding,
    Live,
    /// History fetch failed: the view stays empty until the match is reopened.
    Failed,
}

struct ActiveMatch {
    match_id: String,
    generation: u64,
    cancel: CancellationToken,
    phase: Phase,
    ctx: ViewContext,
}

/// Owns the "which match is open" lifecycle and the published view for it.
pub struct ActiveViewTracker {
    store: Arc<TimeSeriesStore>,
    history: Arc<dyn HistorySource>,
    view: ArcSwapOption<DerivedView>,
    active: Mutex<Option<ActiveMatch>>,
    generation: AtomicU64,
    events: mpsc::Sender<ViewEvent>,
    latency: Arc<LatencyStats>,
    default_regulation_minutes: u32,
    shutdown: CancellationToken,
}

impl ActiveViewTracker {
    pub fn new(
        store: Arc<TimeSeriesStore>,
        history: Arc<dyn HistorySource>,
        events: mpsc::Sender<ViewEvent>,
        latency: Arc<LatencyStats>,
        default_regulation_minutes: u32,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            history,
            view: ArcSwapOption::empty(),
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
            events,
            latency,
            default_regulation_minutes,
            shutdown,
        })
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveMatch>> {
        // A panic while holding the lock leaves plain data behind; keep going with it.
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make `match_id` the displayed match and seed its history.
    ///
    /// Any previously open match is closed first. Returns `Superseded` if a later
    /// `open`/`close` (or shutdown) overtook this one, and `HistoryUnavailable` when
    /// the history could not be fetched.
    pub async fn open(&self, match_id: &str) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let cancel = self.shutdown.child_token();
        {
            let mut active = self.lock_active();
            if let Some(prev) = active.take() {
                prev.cancel.cancel();
                debug!(match_id = %prev.match_id, "[VIEW] closing {} for {match_id}", prev.match_id);
            }
            *active = Some(ActiveMatch {
                match_id: match_id.to_string(),
                generation,
                cancel: cancel.clone(),
                phase: Phase::Seeding,
                ctx: ViewContext::new(self.default_regulation_minutes),
            });
            self.view.store(None);
        }
        info!(match_id, generation, "[VIEW] opening {match_id}, seeding history");

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(AppError::Superseded(match_id.to_string()));
            }
            r = self.history.fetch_history(match_id) => r,
        };

        let ctx = {
            let mut active = self.lock_active();
            let current = match active.as_mut() {
                Some(a) if a.generation == generation => a,
                _ => {
                    debug!(match_id, generation, "[VIEW] discarding stale history response");
                    return Err(AppError::Superseded(match_id.to_string()));
                }
            };

            match fetched {
                Err(e) => {
                    current.phase = Phase::Failed;
                    let reason = e.to_string();
                    warn!(match_id, error = %reason, "[VIEW] chart unavailable for {match_id}: {reason}");
                    self.emit(ViewEvent::Unavailable {
                        match_id: match_id.to_string(),
                        reason: reason.clone(),
                    });
                    return Err(AppError::HistoryUnavailable { match_id: match_id.to_string(), reason });
                }
                Ok(history) => {
                    let count = history.snapshots.len();
                    let mut merged = 0usize;
                    for snapshot in history.snapshots {
                        if self.store.merge(match_id, snapshot).reason.changed() {
                            merged += 1;
                        }
                    }
                    current.ctx = ViewContext {
                        regulation_minutes: history
                            .regulation_minutes
                            .filter(|m| *m > 0)
                            .unwrap_or(self.default_regulation_minutes),
                        initial_total: history.initial_total,
                        period_markers: history.period_markers,
                        bet_marker: history.bet_marker,
                    };
                    current.phase = Phase::Live;
                    info!(
                        match_id,
                        history = count,
                        merged,
                        regulation_minutes = current.ctx.regulation_minutes,
                        "[VIEW] seeded {match_id}: {count} history points ({merged} new)"
                    );
                    current.ctx.clone()
                }
            }
        };

        self.publish(match_id, generation, &ctx);
        Ok(())
    }

    /// Clear the active match, cancel any seeding in flight and drop the view.
    pub fn close(&self) {
        let mut active = self.lock_active();
        if let Some(prev) = active.take() {
            prev.cancel.cancel();
            info!(match_id = %prev.match_id, "[VIEW] closed {}", prev.match_id);
        }
        self.view.store(None);
    }

    /// Recompute and publish if `match_id` is the open, seeded match. Returns true when a
    /// new view went out.
    pub fn refresh(&self, match_id: &str) -> bool {
        let (generation, ctx) = {
            let active = self.lock_active();
            match active.as_ref() {
                Some(a) if a.match_id == match_id && a.phase == Phase::Live => {
                    (a.generation, a.ctx.clone())
                }
                _ => return false,
            }
        };
        self.publish(match_id, generation, &ctx)
    }

    fn publish(&self, match_id: &str, generation: u64, ctx: &ViewContext) -> bool {
        let started = Instant::now();
        let series = self.store.snapshots_for(match_id);
        let previous = self.view.load_full().filter(|v| v.match_id == match_id);
        if previous.as_ref().is_some_and(|p| p.revision >= series.revision()) {
            return false;
        }
        let view = Arc::new(engine::recompute(match_id, &series, ctx, previous.as_deref()));

        // Re-check under the lock so a close/open racing with the recompute wins.
        let active = self.lock_active();
        if !active.as_ref().is_some_and(|a| a.generation == generation && a.phase == Phase::Live) {
            return false;
        }
        let mut published = false;
        self.view.rcu(|current| match current {
            Some(cur) if cur.match_id == view.match_id && cur.revision >= view.revision => {
                published = false;
                Some(Arc::clone(cur))
            }
            _ => {
                published = true;
                Some(Arc::clone(&view))
            }
        });
        drop(active);
        if !published {
            return false;
        }
        self.latency.record(started.elapsed());

        let change = &view.last_change;
        if change.material {
            info!(
                event = "VIEW_CHANGE",
                match_id,
                revision = view.revision,
                points = change.points.value,
                points_diff = change.points.diff,
                pace = change.pace.value,
                pace_diff = change.pace.diff,
                total = change.total.value,
                total_diff = change.total.diff,
                "[VIEW] CHANGE | {match_id} | pts {:.0} ({:+.0}) | pace {:.1} ({:+.1}) | total {:.1} ({:+.1})",
                change.points.value,
                change.points.diff,
                change.pace.value,
                change.pace.diff,
                change.total.value,
                change.total.diff,
            );
            self.emit(ViewEvent::Changed { match_id: match_id.to_string(), view: Arc::clone(&view) });
        }
        true
    }

    fn emit(&self, event: ViewEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("[VIEW] event channel full or closed: {e}");
        }
    }

    pub fn current_view(&self) -> Option<Arc<DerivedView>> {
        self.view.load_full()
    }

    pub fn active_match(&self) -> Option<String> {
        self.lock_active().as_ref().map(|a| a.match_id.clone())
    }
}
