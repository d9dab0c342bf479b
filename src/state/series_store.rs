use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::MAX_MATCH_MINUTES;
use crate::types::{MergeReason, MergeResult, Snapshot};

// ---------------------------------------------------------------------------
// Series
// ---------------------------------------------------------------------------

/// One match's ordered observations. Data sits behind an `Arc` so readers can
/// hold a handle while the next merge copies-on-write.
#[derive(Debug, Default)]
struct Series {
    snapshots: Arc<Vec<Snapshot>>,
    revision: u64,
}

/// Where an incoming snapshot lands relative to the stored ones.
enum Placement {
    Append,
    Insert(usize),
    Replace(usize),
    NoOp,
}

impl Series {
    fn place(&self, snapshot: &Snapshot) -> Placement {
        let data = &self.snapshots;
        match data.last() {
            None => return Placement::Append,
            Some(last) if snapshot.timestamp > last.timestamp => return Placement::Append,
            _ => {}
        }
        match data.binary_search_by(|s| s.timestamp.total_cmp(&snapshot.timestamp)) {
            Ok(i) => {
                let existing = &data[i];
                // Same clock reading: the fuller observation wins. None < Some(_).
                if existing == snapshot || snapshot.total_points < existing.total_points {
                    Placement::NoOp
                } else {
                    Placement::Replace(i)
                }
            }
            Err(i) => Placement::Insert(i),
        }
    }
}

/// Immutable view of a series at some revision. Cheap to clone; later merges don't touch it.
#[derive(Debug, Clone, Default)]
pub struct SeriesSnapshot {
    snapshots: Arc<Vec<Snapshot>>,
    revision: u64,
}

impl SeriesSnapshot {
    /// 0 for a match the store doesn't know.
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

impl Deref for SeriesSnapshot {
    type Target = [Snapshot];

    fn deref(&self) -> &[Snapshot] {
        &self.snapshots
    }
}

// ---------------------------------------------------------------------------
// TimeSeriesStore
// ---------------------------------------------------------------------------

pub struct TimeSeriesStore {
    /// match_id → series. The entry's shard lock serializes merges per match.
    series: DashMap<String, Series>,
    /// Store-wide so a series re-created after `close` never reuses an old revision.
    next_revision: AtomicU64,
}

impl TimeSeriesStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Merge one snapshot into `match_id`'s series.
    ///
    /// Rejects only an empty id or an unusable clock (non-finite, negative, or past
    /// `MAX_MATCH_MINUTES`). Late snapshots are inserted
    /// in order, never dropped. On an equal timestamp the stored entry is replaced
    /// only when the newcomer has at least as many points.
    pub fn merge(&self, match_id: &str, mut snapshot: Snapshot) -> MergeResult {
        if match_id.is_empty() {
            return MergeResult { accepted: false, reason: MergeReason::EmptyMatchId, revision: 0 };
        }
        if !snapshot.timestamp.is_finite()
            || snapshot.timestamp < 0.0
            || snapshot.timestamp > MAX_MATCH_MINUTES as f64
        {
            return MergeResult { accepted: false, reason: MergeReason::InvalidTimestamp, revision: 0 };
        }
        // -0.0 would sort apart from 0.0 under total_cmp.
        if snapshot.timestamp == 0.0 {
            snapshot.timestamp = 0.0;
        }
        if snapshot.match_id != match_id {
            snapshot.match_id = match_id.to_string();
        }

        let mut entry = self.series.entry(match_id.to_string()).or_default();
        let series = entry.value_mut();

        let reason = match series.place(&snapshot) {
            Placement::NoOp => {
                return MergeResult {
                    accepted: true,
                    reason: MergeReason::Duplicate,
                    revision: series.revision,
                }
            }
            Placement::Append => {
                Arc::make_mut(&mut series.snapshots).push(snapshot);
                MergeReason::Appended
            }
            Placement::Insert(i) => {
                Arc::make_mut(&mut series.snapshots).insert(i, snapshot);
                MergeReason::Inserted
            }
            Placement::Replace(i) => {
                Arc::make_mut(&mut series.snapshots)[i] = snapshot;
                MergeReason::Replaced
            }
        };
        series.revision = self.next_revision.fetch_add(1, Ordering::Relaxed) + 1;
        MergeResult { accepted: true, reason, revision: series.revision }
    }

    /// Ordered snapshots for a match. Empty for an unknown id.
    pub fn snapshots_for(&self, match_id: &str) -> SeriesSnapshot {
        self.series
            .get(match_id)
            .map(|s| SeriesSnapshot { snapshots: Arc::clone(&s.snapshots), revision: s.revision })
            .unwrap_or_default()
    }

    /// Drop a match's series. The next merge for it starts fresh.
    pub fn close(&self, match_id: &str) -> bool {
        self.series.remove(match_id).is_some()
    }

    pub fn revision(&self, match_id: &str) -> Option<u64> {
        self.series.get(match_id).map(|s| s.revision)
    }

    /// Newest snapshot of a match, by match clock.
    pub fn latest(&self, match_id: &str) -> Option<Snapshot> {
        self.series.get(match_id).and_then(|s| s.snapshots.last().cloned())
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    pub fn match_ids(&self) -> Vec<String> {
        self.series.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for TimeSeriesStore {
    fn default() -> Self {
        Self { series: DashMap::new(), next_revision: AtomicU64::new(0) }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
