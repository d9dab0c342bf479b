use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::MAX_MATCH_MINUTES;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Running score as (team_a, team_b).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub team_a: u32,
    pub team_b: u32,
}

impl Score {
    pub fn new(team_a: u32, team_b: u32) -> Self {
        Self { team_a, team_b }
    }

    /// Combined points; `None` if the sum does not fit in a `u32`.
    pub fn total(&self) -> Option<u32> {
        self.team_a.checked_add(self.team_b)
    }
}

impl std::fmt::Display for Score {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.team_a, self.team_b)
    }
}

/// A placed bet: match-clock minute and the total line it was placed at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BetMarker {
    pub timestamp: f64,
    pub total_value: f64,
}

/// One observation of a match at a point on the match clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub match_id: String,
    /// Elapsed match-clock minutes, `minutes + seconds / 60`.
    pub timestamp: f64,
    pub score: Option<Score>,
    pub total_points: Option<u32>,
    /// Bookmaker total line. `None` when no line was offered.
    pub total_value: Option<f64>,
    pub pace: Option<f64>,
    /// Period boundaries in match-clock minutes, when the source knows them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_markers: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bet_marker: Option<BetMarker>,
}

impl Snapshot {
    pub fn new(match_id: impl Into<String>, timestamp: f64) -> Self {
        Self {
            match_id: match_id.into(),
            timestamp,
            score: None,
            total_points: None,
            total_value: None,
            pace: None,
            period_markers: None,
            bet_marker: None,
        }
    }

    pub fn with_points(mut self, total_points: u32) -> Self {
        self.total_points = Some(total_points);
        self
    }

    pub fn with_score(mut self, team_a: u32, team_b: u32) -> Self {
        let score = Score::new(team_a, team_b);
        self.score = Some(score);
        if self.total_points.is_none() {
            self.total_points = score.total();
        }
        self
    }

    pub fn with_total_value(mut self, total_value: f64) -> Self {
        self.total_value = Some(total_value);
        self
    }

    pub fn with_pace(mut self, pace: f64) -> Self {
        self.pace = Some(pace);
        self
    }

    /// Whole match-clock minute this snapshot falls into.
    pub fn minute(&self) -> u32 {
        self.timestamp.max(0.0).floor() as u32
    }
}

/// Malformed record dropped at the decode boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("snapshot has no match id")]
    MissingMatchId,
    #[error("unparseable match clock {0:?}")]
    BadClock(String),
}

/// Parse a match clock like `"12:34"` into elapsed minutes.
/// Anything after the first whitespace is ignored; `"-"` or an empty string has no clock.
/// Clocks past `MAX_MATCH_MINUTES` are rejected.
pub fn parse_match_clock(raw: &str) -> Result<f64, SnapshotError> {
    let bad = || SnapshotError::BadClock(raw.to_string());
    let token = raw.split_whitespace().next().ok_or_else(bad)?;
    if token == "-" {
        return Err(bad());
    }
    let (minutes, seconds) = token.split_once(':').ok_or_else(bad)?;
    let minutes = minutes.parse::<u32>().map_err(|_| bad())?;
    let seconds = seconds.parse::<u32>().map_err(|_| bad())?;
    let elapsed = minutes as f64 + seconds as f64 / 60.0;
    if elapsed > MAX_MATCH_MINUTES as f64 {
        return Err(bad());
    }
    Ok(elapsed)
}

/// Parse a score like `"45:38"`. `"-"`, anything unparseable, and a score whose
/// total overflows are unknown.
pub fn parse_score(raw: &str) -> Option<Score> {
    let (a, b) = raw.trim().split_once(':')?;
    let score = Score::new(a.trim().parse().ok()?, b.trim().parse().ok()?);
    score.total()?;
    Some(score)
}

// ---------------------------------------------------------------------------
// Merge outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeReason {
    /// Newer than anything stored.
    Appended,
    /// Late arrival placed at its sorted position.
    Inserted,
    /// Same timestamp, at least as many points: the stored entry was overwritten.
    Replaced,
    /// Same timestamp, fewer points or an identical record. Accepted, nothing changed.
    Duplicate,
    EmptyMatchId,
    /// Non-finite or negative match clock.
    InvalidTimestamp,
}

impl MergeReason {
    /// True when the merge altered the series.
    pub fn changed(&self) -> bool {
        matches!(self, MergeReason::Appended | MergeReason::Inserted | MergeReason::Replaced)
    }
}

impl std::fmt::Display for MergeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MergeReason::Appended => "appended",
            MergeReason::Inserted => "inserted",
            MergeReason::Replaced => "replaced",
            MergeReason::Duplicate => "duplicate",
            MergeReason::EmptyMatchId => "empty_match_id",
            MergeReason::InvalidTimestamp => "invalid_timestamp",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeResult {
    pub accepted: bool,
    pub reason: MergeReason,
    /// Series revision after the merge (0 when rejected).
    pub revision: u64,
}

// ---------------------------------------------------------------------------
// Derived view
// ---------------------------------------------------------------------------

/// Heat-map colour tier by points scored in a minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeatTier {
    /// Nothing scored.
    Tier0,
    /// 1-2 points
    Tier1,
    /// 3-4 points
    Tier2,
    /// 5-6 points
    Tier3,
    /// 7+
    Tier4,
}

impl HeatTier {
    pub fn from_points(points: u32) -> Self {
        use crate::config::heatmap::*;
        if points == 0 {
            HeatTier::Tier0
        } else if points <= TIER1_MAX {
            HeatTier::Tier1
        } else if points <= TIER2_MAX {
            HeatTier::Tier2
        } else if points <= TIER3_MAX {
            HeatTier::Tier3
        } else {
            HeatTier::Tier4
        }
    }
}

impl std::fmt::Display for HeatTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let n = match self {
            HeatTier::Tier0 => 0,
            HeatTier::Tier1 => 1,
            HeatTier::Tier2 => 2,
            HeatTier::Tier3 => 3,
            HeatTier::Tier4 => 4,
        };
        write!(f, "tier{n}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeatBucket {
    pub minute: u32,
    pub points: u32,
    pub height: f64,
    pub tier: HeatTier,
}

/// Flat scoring rate needed to land exactly on the current total line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TargetLine {
    pub total_value: f64,
    pub regulation_minutes: u32,
    /// Points per minute.
    pub target_rate: f64,
    /// `target_rate` on the heat-map height scale.
    pub bucket_height: f64,
    pub from_minute: u32,
    pub to_minute: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodStatus {
    Completed,
    InProgress,
    Future,
}

impl std::fmt::Display for PeriodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeriodStatus::Completed => write!(f, "completed"),
            PeriodStatus::InProgress => write!(f, "in_progress"),
            PeriodStatus::Future => write!(f, "future"),
        }
    }
}

/// Points scored by each side within one period. Signed: a feed correction can undo points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeriodDelta {
    pub team_a: i32,
    pub team_b: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QuarterScore {
    /// 1-based period number.
    pub period: usize,
    /// Match-clock minute the period ends at.
    pub boundary: f64,
    pub status: PeriodStatus,
    /// `None` for a future period.
    pub delta: Option<PeriodDelta>,
}

impl std::fmt::Display for QuarterScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.delta {
            Some(d) => write!(f, "{}:{}", d.team_a, d.team_b),
            None => write!(f, "-:-"),
        }
    }
}

/// Movement of the total line since the opening line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TotalDrift {
    pub initial_total: f64,
    pub current_total: f64,
    pub drift: f64,
    pub drift_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricDelta {
    pub value: f64,
    pub diff: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChangeSummary {
    /// Set when no view had been published before this one.
    pub first_view: bool,
    pub material: bool,
    pub points: MetricDelta,
    pub pace: MetricDelta,
    pub total: MetricDelta,
}

/// Everything a renderer needs for one match, rebuilt from scratch on every accepted merge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DerivedView {
    pub match_id: String,
    /// Series revision this view was computed from.
    pub revision: u64,
    pub snapshot_count: usize,
    pub last_timestamp: Option<f64>,
    pub current_score: Option<Score>,
    pub total_points: Option<u32>,
    pub pace: Option<f64>,
    pub total_value: Option<f64>,
    pub total_deviation_pct: Option<f64>,
    pub actual_rate_per_minute: Option<f64>,
    pub total_drift: Option<TotalDrift>,
    pub bet_marker: Option<BetMarker>,

    pub per_minute_rate: Vec<u32>,
    pub heatmap_buckets: Vec<HeatBucket>,
    pub target_line: Option<TargetLine>,
    pub max_total: Option<f64>,
    pub min_total: Option<f64>,
    pub quarter_scores: Vec<QuarterScore>,
    pub last_change: ChangeSummary,
}

// ---------------------------------------------------------------------------
// Feed plumbing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ViewEvent {
    Changed { match_id: String, view: Arc<DerivedView> },
    /// The opened match could not be seeded ("chart unavailable").
    Unavailable { match_id: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Shutdown = 3,
}

impl ConnectionState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Shutdown,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Shutdown => "shutdown",
        };
        write!(f, "{s}")
    }
}

/// Where an ingested batch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOrigin {
    Push,
    Poll,
    Seed,
}

impl std::fmt::Display for FeedOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedOrigin::Push => write!(f, "push"),
            FeedOrigin::Poll => write!(f, "poll"),
            FeedOrigin::Seed => write!(f, "seed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Merges that changed a series.
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    /// The active match was recomputed and published from this batch.
    pub active_refreshed: bool,
}
