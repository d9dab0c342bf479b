use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::regulation_minutes_for_tournament;
use crate::metrics::engine::projected_pace;
use crate::types::{parse_match_clock, parse_score, Snapshot, SnapshotError};

static FRAME_FAILURES: AtomicU64 = AtomicU64::new(0);
static ROW_FAILURES: AtomicU64 = AtomicU64::new(0);

/// First 10, then every 1000th.
fn should_log(count: u64) -> bool {
    count <= 10 || count % 1000 == 0
}

/// One row of the live matches table, as the backend serializes it.
/// Unknown fields are ignored; anything missing defaults to `None`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchRow {
    /// Number or string on the wire.
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub teams: String,
    #[serde(default)]
    pub tournament: String,
    #[serde(default)]
    pub current_time: Option<String>,
    #[serde(default)]
    pub total_match_time: Option<u32>,
    #[serde(default)]
    pub score: Option<String>,
    #[serde(default)]
    pub total_points: Option<u32>,
    #[serde(default)]
    pub total_value: Option<f64>,
    #[serde(default)]
    pub initial_total: Option<f64>,
    #[serde(default)]
    pub current_pace: Option<f64>,
    #[serde(default)]
    pub total_deviation: Option<f64>,
    #[serde(default)]
    pub minutes_elapsed: Option<f64>,
}

impl MatchRow {
    pub fn match_id(&self) -> Option<String> {
        match &self.id {
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        }
    }

    /// Regulation length: the row's own value, else inferred from the tournament name.
    pub fn regulation_minutes(&self, default: u32) -> u32 {
        self.total_match_time
            .filter(|m| *m > 0)
            .unwrap_or_else(|| regulation_minutes_for_tournament(&self.tournament, default))
    }

    /// Convert to a snapshot. Pace is projected from points and clock when the row has none.
    pub fn to_snapshot(&self, default_regulation: u32) -> Result<Snapshot, SnapshotError> {
        let match_id = self.match_id().ok_or(SnapshotError::MissingMatchId)?;
        let timestamp = parse_match_clock(self.current_time.as_deref().unwrap_or(""))?;
        let score = self.score.as_deref().and_then(parse_score);
        let total_points = self.total_points.or_else(|| score.and_then(|s| s.total()));
        let pace = self.current_pace.or_else(|| {
            let points = total_points?;
            projected_pace(points, self.regulation_minutes(default_regulation), timestamp).ok()
        });

        Ok(Snapshot {
            match_id,
            timestamp,
            score,
            total_points,
            total_value: self.total_value.filter(|v| *v > 0.0),
            pace,
            period_markers: None,
            bet_marker: None,
        })
    }
}

/// `{matches: [...]}`, the body of both `GET /api/matches` and a `table_update` frame.
/// Rows stay raw so one bad row can't sink the batch.
#[derive(Debug, Default, Deserialize)]
pub struct MatchesPayload {
    #[serde(default)]
    pub matches: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    data: Option<MatchesPayload>,
}

/// Snapshots decoded from a batch of rows, plus how many rows were dropped.
#[derive(Debug, Default)]
pub struct DecodedBatch {
    pub snapshots: Vec<Snapshot>,
    pub malformed: usize,
}

#[derive(Debug)]
pub enum ParsedFrame {
    TableUpdate(DecodedBatch),
    /// Valid JSON with some other `type`.
    Other(String),
    Unrecognized,
}

/// Decode each row independently, dropping (and logging) the ones that don't make a snapshot.
pub fn decode_rows(rows: Vec<Value>, default_regulation: u32) -> DecodedBatch {
    let mut batch = DecodedBatch { snapshots: Vec::with_capacity(rows.len()), malformed: 0 };
    for raw in rows {
        let decoded = serde_json::from_value::<MatchRow>(raw)
            .map_err(|e| e.to_string())
            .and_then(|row| row.to_snapshot(default_regulation).map_err(|e| e.to_string()));
        match decoded {
            Ok(snapshot) => batch.snapshots.push(snapshot),
            Err(reason) => {
                batch.malformed += 1;
                let count = ROW_FAILURES.fetch_add(1, Ordering::Relaxed) + 1;
                if should_log(count) {
                    warn!(count, "[WS PARSE] dropping match row: {reason}");
                }
            }
        }
    }
    batch
}

/// Parse one push-channel text frame.
pub fn parse_ws_frame(raw: &str, default_regulation: u32) -> ParsedFrame {
    let frame = match serde_json::from_str::<RawFrame>(raw) {
        Ok(f) => f,
        Err(e) => {
            let count = FRAME_FAILURES.fetch_add(1, Ordering::Relaxed) + 1;
            if should_log(count) {
                let sample: String = raw.chars().take(500).collect();
                warn!(count, "[WS PARSE] unrecognized frame ({e}): {sample}");
            }
            return ParsedFrame::Unrecognized;
        }
    };

    match frame.kind.as_deref() {
        Some("table_update") => {
            let rows = frame.data.unwrap_or_default().matches;
            ParsedFrame::TableUpdate(decode_rows(rows, default_regulation))
        }
        Some(other) => {
            debug!(kind = other, "[WS] ignoring frame type {other}");
            ParsedFrame::Other(other.to_string())
        }
        None => ParsedFrame::Unrecognized,
    }
}
