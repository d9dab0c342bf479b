use thiserror::Error;
use tracing::debug;

use crate::config::{default_period_markers, heatmap, MAX_MATCH_MINUTES, RATE_LOOKAHEAD_MINUTES};
use crate::metrics::change::{self, Headline};
use crate::state::series_store::SeriesSnapshot;
use crate::types::{
    BetMarker, DerivedView, HeatBucket, HeatTier, PeriodDelta, PeriodStatus, QuarterScore, Score,
    Snapshot, TargetLine, TotalDrift,
};

/// Why a single metric could not be derived. Only that field goes missing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetricError {
    #[error("series has no observations")]
    NoObservations,
    #[error("no total line in the series")]
    MissingTotalValue,
    #[error("regulation length is zero")]
    ZeroRegulation,
    #[error("no minute with points scored")]
    NoScoredMinutes,
    #[error("no points observed")]
    MissingPoints,
    #[error("no match time has elapsed")]
    NoElapsedTime,
}

type MetricResult<T> = std::result::Result<T, MetricError>;

/// Per-match parameters that don't live in the snapshots themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewContext {
    pub regulation_minutes: u32,
    /// Opening total line, if the history source knows it.
    pub initial_total: Option<f64>,
    pub period_markers: Option<Vec<f64>>,
    pub bet_marker: Option<BetMarker>,
}

impl ViewContext {
    pub fn new(regulation_minutes: u32) -> Self {
        Self { regulation_minutes, initial_total: None, period_markers: None, bet_marker: None }
    }
}

/// Build a complete view from a series. Pure: the same inputs always give the same view.
///
/// `previous` is the last view published for this match and only feeds change detection.
pub fn recompute(
    match_id: &str,
    series: &SeriesSnapshot,
    ctx: &ViewContext,
    previous: Option<&DerivedView>,
) -> DerivedView {
    let snaps: &[Snapshot] = series;

    let per_minute_rate =
        degrade(match_id, "per_minute_rate", per_minute_rate(snaps)).unwrap_or_default();
    let heatmap_buckets = heatmap_buckets(&per_minute_rate);
    let band = degrade(match_id, "total_band", total_band(snaps));
    let total_value = degrade(match_id, "total_value", current_total_value(snaps));
    let pace = degrade(match_id, "pace", effective_pace(snaps, ctx.regulation_minutes));
    let total_deviation_pct = match (pace, total_value) {
        (Some(p), Some(t)) => degrade(match_id, "total_deviation_pct", total_deviation_pct(p, t)),
        _ => None,
    };
    let markers = resolve_period_markers(snaps, ctx);

    let mut view = DerivedView {
        match_id: match_id.to_string(),
        revision: series.revision(),
        snapshot_count: snaps.len(),
        last_timestamp: snaps.last().map(|s| s.timestamp),
        current_score: snaps.iter().rev().find_map(|s| s.score),
        total_points: snaps.iter().rev().find_map(|s| s.total_points),
        pace,
        total_value,
        total_deviation_pct,
        actual_rate_per_minute: degrade(
            match_id,
            "actual_rate_per_minute",
            actual_rate_per_minute(&per_minute_rate),
        ),
        total_drift: degrade(match_id, "total_drift", total_drift(snaps, ctx.initial_total)),
        bet_marker: ctx.bet_marker.or_else(|| snaps.iter().rev().find_map(|s| s.bet_marker)),
        target_line: degrade(match_id, "target_line", target_line(snaps, ctx.regulation_minutes)),
        max_total: band.map(|(_, max)| max),
        min_total: band.map(|(min, _)| min),
        quarter_scores: quarter_scores(snaps, &markers),
        per_minute_rate,
        heatmap_buckets,
        last_change: change::summarize(None, &Headline::default()),
    };
    let prev_headline = previous.map(Headline::of);
    view.last_change = change::summarize(prev_headline.as_ref(), &Headline::of(&view));
    view
}

fn degrade<T>(match_id: &str, metric: &'static str, result: MetricResult<T>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            debug!(match_id, metric, error = %e, "[VIEW] {metric} unavailable: {e}");
            None
        }
    }
}

fn score_diff(now: u32, before: u32) -> i32 {
    (i64::from(now) - i64::from(before)).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

// ---------------------------------------------------------------------------
// Scoring rate
// ---------------------------------------------------------------------------

/// Points scored in each minute `0..=last_minute + RATE_LOOKAHEAD_MINUTES`, with the last
/// minute capped at `MAX_MATCH_MINUTES`.
///
/// A minute's cumulative count is the highest `total_points` seen at or before it, so
/// minutes without observations carry the previous count forward and a dip in the
/// feed contributes 0 instead of a negative rate.
pub fn per_minute_rate(series: &[Snapshot]) -> MetricResult<Vec<u32>> {
    let last = series.last().ok_or(MetricError::NoObservations)?;
    let end = last.minute().min(MAX_MATCH_MINUTES).saturating_add(RATE_LOOKAHEAD_MINUTES);

    let mut rates = Vec::with_capacity(end as usize + 1);
    let mut idx = 0;
    let mut running = 0u32;
    let mut prev_end = 0u32;
    for minute in 0..=end {
        while idx < series.len() && series[idx].minute() <= minute {
            if let Some(p) = series[idx].total_points {
                running = running.max(p);
            }
            idx += 1;
        }
        rates.push(running.saturating_sub(prev_end));
        prev_end = running;
    }
    Ok(rates)
}

pub fn heatmap_buckets(rates: &[u32]) -> Vec<HeatBucket> {
    rates
        .iter()
        .enumerate()
        .map(|(minute, &points)| HeatBucket {
            minute: minute as u32,
            points,
            height: (points as f64 * heatmap::HEIGHT_PER_POINT).min(heatmap::MAX_HEIGHT),
            tier: HeatTier::from_points(points),
        })
        .collect()
}

/// Mean points per minute over minutes where anything was scored.
pub fn actual_rate_per_minute(rates: &[u32]) -> MetricResult<f64> {
    let scored: Vec<u32> = rates.iter().copied().filter(|r| *r > 0).collect();
    if scored.is_empty() {
        return Err(MetricError::NoScoredMinutes);
    }
    let sum: u32 = scored.iter().sum();
    Ok(sum as f64 / scored.len() as f64)
}

// ---------------------------------------------------------------------------
// Total line
// ---------------------------------------------------------------------------

/// Most recent offered total line.
pub fn current_total_value(series: &[Snapshot]) -> MetricResult<f64> {
    if series.is_empty() {
        return Err(MetricError::NoObservations);
    }
    series.iter().rev().find_map(|s| s.total_value).ok_or(MetricError::MissingTotalValue)
}

/// `(min, max)` over every offered total line.
pub fn total_band(series: &[Snapshot]) -> MetricResult<(f64, f64)> {
    series
        .iter()
        .filter_map(|s| s.total_value)
        .fold(None, |acc: Option<(f64, f64)>, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
        .ok_or(MetricError::MissingTotalValue)
}

/// Flat rate that would finish exactly on the current line, spanning minute 0 to the last observation.
pub fn target_line(series: &[Snapshot], regulation_minutes: u32) -> MetricResult<TargetLine> {
    if regulation_minutes == 0 {
        return Err(MetricError::ZeroRegulation);
    }
    let total_value = current_total_value(series)?;
    let to_minute = series.last().map(Snapshot::minute).ok_or(MetricError::NoObservations)?;
    let target_rate = total_value / regulation_minutes as f64;
    Ok(TargetLine {
        total_value,
        regulation_minutes,
        target_rate,
        bucket_height: target_rate * heatmap::HEIGHT_PER_POINT,
        from_minute: 0,
        to_minute,
    })
}

/// Change of the line since it opened. The opening line comes from the caller when known,
/// otherwise the first line the series saw.
pub fn total_drift(series: &[Snapshot], initial_total: Option<f64>) -> MetricResult<TotalDrift> {
    let current_total = current_total_value(series)?;
    let initial_total = initial_total
        .filter(|t| *t > 0.0)
        .or_else(|| series.iter().find_map(|s| s.total_value))
        .ok_or(MetricError::MissingTotalValue)?;
    let drift = current_total - initial_total;
    Ok(TotalDrift {
        initial_total,
        current_total,
        drift: round1(drift),
        drift_pct: round1(drift / initial_total * 100.0),
    })
}

// ---------------------------------------------------------------------------
// Pace
// ---------------------------------------------------------------------------

/// Projected full-game total at the current scoring speed.
pub fn projected_pace(total_points: u32, regulation_minutes: u32, elapsed_minutes: f64) -> MetricResult<f64> {
    if regulation_minutes == 0 {
        return Err(MetricError::ZeroRegulation);
    }
    if total_points == 0 {
        return Err(MetricError::MissingPoints);
    }
    if elapsed_minutes <= 0.0 {
        return Err(MetricError::NoElapsedTime);
    }
    Ok(round1(total_points as f64 * regulation_minutes as f64 / elapsed_minutes))
}

/// Newest snapshot's pace, derived from its points and clock when the feed left it out.
pub fn effective_pace(series: &[Snapshot], regulation_minutes: u32) -> MetricResult<f64> {
    let last = series.last().ok_or(MetricError::NoObservations)?;
    if let Some(p) = last.pace {
        return Ok(p);
    }
    let points = last.total_points.ok_or(MetricError::MissingPoints)?;
    projected_pace(points, regulation_minutes, last.timestamp)
}

/// How far pace runs over (+) or under (-) the line, in percent.
pub fn total_deviation_pct(pace: f64, total_value: f64) -> MetricResult<f64> {
    if total_value <= 0.0 {
        return Err(MetricError::MissingTotalValue);
    }
    Ok(round1((pace - total_value) / total_value * 100.0))
}

// ---------------------------------------------------------------------------
// Periods
// ---------------------------------------------------------------------------

/// Caller-supplied markers, else whatever the feed attached, else the standard layout.
pub fn resolve_period_markers(series: &[Snapshot], ctx: &ViewContext) -> Vec<f64> {
    let mut markers = ctx
        .period_markers
        .clone()
        .or_else(|| series.iter().rev().find_map(|s| s.period_markers.clone()))
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| default_period_markers(ctx.regulation_minutes));
    markers.retain(|m| m.is_finite() && *m > 0.0);
    markers.sort_by(f64::total_cmp);
    markers.dedup();
    markers
}

/// Score delta for each period.
///
/// A period resolves to the last scored snapshot at or before its boundary (or before the
/// current clock if the boundary isn't reached yet) and reports the change against the
/// previous resolved score. Periods that haven't started, or with nothing to resolve, are future.
pub fn quarter_scores(series: &[Snapshot], markers: &[f64]) -> Vec<QuarterScore> {
    let current = series.last().map(|s| s.timestamp);
    let mut prev_score = Score::new(0, 0);
    let mut prev_boundary = 0.0;

    markers
        .iter()
        .enumerate()
        .map(|(i, &boundary)| {
            let period = i + 1;
            let start = prev_boundary;
            prev_boundary = boundary;

            let future = QuarterScore { period, boundary, status: PeriodStatus::Future, delta: None };
            let Some(current) = current else { return future };
            if current < start {
                return future;
            }

            let search_end = boundary.min(current);
            let Some(score) = series
                .iter()
                .rev()
                .filter(|s| s.timestamp <= search_end)
                .find_map(|s| s.score)
            else {
                return future;
            };

            let delta = PeriodDelta {
                team_a: score_diff(score.team_a, prev_score.team_a),
                team_b: score_diff(score.team_b, prev_score.team_b),
            };
            prev_score = score;
            let status =
                if current >= boundary { PeriodStatus::Completed } else { PeriodStatus::InProgress };
            QuarterScore { period, boundary, status, delta: Some(delta) }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::series_store::TimeSeriesStore;

    fn series_of(snaps: Vec<Snapshot>) -> SeriesSnapshot {
        let store = TimeSeriesStore::new();
        for s in snaps {
            store.merge("m1", s);
        }
        store.snapshots_for("m1")
    }

    fn pts(ts: f64, points: u32) -> Snapshot {
        Snapshot::new("m1", ts).with_points(points)
    }

    #[test]
    fn late_snapshot_rates() {
        let series = series_of(vec![pts(10.0, 20), pts(9.0, 18), pts(11.0, 24)]);
        let rates = per_minute_rate(&series).unwrap();
        assert_eq!(rates.len(), 14);
        assert_eq!(rates[9], 18);
        assert_eq!(rates[10], 2);
        assert_eq!(rates[11], 4);
        assert_eq!(rates[12], 0);
    }

    #[test]
    fn rate_never_negative_with_noisy_points() {
        let series = series_of(vec![pts(1.0, 10), pts(2.0, 7), pts(3.0, 12), pts(4.0, 3), pts(5.0, 15)]);
        let rates = per_minute_rate(&series).unwrap();
        assert_eq!(&rates[..6], &[0, 10, 0, 2, 0, 3]);
    }

    #[test]
    fn minutes_without_observations_carry_forward() {
        let series = series_of(vec![pts(0.5, 2), pts(4.2, 9)]);
        let rates = per_minute_rate(&series).unwrap();
        assert_eq!(&rates[..5], &[2, 0, 0, 0, 7]);
        assert_eq!(rates.iter().sum::<u32>(), 9);
    }

    #[test]
    fn rate_axis_is_bounded_for_absurd_clock() {
        let series = [pts(1.0, 2), Snapshot::new("m1", u32::MAX as f64).with_points(10)];
        let rates = per_minute_rate(&series).unwrap();
        assert_eq!(rates.len(), (MAX_MATCH_MINUTES + RATE_LOOKAHEAD_MINUTES + 1) as usize);
        assert_eq!(rates[1], 2);
    }

    #[test]
    fn quarter_delta_saturates_on_huge_scores() {
        let series = series_of(vec![
            Snapshot::new("m1", 5.0).with_score(u32::MAX, 0),
            Snapshot::new("m1", 15.0).with_score(0, u32::MAX),
        ]);
        let quarters = quarter_scores(&series, &[10.0, 20.0]);
        let first = quarters[0].delta.unwrap();
        let second = quarters[1].delta.unwrap();
        assert_eq!((first.team_a, first.team_b), (i32::MAX, 0));
        assert_eq!((second.team_a, second.team_b), (i32::MIN, i32::MAX));
    }

    #[test]
    fn empty_series_has_no_rate() {
        assert_eq!(per_minute_rate(&[]), Err(MetricError::NoObservations));
    }

    #[test]
    fn heatmap_heights_cap_and_tier() {
        let buckets = heatmap_buckets(&[0, 2, 5, 20]);
        assert_eq!(buckets[0].height, 0.0);
        assert_eq!(buckets[0].tier, HeatTier::Tier0);
        assert_eq!(buckets[1].height, 20.0);
        assert_eq!(buckets[2].tier, HeatTier::Tier3);
        assert_eq!(buckets[3].height, 150.0);
        assert_eq!(buckets[3].tier, HeatTier::Tier4);
    }

    #[test]
    fn target_line_uses_latest_offered_total() {
        let series = series_of(vec![
            pts(1.0, 2).with_total_value(160.0),
            pts(5.0, 12).with_total_value(164.0),
            pts(8.0, 20),
        ]);
        let line = target_line(&series, 40).unwrap();
        assert_eq!(line.total_value, 164.0);
        assert!((line.target_rate - 4.1).abs() < 1e-9);
        assert!((line.bucket_height - 41.0).abs() < 1e-9);
        assert_eq!(line.to_minute, 8);
        assert_eq!(target_line(&series, 0), Err(MetricError::ZeroRegulation));
    }

    #[test]
    fn total_band_ignores_missing_lines() {
        let series = series_of(vec![
            pts(1.0, 2).with_total_value(160.0),
            pts(2.0, 4),
            pts(3.0, 6).with_total_value(155.5),
            pts(4.0, 8).with_total_value(158.0),
        ]);
        assert_eq!(total_band(&series), Ok((155.5, 160.0)));
        assert_eq!(total_band(&series_of(vec![pts(1.0, 2)])), Err(MetricError::MissingTotalValue));
    }

    #[test]
    fn quarter_deltas_sum_to_final_score() {
        let mut snaps = Vec::new();
        for minute in 0..=48u32 {
            snaps.push(Snapshot::new("m1", minute as f64).with_score(minute * 2, minute * 2 + minute / 3));
        }
        let series = series_of(snaps);
        let quarters = quarter_scores(&series, &[12.0, 24.0, 36.0, 48.0]);
        assert_eq!(quarters.len(), 4);
        assert!(quarters.iter().all(|q| q.status == PeriodStatus::Completed));

        let (a, b) = quarters.iter().fold((0, 0), |(a, b), q| {
            let d = q.delta.unwrap();
            (a + d.team_a, b + d.team_b)
        });
        assert_eq!((a, b), (96, 112));
    }

    #[test]
    fn unreached_periods_are_future() {
        let series = series_of(vec![
            Snapshot::new("m1", 5.0).with_score(10, 8),
            Snapshot::new("m1", 10.0).with_score(22, 19),
            Snapshot::new("m1", 14.5).with_score(30, 27),
        ]);
        let quarters = quarter_scores(&series, &[10.0, 20.0, 30.0, 40.0]);
        assert_eq!(quarters[0].to_string(), "22:19");
        assert_eq!(quarters[0].status, PeriodStatus::Completed);
        assert_eq!(quarters[1].to_string(), "8:8");
        assert_eq!(quarters[1].status, PeriodStatus::InProgress);
        assert_eq!(quarters[2].to_string(), "-:-");
        assert_eq!(quarters[2].status, PeriodStatus::Future);
        assert_eq!(quarters[3].status, PeriodStatus::Future);
    }

    #[test]
    fn period_without_scored_snapshot_is_future() {
        let series = series_of(vec![pts(3.0, 6)]);
        let quarters = quarter_scores(&series, &[10.0, 20.0]);
        assert!(quarters.iter().all(|q| q.delta.is_none()));
    }

    #[test]
    fn markers_fall_back_to_format_default() {
        let series = series_of(vec![pts(1.0, 2)]);
        assert_eq!(resolve_period_markers(&series, &ViewContext::new(48)), vec![12.0, 24.0, 36.0, 48.0]);

        let mut ctx = ViewContext::new(40);
        ctx.period_markers = Some(vec![20.0, 10.0, 0.0]);
        assert_eq!(resolve_period_markers(&series, &ctx), vec![10.0, 20.0]);
    }

    #[test]
    fn pace_is_derived_when_missing() {
        let series = series_of(vec![pts(20.0, 84)]);
        assert_eq!(effective_pace(&series, 40), Ok(168.0));

        let series = series_of(vec![pts(20.0, 84).with_pace(170.5)]);
        assert_eq!(effective_pace(&series, 40), Ok(170.5));

        let series = series_of(vec![pts(0.0, 0)]);
        assert!(effective_pace(&series, 40).is_err());
    }

    #[test]
    fn deviation_and_drift() {
        assert_eq!(total_deviation_pct(168.0, 160.0), Ok(5.0));
        assert_eq!(total_deviation_pct(150.0, 0.0), Err(MetricError::MissingTotalValue));

        let series = series_of(vec![
            pts(1.0, 2).with_total_value(158.0),
            pts(2.0, 5).with_total_value(162.0),
        ]);
        let from_series = total_drift(&series, None).unwrap();
        assert_eq!(from_series.initial_total, 158.0);
        assert_eq!(from_series.drift, 4.0);

        let from_ctx = total_drift(&series, Some(150.0)).unwrap();
        assert_eq!(from_ctx.drift, 12.0);
        assert_eq!(from_ctx.drift_pct, 8.0);
    }

    #[test]
    fn malformed_total_degrades_only_that_metric() {
        let series = series_of(vec![Snapshot::new("m1", 2.0).with_score(3, 2)]);
        let view = recompute("m1", &series, &ViewContext::new(40), None);
        assert_eq!(view.total_value, None);
        assert_eq!(view.target_line, None);
        assert_eq!(view.max_total, None);
        assert_eq!(view.total_drift, None);
        assert_eq!(view.per_minute_rate[2], 5);
        assert_eq!(view.current_score, Some(Score::new(3, 2)));
        assert!(view.pace.is_some());
    }

    #[test]
    fn recompute_is_deterministic_and_tracks_change() {
        let series = series_of(vec![
            pts(1.0, 2).with_total_value(160.0),
            pts(2.0, 6).with_total_value(160.0),
        ]);
        let ctx = ViewContext::new(40);
        let first = recompute("m1", &series, &ctx, None);
        assert_eq!(first, recompute("m1", &series, &ctx, None));
        assert!(first.last_change.first_view);
        assert_eq!(first.revision, series.revision());
        assert_eq!(first.snapshot_count, 2);

        let again = recompute("m1", &series, &ctx, Some(&first));
        assert!(!again.last_change.material);
        assert!(!again.last_change.first_view);
    }
}
