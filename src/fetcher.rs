use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{Config, MAX_MATCH_MINUTES};
use crate::error::{AppError, Result};
use crate::poller::MatchFeed;
use crate::state::active_view::{HistorySource, MatchHistory};
use crate::types::{parse_match_clock, parse_score, BetMarker, Snapshot};
use crate::ws::messages::{decode_rows, DecodedBatch, MatchesPayload};

// ---------------------------------------------------------------------------
// Chart payload
// ---------------------------------------------------------------------------

/// `GET /api/matches/{id}/chart`. Arrays are index-aligned.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChartPayload {
    /// "MM:SS" strings (or plain minutes).
    #[serde(default)]
    pub timestamps: Vec<Value>,
    #[serde(default)]
    pub total_points: Vec<Option<u32>>,
    /// 0 or null means no line was offered at that point.
    #[serde(default)]
    pub total_values: Vec<Option<f64>>,
    #[serde(default)]
    pub pace_data: Vec<Option<f64>>,
    #[serde(default)]
    pub scores: Vec<Option<String>>,
    #[serde(default)]
    pub period_lines: Option<Vec<f64>>,
    #[serde(default)]
    pub bet_timestamp: Option<Value>,
    #[serde(default)]
    pub bet_total: Option<f64>,
    #[serde(default)]
    pub total_match_time: Option<u32>,
    #[serde(default)]
    pub initial_total: Option<f64>,
    /// Set instead of the arrays when the backend failed.
    #[serde(default)]
    pub error: Option<String>,
}

fn chart_time(v: &Value) -> Option<f64> {
    match v {
        Value::String(s) => parse_match_clock(s).ok(),
        Value::Number(n) => {
            n.as_f64().filter(|m| m.is_finite() && *m >= 0.0 && *m <= MAX_MATCH_MINUTES as f64)
        }
        _ => None,
    }
}

impl ChartPayload {
    /// Turn the chart into history for `match_id`. An `error` payload is a failure;
    /// entries with an unusable clock are skipped.
    pub fn into_history(self, match_id: &str) -> Result<MatchHistory> {
        if let Some(err) = self.error {
            return Err(AppError::Api(err));
        }

        let mut skipped = 0usize;
        let mut snapshots = Vec::with_capacity(self.timestamps.len());
        for (i, raw_ts) in self.timestamps.iter().enumerate() {
            let Some(timestamp) = chart_time(raw_ts) else {
                skipped += 1;
                continue;
            };
            let score = self.scores.get(i).cloned().flatten().as_deref().and_then(parse_score);
            let total_points =
                self.total_points.get(i).copied().flatten().or_else(|| score.and_then(|s| s.total()));
            snapshots.push(Snapshot {
                match_id: match_id.to_string(),
                timestamp,
                score,
                total_points,
                total_value: self.total_values.get(i).copied().flatten().filter(|v| *v > 0.0),
                pace: self.pace_data.get(i).copied().flatten(),
                period_markers: None,
                bet_marker: None,
            });
        }
        if skipped > 0 {
            debug!(match_id, skipped, "[HISTORY] skipped {skipped} chart points without a clock");
        }

        let bet_marker = match (self.bet_timestamp.as_ref().and_then(chart_time), self.bet_total) {
            (Some(timestamp), Some(total_value)) if total_value > 0.0 => {
                Some(BetMarker { timestamp, total_value })
            }
            _ => None,
        };

        Ok(MatchHistory {
            snapshots,
            regulation_minutes: self.total_match_time.filter(|m| *m > 0),
            initial_total: self.initial_total.filter(|t| *t > 0.0),
            period_markers: self.period_lines.filter(|l| !l.is_empty()),
            bet_marker,
        })
    }
}

// ---------------------------------------------------------------------------
// Archive / analytics payloads
// ---------------------------------------------------------------------------

/// Filters for `GET /api/matches/archive`. Unset fields are not sent.
#[derive(Debug, Clone, Default)]
pub struct ArchiveQuery {
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub tournament: Option<String>,
    pub team: Option<String>,
}

impl ArchiveQuery {
    fn pairs(&self) -> Vec<(&'static str, &str)> {
        [
            ("date_from", &self.date_from),
            ("date_to", &self.date_to),
            ("tournament", &self.tournament),
            ("team", &self.team),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.as_deref().filter(|s| !s.is_empty()).map(|s| (k, s)))
        .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArchiveMatch {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub teams: String,
    #[serde(default)]
    pub tournament: String,
    #[serde(default)]
    pub finished_date: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub final_score: Option<String>,
    #[serde(default)]
    pub final_points: Option<f64>,
    #[serde(default)]
    pub final_total: Option<f64>,
    #[serde(default)]
    pub initial_total: Option<f64>,
    #[serde(default)]
    pub bet_total: Option<f64>,
    #[serde(default)]
    pub bet_result: Option<String>,
    #[serde(default)]
    pub triggered_at: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArchiveStats {
    #[serde(default)]
    pub total_matches: Option<u64>,
    #[serde(default)]
    pub over_percentage: Option<f64>,
    #[serde(default)]
    pub under_percentage: Option<f64>,
    #[serde(default)]
    pub avg_deviation: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArchiveResponse {
    #[serde(default)]
    pub matches: Vec<ArchiveMatch>,
    #[serde(default)]
    pub stats: ArchiveStats,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyticsStats {
    #[serde(default)]
    pub total_bets: u64,
    #[serde(default)]
    pub wins: u64,
    #[serde(default)]
    pub losses: u64,
    #[serde(default)]
    pub win_rate: f64,
    #[serde(default)]
    pub avg_total_diff: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BetRecord {
    #[serde(default)]
    pub match_id: Value,
    #[serde(default)]
    pub teams: String,
    #[serde(default)]
    pub tournament: String,
    #[serde(default)]
    pub bet_total: Option<f64>,
    #[serde(default)]
    pub triggered_at: Option<String>,
    #[serde(default)]
    pub bet_result: Option<String>,
    #[serde(default)]
    pub final_score: Option<String>,
    #[serde(default)]
    pub final_points: Option<f64>,
    #[serde(default)]
    pub initial_total: Option<f64>,
    #[serde(default)]
    pub total_diff: Option<f64>,
    #[serde(default)]
    pub total_diff_percent: Option<f64>,
    #[serde(default)]
    pub initial_final_diff: Option<f64>,
    #[serde(default)]
    pub initial_final_diff_percent: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyticsConfig {
    #[serde(default)]
    pub trigger_percent: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyticsHistory {
    #[serde(default)]
    pub history: Vec<BetRecord>,
    #[serde(default)]
    pub config: AnalyticsConfig,
}

#[derive(Debug, Deserialize)]
struct RescanResponse {
    #[serde(default)]
    message: Option<String>,
}

// ---------------------------------------------------------------------------
// ApiClient
// ---------------------------------------------------------------------------

/// REST client for every backend endpoint the engine consumes. All calls share one
/// connection pool and the configured timeout.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    default_regulation_minutes: u32,
}

impl ApiClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.http_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: cfg.api_base_url.clone(),
            default_regulation_minutes: cfg.regulation_minutes,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Live matches table, decoded row by row.
    pub async fn fetch_matches(&self) -> Result<DecodedBatch> {
        let payload: MatchesPayload = self
            .client
            .get(self.url("/api/matches"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(decode_rows(payload.matches, self.default_regulation_minutes))
    }

    /// `/api/matches/{id}/chart` with the id encoded as a single path segment.
    pub fn chart_request(&self, match_id: &str) -> Result<reqwest::Request> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| AppError::Config(format!("bad API base url {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| AppError::Config(format!("API base url {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend(["api", "matches", match_id, "chart"]);
        Ok(self.client.get(url).build()?)
    }

    /// Chart history for one match. `None` when the backend doesn't know the match yet.
    pub async fn fetch_chart(&self, match_id: &str) -> Result<Option<ChartPayload>> {
        let resp = self.client.execute(self.chart_request(match_id)?).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!(match_id, "[HISTORY] chart 404, treating as new match");
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(AppError::Api(format!("chart request returned {}", resp.status())));
        }
        Ok(Some(resp.json().await?))
    }

    pub fn archive_request(&self, query: &ArchiveQuery) -> Result<reqwest::Request> {
        Ok(self.client.get(self.url("/api/matches/archive")).query(&query.pairs()).build()?)
    }

    pub async fn fetch_archive(&self, query: &ArchiveQuery) -> Result<ArchiveResponse> {
        let req = self.archive_request(query)?;
        Ok(self.client.execute(req).await?.error_for_status()?.json().await?)
    }

    pub async fn fetch_analytics_stats(&self) -> Result<AnalyticsStats> {
        Ok(self
            .client
            .get(self.url("/api/analytics/stats"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    pub async fn fetch_analytics_history(&self, limit: u32) -> Result<AnalyticsHistory> {
        Ok(self
            .client
            .get(self.url("/api/analytics/history"))
            .query(&[("limit", limit)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    /// Ask the backend to re-evaluate finished matches. Returns its message.
    pub async fn trigger_rescan(&self) -> Result<String> {
        let resp: RescanResponse = self
            .client
            .post(self.url("/api/analytics/rescan"))
            .json(&serde_json::json!({}))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let message = resp.message.unwrap_or_else(|| "done".to_string());
        info!("[API] rescan: {message}");
        Ok(message)
    }
}

#[async_trait]
impl MatchFeed for ApiClient {
    async fn fetch_matches(&self) -> Result<DecodedBatch> {
        ApiClient::fetch_matches(self).await
    }
}

#[async_trait]
impl HistorySource for ApiClient {
    async fn fetch_history(&self, match_id: &str) -> Result<MatchHistory> {
        match self.fetch_chart(match_id).await {
            Ok(Some(chart)) => chart.into_history(match_id),
            Ok(None) => Ok(MatchHistory::default()),
            Err(e) => {
                warn!(match_id, "[HISTORY] chart fetch failed: {e}");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Score;

    fn client() -> ApiClient {
        let cfg = Config {
            api_base_url: "http://backend.test".to_string(),
            ws_url: "ws://backend.test/ws".to_string(),
            log_level: "info".to_string(),
            http_timeout_secs: 5,
            ws_connect_timeout_secs: 5,
            reconnect_delay_ms: 100,
            poll_interval_secs: 5,
            regulation_minutes: 40,
            open_match_id: None,
        };
        ApiClient::new(&cfg).unwrap()
    }

    #[test]
    fn chart_becomes_history() {
        let raw = r#"{
            "timestamps": ["00:45", "05:30", "-", "10:00"],
            "scores": ["2:0", "12:9", "-", "22:20"],
            "total_points": [2, 21, null, 42],
            "total_values": [160.5, 0, 0, null],
            "pace_data": [null, 152.7, null, 168.0],
            "period_lines": [10, 20, 30, 40],
            "bet_timestamp": "05:30",
            "bet_total": 158.5,
            "total_match_time": 40,
            "initial_total": 161.0
        }"#;
        let chart: ChartPayload = serde_json::from_str(raw).unwrap();
        let history = chart.into_history("55").unwrap();

        assert_eq!(history.snapshots.len(), 3);
        let first = &history.snapshots[0];
        assert_eq!(first.match_id, "55");
        assert_eq!(first.timestamp, 0.75);
        assert_eq!(first.total_value, Some(160.5));
        assert_eq!(history.snapshots[1].total_value, None);
        assert_eq!(history.snapshots[2].score, Some(Score::new(22, 20)));
        assert_eq!(history.regulation_minutes, Some(40));
        assert_eq!(history.initial_total, Some(161.0));
        assert_eq!(history.period_markers, Some(vec![10.0, 20.0, 30.0, 40.0]));
        assert_eq!(history.bet_marker, Some(BetMarker { timestamp: 5.5, total_value: 158.5 }));
    }

    #[test]
    fn empty_chart_is_valid_empty_history() {
        let chart: ChartPayload =
            serde_json::from_str(r#"{"timestamps":[],"total_points":[],"total_values":[],"pace_data":[],"scores":[]}"#)
                .unwrap();
        let history = chart.into_history("1").unwrap();
        assert!(history.snapshots.is_empty());
        assert_eq!(history.regulation_minutes, None);
    }

    #[test]
    fn error_payload_is_a_failure() {
        let chart: ChartPayload = serde_json::from_str(r#"{"error":"loading failed"}"#).unwrap();
        assert!(matches!(chart.into_history("1"), Err(AppError::Api(_))));
    }

    #[test]
    fn chart_request_encodes_match_id_as_one_segment() {
        let api = client();
        let req = api.chart_request("55").unwrap();
        assert_eq!(req.url().as_str(), "http://backend.test/api/matches/55/chart");

        let req = api.chart_request("a/b?c").unwrap();
        assert_eq!(req.url().path(), "/api/matches/a%2Fb%3Fc/chart");
        assert_eq!(req.url().query(), None);
    }

    #[test]
    fn chart_points_past_the_clock_ceiling_are_skipped() {
        let chart: ChartPayload = serde_json::from_str(
            r#"{"timestamps":[5.0, 4294967295.0, "99999999:00"],"scores":["4294967295:1", "2:2", "3:3"]}"#,
        )
        .unwrap();
        let history = chart.into_history("1").unwrap();
        assert_eq!(history.snapshots.len(), 1);
        assert_eq!(history.snapshots[0].score, None);
        assert_eq!(history.snapshots[0].total_points, None);
    }

    #[test]
    fn archive_query_sends_only_set_fields_encoded() {
        let q = ArchiveQuery {
            date_from: Some("2024-01-01".to_string()),
            date_to: None,
            tournament: Some("China. CBA".to_string()),
            team: Some(String::new()),
        };
        let req = client().archive_request(&q).unwrap();
        let url = req.url().as_str();
        assert!(url.starts_with("http://backend.test/api/matches/archive?"));
        assert!(url.contains("date_from=2024-01-01"));
        assert!(url.contains("tournament=China.+CBA") || url.contains("tournament=China.%20CBA"));
        assert!(!url.contains("date_to"));
        assert!(!url.contains("team="));
    }

    #[test]
    fn analytics_payloads_tolerate_missing_fields() {
        let stats: AnalyticsStats =
            serde_json::from_str(r#"{"total_bets":12,"wins":8,"losses":4,"win_rate":66.7}"#).unwrap();
        assert_eq!(stats.total_bets, 12);
        assert_eq!(stats.avg_total_diff, 0.0);

        let history: AnalyticsHistory = serde_json::from_str(
            r#"{"history":[{"match_id":9,"teams":"A - B","bet_total":150.5,"bet_result":"WIN","final_points":141}],"config":{"trigger_percent":12}}"#,
        )
        .unwrap();
        assert_eq!(history.history.len(), 1);
        assert_eq!(history.history[0].final_points, Some(141.0));
        assert_eq!(history.config.trigger_percent, Some(12.0));

        let archive: ArchiveResponse = serde_json::from_str(r#"{"matches":[]}"#).unwrap();
        assert!(archive.matches.is_empty());
        assert_eq!(archive.stats.total_matches, None);
    }
}
