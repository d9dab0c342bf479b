use crate::error::{AppError, Result};

pub const API_BASE_URL: &str = "http://localhost:8000";
pub const WS_URL: &str = "ws://localhost:8000/ws";

/// Fallback regulation length (minutes) when neither the feed nor the tournament name tells us.
pub const DEFAULT_REGULATION_MINUTES: u32 = 40;

/// Heartbeat ping interval (seconds).
pub const WS_PING_INTERVAL_SECS: u64 = 30;

/// The backend pushes a table_update every ~3s. Nothing for this long means the socket is dead.
pub const WS_SILENCE_TIMEOUT_SECS: u64 = 15;

/// Constant reconnect delay. The dashboard retried on a flat 5s timer, not a backoff ladder.
pub const RECONNECT_DELAY_MS: u64 = 5_000;

/// Channel capacity for view events.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Polling fallback interval (seconds). Only polls while the push channel is down.
pub const POLL_INTERVAL_SECS: u64 = 5;

/// Periodic diagnostics log interval (seconds).
pub const DIAG_INTERVAL_SECS: u64 = 30;

/// Absolute difference a headline metric must exceed to count as a material change.
pub const MATERIAL_CHANGE_EPSILON: f64 = 0.1;

/// Latest match clock accepted from any source, in minutes. Covers regulation plus overtimes.
pub const MAX_MATCH_MINUTES: u32 = 120;

/// Extra minutes of per-minute rate past the last observation, so the axis doesn't end abruptly.
pub const RATE_LOOKAHEAD_MINUTES: u32 = 2;

/// Heat-map bar scaling.
pub mod heatmap {
    /// Bar height per point scored in the minute.
    pub const HEIGHT_PER_POINT: f64 = 10.0;
    /// Visual cap on bar height.
    pub const MAX_HEIGHT: f64 = 150.0;

    /// Upper bounds (inclusive) of tiers 1-3; anything above `TIER3_MAX` is tier 4.
    pub const TIER1_MAX: u32 = 2;
    pub const TIER2_MAX: u32 = 4;
    pub const TIER3_MAX: u32 = 6;
}

/// Tournament name fragments that imply a 4x12 (48 minute) format.
const FORMAT_48_TOURNAMENTS: &[&str] = &["NBA", "CDBL", "WCBA", "PBA", "PRIME DIVISION"];

#[derive(Debug, Clone)]
pub struct Config {
    pub api_base_url: String,
    pub ws_url: String,
    pub log_level: String,
    /// Timeout for every REST call (HTTP_TIMEOUT_SECS)
    pub http_timeout_secs: u64,
    /// Timeout for a single WS connect attempt (WS_CONNECT_TIMEOUT_SECS)
    pub ws_connect_timeout_secs: u64,
    /// Fixed delay between reconnect attempts (RECONNECT_DELAY_MS)
    pub reconnect_delay_ms: u64,
    /// Polling fallback interval (POLL_INTERVAL_SECS)
    pub poll_interval_secs: u64,
    /// Regulation length used when a match doesn't carry one (REGULATION_MINUTES)
    pub regulation_minutes: u32,
    /// Match to open for detailed viewing at startup (OPEN_MATCH_ID)
    pub open_match_id: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let regulation_minutes = std::env::var("REGULATION_MINUTES")
            .unwrap_or_else(|_| DEFAULT_REGULATION_MINUTES.to_string())
            .parse::<u32>()
            .ok()
            .filter(|m| *m > 0)
            .ok_or_else(|| {
                AppError::Config("REGULATION_MINUTES must be a positive integer".to_string())
            })?;

        Ok(Self {
            api_base_url: std::env::var("API_BASE_URL")
                .unwrap_or_else(|_| API_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            ws_url: std::env::var("WS_URL").unwrap_or_else(|_| WS_URL.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            http_timeout_secs: std::env::var("HTTP_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse::<u64>()
                .unwrap_or(10),
            ws_connect_timeout_secs: std::env::var("WS_CONNECT_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse::<u64>()
                .unwrap_or(10),
            reconnect_delay_ms: std::env::var("RECONNECT_DELAY_MS")
                .unwrap_or_else(|_| RECONNECT_DELAY_MS.to_string())
                .parse::<u64>()
                .unwrap_or(RECONNECT_DELAY_MS),
            poll_interval_secs: std::env::var("POLL_INTERVAL_SECS")
                .unwrap_or_else(|_| POLL_INTERVAL_SECS.to_string())
                .parse::<u64>()
                .unwrap_or(POLL_INTERVAL_SECS),
            regulation_minutes,
            open_match_id: std::env::var("OPEN_MATCH_ID")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        })
    }
}

/// Regulation length for a tournament, by name.
/// "2x10" anywhere in the label wins; known 4x12 leagues are 48; everything else gets `default`.
pub fn regulation_minutes_for_tournament(tournament: &str, default: u32) -> u32 {
    let upper = tournament.to_uppercase();
    if upper.contains("2X10") {
        return 20;
    }
    // "WNBA" contains "NBA" but plays 4x10.
    if upper.contains("WNBA") {
        return 40;
    }
    if FORMAT_48_TOURNAMENTS.iter().any(|t| upper.contains(t)) {
        return 48;
    }
    default
}

/// Period boundaries used when the feed doesn't supply any.
pub fn default_period_markers(regulation_minutes: u32) -> Vec<f64> {
    match regulation_minutes {
        48 => vec![12.0, 24.0, 36.0, 48.0],
        20 => vec![10.0, 20.0],
        _ => vec![10.0, 20.0, 30.0, 40.0],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nba_style_leagues_are_48_minutes() {
        assert_eq!(regulation_minutes_for_tournament("USA. NBA", 40), 48);
        assert_eq!(regulation_minutes_for_tournament("China. CDBL", 40), 48);
        assert_eq!(regulation_minutes_for_tournament("Philippines. Prime Division", 40), 48);
    }

    #[test]
    fn wnba_is_not_nba() {
        assert_eq!(regulation_minutes_for_tournament("USA. WNBA", 48), 40);
    }

    #[test]
    fn two_by_ten_beats_league_name() {
        assert_eq!(regulation_minutes_for_tournament("NBA Summer League 2x10", 40), 20);
    }

    #[test]
    fn unknown_tournament_uses_default() {
        assert_eq!(regulation_minutes_for_tournament("Euroleague", 40), 40);
        assert_eq!(regulation_minutes_for_tournament("", 36), 36);
    }

    #[test]
    fn default_markers_follow_format() {
        assert_eq!(default_period_markers(48), vec![12.0, 24.0, 36.0, 48.0]);
        assert_eq!(default_period_markers(40), vec![10.0, 20.0, 30.0, 40.0]);
        assert_eq!(default_period_markers(20), vec![10.0, 20.0]);
    }
}
