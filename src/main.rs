use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use live_match_sync::config::{Config, CHANNEL_CAPACITY, DIAG_INTERVAL_SECS};
use live_match_sync::error::{AppError, Result};
use live_match_sync::fetcher::ApiClient;
use live_match_sync::poller::Poller;
use live_match_sync::reconciler::LiveFeedReconciler;
use live_match_sync::state::active_view::ActiveViewTracker;
use live_match_sync::state::series_store::TimeSeriesStore;
use live_match_sync::telemetry::health::FeedHealth;
use live_match_sync::telemetry::latency::LatencyStats;
use live_match_sync::types::{DerivedView, ViewEvent};
use live_match_sync::ws::connection::WsManager;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    let shutdown = CancellationToken::new();

    // --- Shared state ---
    let store = TimeSeriesStore::new();
    let health = Arc::new(FeedHealth::new());
    let latency = Arc::new(LatencyStats::new());
    let api = ApiClient::new(&cfg)?;

    let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let view = ActiveViewTracker::new(
        Arc::clone(&store),
        Arc::new(api.clone()),
        event_tx,
        Arc::clone(&latency),
        cfg.regulation_minutes,
        shutdown.clone(),
    );
    let reconciler =
        LiveFeedReconciler::new(Arc::clone(&store), Arc::clone(&view), Arc::clone(&health));

    let consumer = tokio::spawn(view_consumer(event_rx, shutdown.clone()));

    // --- Initial table load ---
    let poller = Poller::new(
        Arc::new(api.clone()),
        Arc::clone(&reconciler),
        Duration::from_secs(cfg.poll_interval_secs),
        shutdown.clone(),
    );
    match poller.refresh().await {
        Ok(report) => info!(
            accepted = report.accepted,
            series = store.series_count(),
            "Initial load: {} snapshots across {} matches",
            report.accepted,
            store.series_count()
        ),
        Err(e) => warn!("Initial table load failed, waiting for push channel: {e}"),
    }

    // Analytics summary (one-shot, never fatal)
    let analytics_api = api.clone();
    tokio::spawn(async move { log_analytics_summary(&analytics_api).await });

    // --- Background tasks ---
    let ws_manager = WsManager::new(
        cfg.ws_url.clone(),
        Arc::clone(&reconciler),
        Duration::from_secs(cfg.ws_connect_timeout_secs),
        Duration::from_millis(cfg.reconnect_delay_ms),
        cfg.regulation_minutes,
        shutdown.clone(),
    );
    let ws_handle = tokio::spawn(async move { ws_manager.run().await });
    let poll_handle = tokio::spawn(async move { poller.run().await });
    let diag_handle = tokio::spawn(diagnostics_loop(
        Arc::clone(&health),
        Arc::clone(&latency),
        Arc::clone(&store),
        Arc::clone(&view),
        shutdown.clone(),
    ));

    if let Some(match_id) = cfg.open_match_id.clone() {
        let view = Arc::clone(&view);
        tokio::spawn(async move {
            match view.open(&match_id).await {
                Ok(()) => info!(match_id = %match_id, "[VIEW] {match_id} open"),
                Err(AppError::Superseded(_)) => debug!("[VIEW] open of {match_id} superseded"),
                Err(e) => warn!("[VIEW] could not open {match_id}: {e}"),
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown.cancel();
    view.close();

    let _ = tokio::join!(ws_handle, poll_handle, diag_handle, consumer);
    info!(state = %health.state(), "Shutdown complete");
    Ok(())
}

/// Consumes view events: one structured log line per material change.
async fn view_consumer(mut rx: mpsc::Receiver<ViewEvent>, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            ev = rx.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };
        match event {
            ViewEvent::Changed { view, .. } => log_view(&view),
            ViewEvent::Unavailable { match_id, reason } => {
                warn!(
                    event = "CHART_UNAVAILABLE",
                    match_id = %match_id,
                    reason = %reason,
                    "CHART UNAVAILABLE | {match_id} | {reason}"
                );
            }
        }
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|x| format!("{x:.1}")).unwrap_or_else(|| "-".to_string())
}

fn log_view(v: &DerivedView) {
    let score = v.current_score.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
    let quarters = v
        .quarter_scores
        .iter()
        .map(|q| q.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    let hot_minutes = v.heatmap_buckets.iter().filter(|b| b.points > 0).count();

    info!(
        event = "VIEW_UPDATE",
        match_id = %v.match_id,
        revision = v.revision,
        snapshots = v.snapshot_count,
        score = %score,
        pace = v.pace,
        total = v.total_value,
        deviation_pct = v.total_deviation_pct,
        target_rate = v.target_line.map(|t| t.target_rate),
        actual_rate = v.actual_rate_per_minute,
        "VIEW | {} | score {score} | pace {} | total {} ({}%) | band {}..{} | quarters {quarters} | {hot_minutes} scoring minutes",
        v.match_id,
        fmt_opt(v.pace),
        fmt_opt(v.total_value),
        fmt_opt(v.total_deviation_pct),
        fmt_opt(v.min_total),
        fmt_opt(v.max_total),
    );
}

async fn log_analytics_summary(api: &ApiClient) {
    match api.fetch_analytics_stats().await {
        Ok(s) => info!(
            total_bets = s.total_bets,
            wins = s.wins,
            losses = s.losses,
            win_rate = s.win_rate,
            "[ANALYTICS] {} bets | {} win / {} lose | win rate {:.1}% | avg total diff {:.1}%",
            s.total_bets,
            s.wins,
            s.losses,
            s.win_rate,
            s.avg_total_diff,
        ),
        Err(e) => warn!("[ANALYTICS] stats unavailable: {e}"),
    }
}

async fn diagnostics_loop(
    health: Arc<FeedHealth>,
    latency: Arc<LatencyStats>,
    store: Arc<TimeSeriesStore>,
    view: Arc<ActiveViewTracker>,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(Duration::from_secs(DIAG_INTERVAL_SECS));
    ticker.tick().await; // consume immediate first tick

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let h = health.snapshot();
        let (p50, p95, p99) = latency
            .percentiles()
            .map(|p| (p.p50_us, p.p95_us, p.p99_us))
            .unwrap_or_default();
        let active_id = view.active_match();
        let clock = active_id
            .as_deref()
            .and_then(|id| store.latest(id))
            .map(|s| format!("{:.2}", s.timestamp))
            .unwrap_or_else(|| "-".to_string());
        let active = active_id.unwrap_or_else(|| "-".to_string());
        info!(
            state = %h.state,
            connects = h.connects,
            frames = h.frames,
            ignored = h.ignored_frames,
            merged = h.merged,
            duplicates = h.duplicates,
            rejected = h.rejected,
            malformed = h.malformed,
            polls = h.polls,
            series = store.series_count(),
            active = %active,
            clock = %clock,
            p50_us = p50,
            p95_us = p95,
            p99_us = p99,
            "[DIAG] {} | frames={} polls={} | merged={} dup={} rejected={} malformed={} | series={} | active={active} @ {clock} | recompute p50={p50}us p95={p95}us p99={p99}us",
            h.state,
            h.frames,
            h.polls,
            h.merged,
            h.duplicates,
            h.rejected,
            h.malformed,
            store.series_count(),
        );
    }
}
