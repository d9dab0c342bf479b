use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::time::{interval, sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{WS_PING_INTERVAL_SECS, WS_SILENCE_TIMEOUT_SECS};
use crate::error::{AppError, Result};
use crate::reconciler::LiveFeedReconciler;
use crate::types::{ConnectionState, FeedOrigin};
use crate::ws::messages::{parse_ws_frame, ParsedFrame};

/// Owns the push-channel connection: connect, read frames into the reconciler,
/// and reconnect on a fixed delay until shutdown.
pub struct WsManager {
    ws_url: String,
    reconciler: Arc<LiveFeedReconciler>,
    connect_timeout: Duration,
    reconnect_delay: Duration,
    default_regulation_minutes: u32,
    shutdown: CancellationToken,
}

impl WsManager {
    pub fn new(
        ws_url: String,
        reconciler: Arc<LiveFeedReconciler>,
        connect_timeout: Duration,
        reconnect_delay: Duration,
        default_regulation_minutes: u32,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ws_url,
            reconciler,
            connect_timeout,
            reconnect_delay,
            default_regulation_minutes,
            shutdown,
        }
    }

    pub async fn run(self) {
        let health = Arc::clone(self.reconciler.health());
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            health.set_state(ConnectionState::Connecting);
            info!("[WS] connecting to {}", self.ws_url);
            match self.connect_once().await {
                Ok(()) => info!("[WS] connection closed"),
                Err(e) if e.is_transport() => warn!("[WS] connection lost: {e}"),
                Err(e) => error!("[WS] connection error: {e}"),
            }
            if self.shutdown.is_cancelled() {
                break;
            }
            health.set_state(ConnectionState::Disconnected);

            let delay_ms = self.reconnect_delay.as_millis();
            warn!("[WS] reconnecting in {delay_ms}ms");
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = sleep(self.reconnect_delay) => {}
            }
        }
        health.set_state(ConnectionState::Shutdown);
        info!("[WS] stopped");
    }

    async fn connect_once(&self) -> Result<()> {
        let connect = timeout(self.connect_timeout, connect_async(self.ws_url.as_str()));
        let attempt = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Ok(()),
            r = connect => r,
        };
        let (ws_stream, _) = match attempt {
            Ok(r) => r?,
            Err(_) => {
                return Err(AppError::Timeout(format!(
                    "connect to {} after {}s",
                    self.ws_url,
                    self.connect_timeout.as_secs()
                )))
            }
        };
        let (mut write, mut read) = ws_stream.split();
        self.reconciler.health().set_state(ConnectionState::Connected);
        info!("[WS] connected to {}", self.ws_url);

        let silence = Duration::from_secs(WS_SILENCE_TIMEOUT_SECS);
        let mut last_frame = Instant::now();
        let mut ping_interval = interval(Duration::from_secs(WS_PING_INTERVAL_SECS));
        ping_interval.tick().await; // consume immediate first tick

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }

                msg = read.next() => {
                    last_frame = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => {}
                    }
                }

                _ = sleep_until(last_frame + silence) => {
                    return Err(AppError::Timeout(format!(
                        "no frames for {}s",
                        WS_SILENCE_TIMEOUT_SECS
                    )));
                }

                _ = ping_interval.tick() => {
                    debug!("[WS] ping");
                    write.send(Message::Ping(vec![].into())).await?;
                }
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        let health = self.reconciler.health();
        match parse_ws_frame(text, self.default_regulation_minutes) {
            ParsedFrame::TableUpdate(batch) => {
                health.inc_frames();
                health.add_malformed(batch.malformed as u64);
                let frames = health.snapshot().frames;
                let report = self.reconciler.ingest(batch.snapshots, FeedOrigin::Push);
                if frames % 100 == 0 {
                    info!(
                        frames,
                        accepted = report.accepted,
                        series = self.reconciler.store().series_count(),
                        "[WS] {frames} table updates | series={}",
                        self.reconciler.store().series_count()
                    );
                }
            }
            ParsedFrame::Other(kind) => {
                health.inc_ignored_frames();
                debug!("[WS] ignored {kind} frame");
            }
            ParsedFrame::Unrecognized => health.add_malformed(1),
        }
    }
}
