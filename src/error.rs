use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Seeding the history of a freshly opened match failed outright ("chart unavailable").
    #[error("History unavailable for match {match_id}: {reason}")]
    HistoryUnavailable { match_id: String, reason: String },

    /// An open was cancelled or replaced by a newer one before it finished.
    #[error("Superseded: {0}")]
    Superseded(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// True for errors the reconnect/poll policy absorbs.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AppError::WebSocket(_) | AppError::Http(_) | AppError::Timeout(_) | AppError::Io(_)
        )
    }
}
