pub mod config;
pub mod error;
pub mod fetcher;
pub mod metrics;
pub mod poller;
pub mod reconciler;
pub mod state;
pub mod telemetry;
pub mod types;
pub mod ws;
