pub mod health;
pub mod latency;
