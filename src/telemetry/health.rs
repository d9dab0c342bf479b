//! Feed health: connection state plus ingest counters, shared across tasks.
//! Written by WsManager, Poller and the reconciler; read by the diagnostics loop.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::types::{ConnectionState, IngestReport};

#[derive(Default)]
pub struct FeedHealth {
    state: AtomicU8,
    /// Successful push-channel connects.
    connects: AtomicU64,
    /// table_update frames received.
    frames: AtomicU64,
    /// Frames of any other type.
    ignored_frames: AtomicU64,
    /// Rows or frames dropped at decode.
    malformed: AtomicU64,
    merged: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    polls: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub state: ConnectionState,
    pub connects: u64,
    pub frames: u64,
    pub ignored_frames: u64,
    pub malformed: u64,
    pub merged: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub polls: u64,
}

impl FeedHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Shutdown is terminal: later transitions are ignored.
    pub fn set_state(&self, next: ConnectionState) {
        let applied = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur != ConnectionState::Shutdown as u8).then_some(next as u8)
            })
            .is_ok();
        if applied && next == ConnectionState::Connected {
            self.connects.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn inc_frames(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ignored_frames(&self) {
        self.ignored_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_malformed(&self, n: u64) {
        self.malformed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_polls(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ingest(&self, report: &IngestReport) {
        self.merged.fetch_add(report.accepted as u64, Ordering::Relaxed);
        self.duplicates.fetch_add(report.duplicates as u64, Ordering::Relaxed);
        self.rejected.fetch_add(report.rejected as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            state: self.state(),
            connects: self.connects.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            ignored_frames: self.ignored_frames.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            merged: self.merged.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_disconnected() {
        assert_eq!(FeedHealth::new().state(), ConnectionState::Disconnected);
    }

    #[test]
    fn connect_cycle_counts_connects() {
        let h = FeedHealth::new();
        h.set_state(ConnectionState::Connecting);
        h.set_state(ConnectionState::Connected);
        assert!(h.is_connected());
        h.set_state(ConnectionState::Disconnected);
        h.set_state(ConnectionState::Connecting);
        h.set_state(ConnectionState::Connected);
        assert_eq!(h.snapshot().connects, 2);
    }

    #[test]
    fn shutdown_is_terminal() {
        let h = FeedHealth::new();
        h.set_state(ConnectionState::Shutdown);
        h.set_state(ConnectionState::Connecting);
        assert_eq!(h.state(), ConnectionState::Shutdown);
    }

    #[test]
    fn ingest_reports_accumulate() {
        let h = FeedHealth::new();
        h.record_ingest(&IngestReport { accepted: 3, duplicates: 1, rejected: 2, active_refreshed: false });
        h.record_ingest(&IngestReport { accepted: 1, ..Default::default() });
        let s = h.snapshot();
        assert_eq!((s.merged, s.duplicates, s.rejected), (4, 1, 2));
    }
}
