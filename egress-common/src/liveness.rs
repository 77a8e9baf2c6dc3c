//! Worker liveness tracking
//!
//! The dequeue loop beats once before each message it hands to the
//! processing callback. A supervisor holding a clone of the same tracker
//! reads [`Liveness::last_beat`] to decide whether the worker has stalled.

use std::sync::{
    Arc,
    atomic::{AtomicI64, AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};

/// Shared heartbeat counter
#[derive(Debug, Clone, Default)]
pub struct Liveness {
    beats: Arc<AtomicU64>,
    /// Milliseconds since the unix epoch of the last beat, 0 if never
    last_beat_ms: Arc<AtomicI64>,
}

impl Liveness {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the worker is about to start another unit of work.
    pub fn work_completed(&self) {
        self.beats.fetch_add(1, Ordering::Relaxed);
        self.last_beat_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Total number of beats recorded since creation
    #[must_use]
    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }

    /// When the worker last reported progress
    #[must_use]
    pub fn last_beat(&self) -> Option<DateTime<Utc>> {
        match self.last_beat_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }
}
