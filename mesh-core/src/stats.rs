//! Observability counters (ambient). Formalizes the drop counters §7 asks
//! for into a small snapshot-able struct the external UI layer can poll,
//! rather than scattering raw `AtomicU64`s through the router and socket
//! modules.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Stats {
    frames_dropped_duplicate: AtomicU64,
    frames_dropped_malformed: AtomicU64,
    frames_relayed: AtomicU64,
    frames_delivered_local: AtomicU64,
}

/// Point-in-time copy of every counter, cheap to clone and send to the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_dropped_duplicate: u64,
    pub frames_dropped_malformed: u64,
    pub frames_relayed: u64,
    pub frames_delivered_local: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_duplicate(&self) {
        self.frames_dropped_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.frames_dropped_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relayed(&self) {
        self.frames_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered_local(&self) {
        self.frames_delivered_local.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_dropped_duplicate: self.frames_dropped_duplicate.load(Ordering::Relaxed),
            frames_dropped_malformed: self.frames_dropped_malformed.load(Ordering::Relaxed),
            frames_relayed: self.frames_relayed.load(Ordering::Relaxed),
            frames_delivered_local: self.frames_delivered_local.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counts() {
        let stats = Stats::new();
        stats.record_duplicate();
        stats.record_duplicate();
        stats.record_relayed();

        let snap = stats.snapshot();
        assert_eq!(snap.frames_dropped_duplicate, 2);
        assert_eq!(snap.frames_relayed, 1);
        assert_eq!(snap.frames_delivered_local, 0);
    }
}
