//! Tunable parameters for the mesh, collected in one place instead of
//! scattered literal constants. `MeshConfig::normal()` and
//! `MeshConfig::emergency()` give the two profiles the design calls for;
//! [`MeshConfig::emergency_mode`] flips between them at runtime the way a
//! real client would when the user triggers an SOS.

use std::time::Duration;

/// Hop budget a freshly originated message starts with.
pub const DEFAULT_TTL: u8 = 5;

/// Also the ceiling a [`crate::registry::Device::hop_count`] may report
/// before falling back to the "unknown" sentinel.
pub const MAX_TTL: u8 = DEFAULT_TTL;

/// Sentinel hop-count meaning "unknown".
pub const HOP_COUNT_UNKNOWN: u8 = 255;

/// Largest JSON frame accepted on the wire before it is dropped and logged.
pub const MAX_FRAME: usize = 64 * 1024;

/// Device entries not heard from within this window are evicted.
pub const STALE_WINDOW: Duration = Duration::from_secs(10 * 60);

/// How long a `message_id` is remembered in the dedup cache.
pub const MESSAGE_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Maximum number of entries the dedup cache holds before evicting the
/// oldest on insert.
pub const DEDUP_CAPACITY: usize = 1000;

/// Interval between registry staleness sweeps.
pub const REGISTRY_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Interval between dedup-cache sweeps.
pub const DEDUP_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Interval between group-owner roster heartbeats.
pub const ROSTER_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between per-neighbour pings.
pub const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Number of RTT samples kept per neighbour in the quality ring buffer.
pub const QUALITY_SAMPLE_WINDOW: usize = 16;

/// Default `max_age` used by [`crate::registry::MeshRegistry::reachable`].
pub const REACHABLE_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// Backoff schedule and cap for [`crate::reconnect::ReconnectionManager`].
#[derive(Debug, Clone, Copy)]
pub struct BackoffProfile {
    pub delays: [Duration; 5],
    pub max_attempts: u32,
}

pub const NORMAL_BACKOFF: BackoffProfile = BackoffProfile {
    delays: [
        Duration::from_secs(2),
        Duration::from_secs(4),
        Duration::from_secs(8),
        Duration::from_secs(16),
        Duration::from_secs(32),
    ],
    max_attempts: 5,
};

pub const EMERGENCY_BACKOFF: BackoffProfile = BackoffProfile {
    delays: [
        Duration::from_secs(1),
        Duration::from_secs(2),
        Duration::from_secs(4),
        Duration::from_secs(8),
        Duration::from_secs(16),
    ],
    max_attempts: 10,
};

/// Bounds applied by [`crate::timeout::TimeoutManager`].
#[derive(Debug, Clone, Copy)]
pub struct TimeoutProfile {
    pub discovery: Duration,
    pub connect: Duration,
    pub ack: Duration,
    pub ping: Duration,
}

pub const NORMAL_TIMEOUTS: TimeoutProfile = TimeoutProfile {
    discovery: Duration::from_secs(30),
    connect: Duration::from_secs(8),
    ack: Duration::from_secs(5),
    ping: Duration::from_secs(3),
};

pub const EMERGENCY_TIMEOUTS: TimeoutProfile = TimeoutProfile {
    discovery: Duration::from_secs(15),
    connect: Duration::from_secs(3),
    ack: Duration::from_secs(2),
    ping: Duration::from_secs(3),
};

/// All runtime-tunable parameters of a mesh node, bundled so the
/// coordinator and its subcomponents read from one source of truth.
#[derive(Debug, Clone, Copy)]
pub struct MeshConfig {
    pub emergency: bool,
    pub backoff: BackoffProfile,
    pub timeouts: TimeoutProfile,
    pub stale_window: Duration,
    pub message_expiry: Duration,
    pub dedup_capacity: usize,
}

impl MeshConfig {
    pub fn normal() -> Self {
        Self {
            emergency: false,
            backoff: NORMAL_BACKOFF,
            timeouts: NORMAL_TIMEOUTS,
            stale_window: STALE_WINDOW,
            message_expiry: MESSAGE_EXPIRY,
            dedup_capacity: DEDUP_CAPACITY,
        }
    }

    pub fn emergency() -> Self {
        Self {
            emergency: true,
            backoff: EMERGENCY_BACKOFF,
            timeouts: EMERGENCY_TIMEOUTS,
            ..Self::normal()
        }
    }

    /// Switch the tunables between the normal and emergency profiles while
    /// keeping any caller overrides to the non-profile fields.
    pub fn set_emergency_mode(&mut self, emergency: bool) {
        let profile = if emergency {
            Self::emergency()
        } else {
            Self::normal()
        };
        self.emergency = emergency;
        self.backoff = profile.backoff;
        self.timeouts = profile.timeouts;
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self::normal()
    }
}
