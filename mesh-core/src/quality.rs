//! Quality monitor (component C7): per-neighbour RTT ring buffer, ping/pong
//! bookkeeping, and the derived quality level.

use crate::config::QUALITY_SAMPLE_WINDOW;
use crate::error::{Error, Result};
use crate::identity::DeviceId;
use crate::message::{Message, MessageKind};
use std::collections::VecDeque;
use std::time::Duration;

/// Builds the `Ping` or `Pong` message carrying `sequence` — the sequence
/// number rides the message id, since neither frame needs one of its own
/// (§4.7).
pub fn sequenced_message(kind: MessageKind, local_id: &DeviceId, sequence: u64, timestamp_ms: i64) -> Message {
    debug_assert!(matches!(kind, MessageKind::Ping | MessageKind::Pong));
    Message::originate(
        sequence.to_string(),
        String::new(),
        local_id.clone(),
        None,
        kind,
        Vec::new(),
        None,
        None,
        timestamp_ms,
    )
}

/// Recovers the sequence number stamped by [`sequenced_message`].
pub fn sequence_of(msg: &Message) -> Result<u64> {
    msg.message_id
        .parse()
        .map_err(|_| Error::Malformed(format!("non-numeric ping/pong sequence {:?}", msg.message_id)))
}

/// Link quality bucket, ordered worst-to-best so `quality < QualityLevel::Good`
/// reads naturally (§4.7, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QualityLevel {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityLevel {
    /// Classifies an average RTT and loss ratio per the thresholds table
    /// (§4.7), each inclusive on its upper bound.
    pub fn classify(avg_rtt: Duration, loss_ratio: f64) -> Self {
        if avg_rtt <= Duration::from_millis(80) && loss_ratio <= 0.01 {
            QualityLevel::Excellent
        } else if avg_rtt <= Duration::from_millis(200) && loss_ratio <= 0.05 {
            QualityLevel::Good
        } else if avg_rtt <= Duration::from_millis(500) && loss_ratio <= 0.15 {
            QualityLevel::Fair
        } else {
            QualityLevel::Poor
        }
    }
}

/// Tracks RTT samples and ping/pong accounting for one direct neighbour.
pub struct QualityTracker {
    samples: VecDeque<Duration>,
    capacity: usize,
    sent: u64,
    lost: u64,
    consecutive_losses: u32,
    last_level: QualityLevel,
    next_sequence: u64,
    pending: std::collections::HashMap<u64, tokio::time::Instant>,
}

impl QualityTracker {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(QUALITY_SAMPLE_WINDOW),
            capacity: QUALITY_SAMPLE_WINDOW,
            sent: 0,
            lost: 0,
            consecutive_losses: 0,
            last_level: QualityLevel::Excellent,
            next_sequence: 0,
            pending: std::collections::HashMap::new(),
        }
    }

    /// Records that a `Ping{sequence}` was just sent, returning the sequence
    /// number to stamp on the outbound frame.
    pub fn record_ping_sent(&mut self, now: tokio::time::Instant) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.sent += 1;
        self.pending.insert(sequence, now);
        sequence
    }

    /// Records a `Pong{sequence}` echo, computing RTT against the send-time
    /// table. Returns `None` if the sequence is unknown (duplicate or
    /// already timed out).
    pub fn record_pong(&mut self, sequence: u64, now: tokio::time::Instant) -> Option<Duration> {
        let sent_at = self.pending.remove(&sequence)?;
        let rtt = now.saturating_duration_since(sent_at);

        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt);
        self.consecutive_losses = 0;
        Some(rtt)
    }

    /// Sweeps pending pings older than `ping_timeout`, counting each as a
    /// lost packet. Returns how many consecutive losses have now piled up
    /// (the caller raises `quality_degraded` at 3).
    pub fn sweep_timeouts(&mut self, ping_timeout: Duration, now: tokio::time::Instant) -> u32 {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, sent_at)| now.saturating_duration_since(**sent_at) > ping_timeout)
            .map(|(seq, _)| *seq)
            .collect();

        for seq in expired {
            self.pending.remove(&seq);
            self.lost += 1;
            self.consecutive_losses += 1;
        }

        self.consecutive_losses
    }

    pub fn average_rtt(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().sum();
        total / self.samples.len() as u32
    }

    pub fn loss_ratio(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.lost as f64 / self.sent as f64
        }
    }

    pub fn level(&self) -> QualityLevel {
        QualityLevel::classify(self.average_rtt(), self.loss_ratio())
    }

    /// Returns `true` iff the level has just transitioned from ≥ Good to <
    /// Good, or three pings have been lost in a row — the two triggers for
    /// `quality_degraded` (§4.7). Updates the tracker's notion of "last
    /// level" as a side effect, so call this exactly once per observation.
    pub fn check_degraded(&mut self) -> bool {
        let current = self.level();
        let transitioned_down = self.last_level >= QualityLevel::Good && current < QualityLevel::Good;
        self.last_level = current;
        transitioned_down || self.consecutive_losses >= 3
    }
}

impl Default for QualityTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_thresholds_inclusive() {
        assert_eq!(
            QualityLevel::classify(Duration::from_millis(80), 0.01),
            QualityLevel::Excellent
        );
        assert_eq!(
            QualityLevel::classify(Duration::from_millis(81), 0.0),
            QualityLevel::Good
        );
        assert_eq!(
            QualityLevel::classify(Duration::from_millis(500), 0.15),
            QualityLevel::Fair
        );
        assert_eq!(
            QualityLevel::classify(Duration::from_millis(501), 0.0),
            QualityLevel::Poor
        );
        assert_eq!(
            QualityLevel::classify(Duration::from_millis(10), 0.16),
            QualityLevel::Poor
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rtt_ring_buffer_tracks_average_and_evicts_oldest() {
        let mut tracker = QualityTracker::new();
        for _ in 0..QUALITY_SAMPLE_WINDOW {
            let seq = tracker.record_ping_sent(tokio::time::Instant::now());
            tokio::time::advance(Duration::from_millis(100)).await;
            tracker.record_pong(seq, tokio::time::Instant::now());
        }
        assert_eq!(tracker.average_rtt(), Duration::from_millis(100));

        // One more sample pushes out the oldest; average stays the same
        // since every sample is identical here, but length is capped.
        let seq = tracker.record_ping_sent(tokio::time::Instant::now());
        tokio::time::advance(Duration::from_millis(100)).await;
        tracker.record_pong(seq, tokio::time::Instant::now());
        assert_eq!(tracker.average_rtt(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn three_consecutive_losses_trigger_degraded() {
        let mut tracker = QualityTracker::new();
        for _ in 0..3 {
            tracker.record_ping_sent(tokio::time::Instant::now());
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        let losses = tracker.sweep_timeouts(Duration::from_secs(3), tokio::time::Instant::now());
        assert_eq!(losses, 3);
        assert!(tracker.check_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn good_to_fair_transition_is_flagged_once() {
        let mut tracker = QualityTracker::new();
        // Seed a Good baseline.
        for _ in 0..QUALITY_SAMPLE_WINDOW {
            let seq = tracker.record_ping_sent(tokio::time::Instant::now());
            tokio::time::advance(Duration::from_millis(150)).await;
            tracker.record_pong(seq, tokio::time::Instant::now());
        }
        assert!(!tracker.check_degraded()); // already Good from the start, no transition yet recorded as "last"

        // Now degrade to Fair.
        for _ in 0..QUALITY_SAMPLE_WINDOW {
            let seq = tracker.record_ping_sent(tokio::time::Instant::now());
            tokio::time::advance(Duration::from_millis(400)).await;
            tracker.record_pong(seq, tokio::time::Instant::now());
        }
        assert!(tracker.check_degraded());
        assert!(!tracker.check_degraded()); // second observation at the same level: no new transition
    }
}
