//! Reconnection manager (component C8): exponential-backoff reconnect
//! attempts for a neighbour lost unexpectedly, built on the same
//! `ExponentialBackoffBuilder` the teacher uses for its own peer connect
//! loop (`network::mod::connect_with_retries`), but bounded by
//! `max_attempts` instead of running forever.

use crate::config::BackoffProfile;
use crate::identity::DeviceId;
use crate::quality::QualityLevel;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use std::time::Duration;

/// What last-known information a neighbour needs for a reconnect attempt to
/// even be worth scheduling (§4.8: only attempted if quality was ≥ Good).
#[derive(Debug, Clone)]
pub struct LostNeighbour {
    pub id: DeviceId,
    pub connect_descriptor: String,
    pub quality_at_loss: QualityLevel,
}

/// Outcome of driving one reconnection attempt loop to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Reconnected(DeviceId),
    GivenUp(DeviceId),
    /// Quality at loss was below Good; no attempt was scheduled at all.
    NotAttempted(DeviceId),
}

/// Drives backoff-scheduled reconnect attempts for one lost neighbour.
/// `connect` is the caller's actual connect operation (usually
/// `ConnectionCoordinator::connect_to`); it is retried per `profile`'s
/// schedule until it succeeds or `profile.max_attempts` is exhausted.
pub async fn reconnect_with_backoff<F, Fut>(
    lost: LostNeighbour,
    profile: BackoffProfile,
    mut connect: F,
) -> ReconnectOutcome
where
    F: FnMut(String) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    if lost.quality_at_loss < QualityLevel::Good {
        return ReconnectOutcome::NotAttempted(lost.id);
    }

    let initial = profile.delays[0];
    let mut backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(initial)
        .with_multiplier(2.0)
        .with_randomization_factor(0.0)
        .with_max_interval(*profile.delays.last().unwrap_or(&initial))
        .with_max_elapsed_time(None)
        .build();

    for _ in 0..profile.max_attempts {
        if connect(lost.connect_descriptor.clone()).await {
            return ReconnectOutcome::Reconnected(lost.id);
        }

        match backoff.next_backoff() {
            Some(delay) => tokio::time::sleep(delay).await,
            None => break,
        }
    }

    ReconnectOutcome::GivenUp(lost.id)
}

/// Computes the delay schedule a profile would actually produce, for tests
/// and diagnostics — avoids re-deriving the doubling by hand every time.
pub fn schedule(profile: &BackoffProfile) -> Vec<Duration> {
    profile.delays.to_vec()
}
