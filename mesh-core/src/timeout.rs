//! Timeout manager (component C9): bounded-duration wrappers around the
//! long-running operations the coordinator drives. Built on
//! `tokio::time::timeout`, which already gives cooperative cancellation for
//! free — dropping the wrapped future on expiry runs its drop glue, so any
//! socket or lock held inside is released rather than left half-committed.

use crate::config::TimeoutProfile;
use crate::error::{Error, Result};
use std::future::Future;
use tokio::time::timeout;

/// Which of [`TimeoutProfile`]'s four bounds applies to an operation.
#[derive(Debug, Clone, Copy)]
pub enum Operation {
    Discovery,
    Connect,
    Ack,
    Ping,
}

/// Runs `fut` under the bound from `profile` matching `op`, mapping
/// expiry to [`Error::Timeout`]. The future's own `Result` is passed
/// through unchanged on completion within the bound.
pub async fn bounded<F, T>(op: Operation, profile: &TimeoutProfile, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let bound = match op {
        Operation::Discovery => profile.discovery,
        Operation::Connect => profile.connect,
        Operation::Ack => profile.ack,
        Operation::Ping => profile.ping,
    };

    match timeout(bound, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout),
    }
}
