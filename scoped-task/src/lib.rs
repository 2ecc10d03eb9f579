//! A [`tokio::task::JoinHandle`] wrapper that aborts the task on drop.
//!
//! Every long-running task the mesh coordinator spawns (a neighbour's reader
//! loop, its ping timer, the listener loop) is owned by some struct whose
//! lifetime mirrors the task's usefulness. Wrapping the handle in
//! [`ScopedJoinHandle`] means dropping that struct is enough to cancel the
//! task — no separate shutdown signal needs to be threaded through.

use std::future::Future;
use tokio::task::JoinHandle;

/// Spawns `future` on the current tokio runtime and returns a handle that
/// aborts it when dropped.
pub fn spawn<F>(future: F) -> ScopedJoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    ScopedJoinHandle(tokio::task::spawn(future))
}

/// Wraps a [`JoinHandle`] so the task is aborted when the handle is dropped.
pub struct ScopedJoinHandle<T>(pub JoinHandle<T>);

impl<T> Drop for ScopedJoinHandle<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
