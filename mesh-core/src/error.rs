//! Error kinds surfaced by the mesh core.
//!
//! These map 1:1 onto the error kinds named in the design: most are soft
//! (logged and counted, not propagated) while a few abort the affected
//! operation or the whole coordinator. See [`crate::stats`] for the
//! counters that back the silently-dropped kinds.

use crate::identity::DeviceId;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport refused the operation: {0}")]
    PermissionDenied(String),

    #[error("no route to {0}")]
    Unreachable(DeviceId),

    #[error("operation timed out")]
    Timeout,

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("duplicate message {0}")]
    Duplicate(String),

    #[error("no direct neighbour available")]
    NotConnected,

    #[error("link quality degraded below Fair for {0}")]
    Degraded(DeviceId),

    #[error("fatal invariant violation: {0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
