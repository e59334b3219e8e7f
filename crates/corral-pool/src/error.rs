//! Errors surfaced by pool management operations.
//!
//! Routing itself never returns these: `Pool::route` maps every failure
//! to an error `Response` so the frontend always has something to write
//! back. The `Result`-shaped surface is for the management operations
//! (resizing, suspending, interactive commands) whose callers can act on
//! the distinction.

use thiserror::Error;

pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    /// No instance became available within the routing wait budget.
    #[error("timed out waiting for an instance to become available")]
    RouteTimeout,

    /// The pool is quitting and no longer serving.
    #[error("pool is not serving requests")]
    Unavailable,

    #[error("pool is already suspended")]
    AlreadySuspended,

    #[error("pool is already resumed")]
    AlreadyResumed,

    /// The id does not name an instance this pool manages.
    #[error("invalid instance id: {0}")]
    InvalidInstanceId(String),

    /// The operation is not offered by this scaling variant.
    #[error("{0} is not supported by this scaling mode")]
    NotSupported(&'static str),

    /// The interactive instance was replaced while a command was running.
    #[error("instance was restarted while executing command")]
    InstanceRestarted,

    /// An interactive command failed; carries the merged status line and
    /// body text.
    #[error("command failed: {0}")]
    Command(String),

    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}
