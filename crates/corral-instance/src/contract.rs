//! Runtime-facing contracts: what a pool needs from the thing that runs
//! application code.

use crate::types::{InstanceId, Request, RequestKind, Response};
use async_trait::async_trait;
use corral_core::watcher::ChangeKind;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Why an instance could not serve a dispatched request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandleError {
    /// The instance is momentarily unable to take another request. The
    /// routers treat this as retryable.
    #[error("instance cannot accept requests")]
    CannotAccept,
    /// The connection to the instance failed mid-request.
    #[error("instance transport failed: {0}")]
    Transport(String),
}

/// A non-forced quit was declined because the instance is serving.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("instance is serving and declined to quit")]
pub struct QuitDeclined;

/// When file changes replace running instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Replace on every file change.
    Always,
    /// Replace only instances that have served at least one request.
    AfterFirstRequest,
    /// Never replace on file changes.
    Never,
}

/// One running copy of the application.
///
/// Implementations wrap whatever actually executes code, typically a
/// subprocess behind a local port. The accessors are cheap snapshots the
/// schedulers read while holding their own locks; the async methods may
/// block on the underlying runtime.
#[async_trait]
pub trait Instance: Send + Sync {
    fn id(&self) -> &InstanceId;

    /// True if a dispatch right now would be accepted.
    fn can_accept_requests(&self) -> bool;

    /// Concurrent request slots still free.
    fn remaining_capacity(&self) -> usize;

    /// Requests currently in flight.
    fn outstanding_requests(&self) -> usize;

    /// Requests served over the instance lifetime.
    fn total_requests(&self) -> u64;

    /// Time since the instance last served a request.
    fn idle_duration(&self) -> Duration;

    /// True once the instance has quit or failed to start.
    fn has_quit(&self) -> bool;

    /// Bring the underlying runtime up. Returns false if it failed.
    async fn start(&self) -> bool;

    /// Dispatch one request.
    async fn handle(&self, request: Request, kind: RequestKind) -> Result<Response, HandleError>;

    /// Ask the instance to quit. A non-forced quit may be declined while
    /// requests are in flight. `expect_shutdown` marks quits preceded by a
    /// stop signal, so the exit is not treated as a crash.
    async fn quit(&self, force: bool, expect_shutdown: bool) -> Result<(), QuitDeclined>;

    /// Wait until the instance can accept requests, has quit, or the
    /// deadline passes.
    async fn wait(&self, deadline: Instant);
}

/// Factory for instances plus the launch-time knobs the pools consult.
pub trait InstanceLauncher: Send + Sync {
    /// Create an unstarted instance. `expect_ready_request` tells the
    /// instance that a readiness request (start or warmup) will arrive
    /// before user traffic.
    fn new_instance(&self, id: InstanceId, expect_ready_request: bool) -> Arc<dyn Instance>;

    /// Concurrent requests a single instance is provisioned for.
    fn max_concurrent_requests(&self) -> usize;

    /// How file changes affect running instances.
    fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::Always
    }

    /// Called when watched application files changed, before any restart.
    fn files_changed(&self) {}

    /// Called when restart-relevant configuration changed, before any
    /// restart.
    fn configuration_changed(&self, changes: &BTreeSet<ChangeKind>) {
        let _ = changes;
    }
}
