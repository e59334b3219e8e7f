//! Instance pools: scaling variants and request routing for corral.
//!
//! A pool owns the instances of one application module and decides when
//! to create, start, retire, and replace them. Frontends hand every
//! request to [`Pool::route`]; management surfaces use the `Result`
//! shaped operations. Four variants implement the contract:
//!
//! ```text
//! build_pool(config)
//!   ├── AutomaticPool   demand-driven; sized from a 60s request history
//!   ├── ManualPool      fixed roster; resize, suspend, resume, restart
//!   └── BasicPool       fixed roster; started on demand, idled out
//! InteractivePool       single lazy session for operator commands
//! ```
//!
//! All variants share [`PoolCore`]: the quit flag, the capacity signal
//! that wakes blocked routers, lifecycle signal dispatch, the graceful
//! shutdown budget, and change polling. Each long-running variant drives
//! itself from a one-second control loop that adjusts population and
//! restarts instances when watched files or configuration change.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use corral_core::config::{AppConfig, ScalingParams};
use corral_core::watcher::{ChangeWatcher, ConfigSource};
use corral_instance::{InstanceId, InstanceLauncher, Request, RequestKind, Response};

pub mod automatic;
pub mod basic;
pub mod core;
pub mod error;
pub mod history;
pub mod interactive;
pub mod manual;
#[cfg(test)]
mod support;

pub use automatic::AutomaticPool;
pub use basic::BasicPool;
pub use error::{PoolError, PoolResult};
pub use interactive::InteractivePool;
pub use manual::ManualPool;
pub use self::core::{ChangeReport, PoolCore, PoolOptions};

/// One application module's instance pool.
///
/// Routing always produces a `Response`; failures surface as error
/// statuses so the frontend has something to write back. Management
/// operations not offered by a variant return
/// [`PoolError::NotSupported`].
#[async_trait]
pub trait Pool: Send + Sync {
    /// Schedule one request. `target` pins it to a specific instance;
    /// `None` lets the pool balance it.
    async fn route(
        &self,
        request: Request,
        kind: RequestKind,
        target: Option<&InstanceId>,
    ) -> Response;

    /// Bring the pool to its serving state and spawn its control loop.
    async fn start(&self) -> PoolResult<()>;

    /// Stop serving and quit every instance. Idempotent.
    async fn quit(&self);

    async fn instance_count(&self) -> usize;

    /// Resize the pool to `count` instances.
    async fn set_count(&self, _count: usize) -> PoolResult<()> {
        Err(PoolError::NotSupported("set_count"))
    }

    /// Stop serving without discarding the pool; listeners answer with
    /// an error status until [`resume`](Pool::resume).
    async fn suspend(&self) -> PoolResult<()> {
        Err(PoolError::NotSupported("suspend"))
    }

    async fn resume(&self) -> PoolResult<()> {
        Err(PoolError::NotSupported("resume"))
    }

    /// Replace running instances with fresh ones.
    async fn restart(&self) -> PoolResult<()> {
        Err(PoolError::NotSupported("restart"))
    }

    /// Address of the listener serving one specific instance.
    async fn instance_address(&self, _id: &InstanceId) -> PoolResult<SocketAddr> {
        Err(PoolError::NotSupported("instance_address"))
    }

    /// Whether instances carry individually addressable listeners.
    fn addressable(&self) -> bool {
        false
    }
}

/// Build the pool variant selected by the application configuration.
pub fn build_pool(
    config: &AppConfig,
    options: PoolOptions,
    launcher: Arc<dyn InstanceLauncher>,
    watcher: Arc<dyn ChangeWatcher>,
    config_source: Arc<dyn ConfigSource>,
) -> Arc<dyn Pool> {
    match config.scaling_params() {
        ScalingParams::Automatic(params) => AutomaticPool::new(
            params,
            config.warmup_enabled(),
            launcher,
            watcher,
            config_source,
            options,
        ),
        ScalingParams::Manual(params) => {
            ManualPool::new(params, launcher, watcher, config_source, options)
        }
        ScalingParams::Basic(params) => {
            BasicPool::new(params, launcher, watcher, config_source, options)
        }
    }
}
