//! State and plumbing shared by every scaling variant.
//!
//! `PoolCore` owns the pieces that do not depend on the scheduling
//! policy: the launcher handle, the quit flag, the capacity signal that
//! wakes blocked routers, lifecycle signal dispatch, the graceful
//! shutdown budget, and change polling.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use corral_core::watcher::{ChangeWatcher, ConfigSource};
use corral_instance::{Instance, InstanceLauncher, LifecycleSignal, Request, RestartPolicy};
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

/// Pool-level knobs sourced from the hosting process rather than the
/// application configuration.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Host that per-instance listeners bind to.
    pub host: String,
    /// Cap on the number of instances a pool may create. `None` means
    /// unlimited.
    pub max_instances: Option<usize>,
    /// Whether the control loops restart instances on file and
    /// configuration changes.
    pub automatic_restarts: bool,
    /// How long routing waits for an instance before giving up.
    pub route_timeout: Duration,
    /// How long an interactive command waits for the session instance.
    pub command_timeout: Duration,
    /// Budget between the stop signal and the forced quit.
    pub shutdown_timeout: Duration,
    /// Cadence of the per-pool control loop.
    pub tick_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            host: "localhost".to_string(),
            max_instances: None,
            automatic_restarts: true,
            route_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Outcome of one change poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeReport {
    /// A restart-relevant configuration value changed.
    pub config_changed: bool,
    /// Watched application files changed.
    pub file_changed: bool,
}

impl ChangeReport {
    pub fn any(self) -> bool {
        self.config_changed || self.file_changed
    }

    /// Whether an instance with `total_requests` served should be
    /// replaced under `policy`. Configuration changes always replace.
    pub fn should_restart(self, policy: RestartPolicy, total_requests: u64) -> bool {
        if self.config_changed {
            return true;
        }
        if !self.file_changed {
            return false;
        }
        match policy {
            RestartPolicy::Always => true,
            RestartPolicy::AfterFirstRequest => total_requests > 0,
            RestartPolicy::Never => false,
        }
    }
}

pub struct PoolCore {
    launcher: Arc<dyn InstanceLauncher>,
    watcher: Arc<dyn ChangeWatcher>,
    config_source: Arc<dyn ConfigSource>,
    options: PoolOptions,
    quit_tx: watch::Sender<bool>,
    capacity: Notify,
    start_failures: AtomicUsize,
}

impl PoolCore {
    pub fn new(
        launcher: Arc<dyn InstanceLauncher>,
        watcher: Arc<dyn ChangeWatcher>,
        config_source: Arc<dyn ConfigSource>,
        options: PoolOptions,
    ) -> Self {
        let (quit_tx, _) = watch::channel(false);
        PoolCore {
            launcher,
            watcher,
            config_source,
            options,
            quit_tx,
            capacity: Notify::new(),
            start_failures: AtomicUsize::new(0),
        }
    }

    pub fn launcher(&self) -> &Arc<dyn InstanceLauncher> {
        &self.launcher
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Concurrent request slots per instance, never zero.
    pub fn max_concurrent(&self) -> usize {
        self.launcher.max_concurrent_requests().max(1)
    }

    /// Mark the pool as quitting. Idempotent.
    pub fn begin_quit(&self) {
        let _ = self.quit_tx.send(true);
    }

    pub fn is_quitting(&self) -> bool {
        *self.quit_tx.borrow()
    }

    /// Receiver whose `changed()` fires on `begin_quit`.
    pub fn subscribe_quit(&self) -> watch::Receiver<bool> {
        self.quit_tx.subscribe()
    }

    /// Wake every router blocked on instance capacity.
    pub fn notify_capacity(&self) {
        self.capacity.notify_waiters();
    }

    /// The capacity signal. Callers create the `notified()` future while
    /// still holding their state lock so a wakeup between unlock and
    /// await is not lost, then pass it to [`await_capacity`].
    ///
    /// [`await_capacity`]: PoolCore::await_capacity
    pub fn capacity(&self) -> &Notify {
        &self.capacity
    }

    /// Block on a capacity wakeup. Returns false if the deadline passes
    /// or the pool begins quitting first.
    pub async fn await_capacity(&self, notified: Notified<'_>, deadline: Instant) -> bool {
        let mut quit_rx = self.quit_tx.subscribe();
        if *quit_rx.borrow() {
            return false;
        }
        tokio::select! {
            _ = notified => true,
            _ = sleep_until(deadline) => false,
            _ = quit_rx.changed() => false,
        }
    }

    /// Dispatch a lifecycle signal directly to one instance. Failures are
    /// logged, not surfaced; the schedulers treat the signals as best
    /// effort.
    pub async fn send_lifecycle_signal(&self, inst: &Arc<dyn Instance>, signal: LifecycleSignal) {
        let request = Request::lifecycle(signal);
        match inst.handle(request, signal.kind()).await {
            Ok(response) => {
                debug!(
                    instance_id = %inst.id(),
                    path = signal.path(),
                    status = %response.status,
                    "lifecycle signal sent"
                );
            }
            Err(e) => {
                warn!(
                    instance_id = %inst.id(),
                    path = signal.path(),
                    error = %e,
                    "lifecycle signal failed"
                );
            }
        }
    }

    /// Stop one instance gracefully: send the stop signal, give it the
    /// rest of the shutdown budget to exit on its own (cut short if the
    /// pool itself is quitting), then force the quit.
    pub async fn shutdown_with_timeout(&self, inst: Arc<dyn Instance>) {
        let force_at = Instant::now() + self.options.shutdown_timeout;
        self.send_lifecycle_signal(&inst, LifecycleSignal::Stop).await;

        let mut quit_rx = self.quit_tx.subscribe();
        if !*quit_rx.borrow() {
            tokio::select! {
                _ = sleep_until(force_at) => {}
                _ = quit_rx.changed() => {}
            }
        }
        let _ = inst.quit(true, false).await;
        debug!(instance_id = %inst.id(), "instance shut down");
    }

    /// Retire an instance in the background: mark it as expecting
    /// shutdown, then run the graceful stop sequence.
    pub fn async_quit(self: &Arc<Self>, inst: Arc<dyn Instance>) {
        let core = self.clone();
        tokio::spawn(async move {
            let _ = inst.quit(false, true).await;
            core.shutdown_with_timeout(inst).await;
        });
    }

    pub fn record_start_failure(&self) {
        self.start_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Instances that failed to come up over the pool lifetime.
    pub fn start_failures(&self) -> usize {
        self.start_failures.load(Ordering::Relaxed)
    }

    /// Poll both change sources and forward to the launcher hooks.
    ///
    /// Checking a source also clears its pending state, so both sources
    /// are checked on every pass.
    pub fn poll_changes(&self) -> ChangeReport {
        let config_changes = self.config_source.check_for_updates();
        let file_changed = self.watcher.has_changes();

        if file_changed {
            self.launcher.files_changed();
        }

        let config_changed = config_changes.iter().any(|c| c.requires_restart());
        if config_changed {
            self.launcher.configuration_changed(&config_changes);
        } else if !config_changes.is_empty() {
            debug!(?config_changes, "configuration changes need no restart");
        }

        ChangeReport {
            config_changed,
            file_changed,
        }
    }
}

/// Change sources for a pool that never sees changes, used for
/// interactive sessions and in tests.
pub(crate) fn static_change_sources() -> (Arc<dyn ChangeWatcher>, Arc<dyn ConfigSource>) {
    (
        Arc::new(corral_core::Unchanging),
        Arc::new(corral_core::Unchanging),
    )
}
