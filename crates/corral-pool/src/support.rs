//! Scriptable test doubles shared by the scheduler tests.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use corral_core::watcher::{ChangeKind, ChangeWatcher, ConfigSource};
use corral_instance::{
    HandleError, Instance, InstanceId, InstanceLauncher, QuitDeclined, Request, RequestKind,
    Response, RestartPolicy,
};
use http::StatusCode;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};

/// Give spawned tasks a moment to run.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}

/// A runtime instance whose behavior is scripted by the test.
///
/// Dispatches succeed with a canned 200 unless a response is scripted;
/// scripted responses are consumed in order.
pub(crate) struct FakeInstance {
    id: InstanceId,
    max_concurrent: AtomicUsize,
    accepting: AtomicBool,
    quit: AtomicBool,
    declining: AtomicBool,
    start_ok: AtomicBool,
    start_calls: AtomicUsize,
    outstanding: AtomicUsize,
    total: AtomicU64,
    idle: Mutex<Duration>,
    scripted: Mutex<VecDeque<Result<Response, HandleError>>>,
    handled: Mutex<Vec<(String, RequestKind)>>,
    quit_calls: Mutex<Vec<(bool, bool)>>,
    wake: Notify,
}

impl FakeInstance {
    pub fn new(id: InstanceId) -> Arc<Self> {
        Arc::new(FakeInstance {
            id,
            max_concurrent: AtomicUsize::new(1),
            accepting: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            declining: AtomicBool::new(false),
            start_ok: AtomicBool::new(true),
            start_calls: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            total: AtomicU64::new(0),
            idle: Mutex::new(Duration::ZERO),
            scripted: Mutex::new(VecDeque::new()),
            handled: Mutex::new(Vec::new()),
            quit_calls: Mutex::new(Vec::new()),
            wake: Notify::new(),
        })
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Relaxed);
        if accepting {
            self.wake.notify_waiters();
        }
    }

    pub fn set_max_concurrent(&self, n: usize) {
        self.max_concurrent.store(n, Ordering::Relaxed);
    }

    pub fn set_outstanding(&self, n: usize) {
        self.outstanding.store(n, Ordering::Relaxed);
    }

    pub fn set_total(&self, n: u64) {
        self.total.store(n, Ordering::Relaxed);
    }

    pub fn set_idle(&self, idle: Duration) {
        *self.idle.lock().unwrap() = idle;
    }

    /// Make `start` fail, leaving the instance quit.
    pub fn fail_start(&self) {
        self.start_ok.store(false, Ordering::Relaxed);
    }

    /// Make non-forced quits fail as if a request were in flight.
    pub fn decline_quit(&self) {
        self.declining.store(true, Ordering::Relaxed);
    }

    /// Queue the outcome of the next dispatch.
    pub fn script(&self, result: Result<Response, HandleError>) {
        self.scripted.lock().unwrap().push_back(result);
    }

    /// Dispatches that reached `handle`, as (path, kind) pairs.
    pub fn handled(&self) -> Vec<(String, RequestKind)> {
        self.handled.lock().unwrap().clone()
    }

    /// Recorded `quit` calls as (force, expect_shutdown) pairs.
    pub fn quit_calls(&self) -> Vec<(bool, bool)> {
        self.quit_calls.lock().unwrap().clone()
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Instance for FakeInstance {
    fn id(&self) -> &InstanceId {
        &self.id
    }

    fn can_accept_requests(&self) -> bool {
        self.accepting.load(Ordering::Relaxed) && !self.has_quit()
    }

    fn remaining_capacity(&self) -> usize {
        self.max_concurrent
            .load(Ordering::Relaxed)
            .saturating_sub(self.outstanding.load(Ordering::Relaxed))
    }

    fn outstanding_requests(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    fn total_requests(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    fn idle_duration(&self) -> Duration {
        *self.idle.lock().unwrap()
    }

    fn has_quit(&self) -> bool {
        self.quit.load(Ordering::Relaxed)
    }

    async fn start(&self) -> bool {
        self.start_calls.fetch_add(1, Ordering::Relaxed);
        if self.start_ok.load(Ordering::Relaxed) {
            self.set_accepting(true);
            true
        } else {
            self.quit.store(true, Ordering::Relaxed);
            self.wake.notify_waiters();
            false
        }
    }

    async fn handle(&self, request: Request, kind: RequestKind) -> Result<Response, HandleError> {
        if !self.can_accept_requests() {
            return Err(HandleError::CannotAccept);
        }
        self.handled.lock().unwrap().push((request.path, kind));
        let scripted = self.scripted.lock().unwrap().pop_front();
        match scripted {
            Some(result) => {
                if result.is_ok() {
                    self.total.fetch_add(1, Ordering::Relaxed);
                }
                result
            }
            None => {
                self.total.fetch_add(1, Ordering::Relaxed);
                Ok(Response::text(StatusCode::OK, format!("ok from {}", self.id)))
            }
        }
    }

    async fn quit(&self, force: bool, expect_shutdown: bool) -> Result<(), QuitDeclined> {
        self.quit_calls.lock().unwrap().push((force, expect_shutdown));
        if force {
            self.quit.store(true, Ordering::Relaxed);
            self.accepting.store(false, Ordering::Relaxed);
            self.wake.notify_waiters();
            return Ok(());
        }
        if expect_shutdown {
            // Marked only; the instance stays up until the stop sequence
            // forces the quit.
            return Ok(());
        }
        if self.declining.load(Ordering::Relaxed) || self.outstanding.load(Ordering::Relaxed) > 0 {
            return Err(QuitDeclined);
        }
        self.quit.store(true, Ordering::Relaxed);
        self.accepting.store(false, Ordering::Relaxed);
        self.wake.notify_waiters();
        Ok(())
    }

    async fn wait(&self, deadline: Instant) {
        loop {
            if self.can_accept_requests() || self.has_quit() || Instant::now() >= deadline {
                return;
            }
            let notified = self.wake.notified();
            if self.can_accept_requests() || self.has_quit() {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = sleep_until(deadline) => return,
            }
        }
    }
}

/// Launcher producing `FakeInstance`s and recording every hook call.
pub(crate) struct FakeLauncher {
    max_concurrent: usize,
    policy: Mutex<RestartPolicy>,
    failing: AtomicBool,
    created: Mutex<Vec<Arc<FakeInstance>>>,
    expect_ready_flags: Mutex<Vec<bool>>,
    files_changed_calls: AtomicUsize,
    config_changes: Mutex<Vec<BTreeSet<ChangeKind>>>,
}

impl FakeLauncher {
    pub fn new(max_concurrent: usize) -> Arc<Self> {
        Arc::new(FakeLauncher {
            max_concurrent,
            policy: Mutex::new(RestartPolicy::Always),
            failing: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
            expect_ready_flags: Mutex::new(Vec::new()),
            files_changed_calls: AtomicUsize::new(0),
            config_changes: Mutex::new(Vec::new()),
        })
    }

    pub fn set_policy(&self, policy: RestartPolicy) {
        *self.policy.lock().unwrap() = policy;
    }

    /// Make every instance created from here on fail to start.
    pub fn fail_starts(&self) {
        self.failing.store(true, Ordering::Relaxed);
    }

    /// Instances created so far, in creation order.
    pub fn created(&self) -> Vec<Arc<FakeInstance>> {
        self.created.lock().unwrap().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// The `expect_ready_request` flag of each creation, in order.
    pub fn expect_ready_flags(&self) -> Vec<bool> {
        self.expect_ready_flags.lock().unwrap().clone()
    }

    pub fn files_changed_calls(&self) -> usize {
        self.files_changed_calls.load(Ordering::Relaxed)
    }

    pub fn config_changes(&self) -> Vec<BTreeSet<ChangeKind>> {
        self.config_changes.lock().unwrap().clone()
    }
}

impl InstanceLauncher for FakeLauncher {
    fn new_instance(&self, id: InstanceId, expect_ready_request: bool) -> Arc<dyn Instance> {
        let inst = FakeInstance::new(id);
        if self.failing.load(Ordering::Relaxed) {
            inst.fail_start();
        }
        self.created.lock().unwrap().push(inst.clone());
        self.expect_ready_flags
            .lock()
            .unwrap()
            .push(expect_ready_request);
        inst
    }

    fn max_concurrent_requests(&self) -> usize {
        self.max_concurrent
    }

    fn restart_policy(&self) -> RestartPolicy {
        *self.policy.lock().unwrap()
    }

    fn files_changed(&self) {
        self.files_changed_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn configuration_changed(&self, changes: &BTreeSet<ChangeKind>) {
        self.config_changes.lock().unwrap().push(changes.clone());
    }
}

/// Change sources the test trips by hand.
pub(crate) struct FakeChanges {
    config: Mutex<BTreeSet<ChangeKind>>,
    files: AtomicBool,
}

impl FakeChanges {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeChanges {
            config: Mutex::new(BTreeSet::new()),
            files: AtomicBool::new(false),
        })
    }

    pub fn push_config(&self, change: ChangeKind) {
        self.config.lock().unwrap().insert(change);
    }

    pub fn touch_files(&self) {
        self.files.store(true, Ordering::Relaxed);
    }
}

impl ConfigSource for FakeChanges {
    fn check_for_updates(&self) -> BTreeSet<ChangeKind> {
        std::mem::take(&mut *self.config.lock().unwrap())
    }
}

impl ChangeWatcher for FakeChanges {
    fn has_changes(&self) -> bool {
        self.files.swap(false, Ordering::Relaxed)
    }
}
