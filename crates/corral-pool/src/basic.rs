//! Basic scaled pool.
//!
//! A fixed array of slots created up front but left unstarted. The
//! first request to reach a stopped slot starts it, on the request path
//! for targeted traffic and from the balancer for untargeted traffic.
//! The control loop retires instances that sit idle past the configured
//! timeout, leaving a fresh unstarted instance in the slot.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use corral_core::config::BasicParams;
use corral_core::watcher::{ChangeWatcher, ConfigSource};
use corral_instance::{
    HandleError, Instance, InstanceId, InstanceLauncher, LifecycleSignal, Request, RequestKind,
    Response,
};
use corral_listener::{InstanceListener, RequestHandler};
use http::StatusCode;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::Pool;
use crate::core::{PoolCore, PoolOptions};
use crate::error::{PoolError, PoolResult};

struct BasicSlot {
    instance: Arc<dyn Instance>,
    /// Bound in `start`; `None` until then.
    listener: Option<InstanceListener>,
    /// Whether the slot's instance has been claimed for starting.
    running: bool,
}

struct BasicState {
    slots: Vec<BasicSlot>,
}

pub struct BasicPool {
    core: Arc<PoolCore>,
    idle_timeout: Duration,
    state: Mutex<BasicState>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<Self>,
}

impl BasicPool {
    pub fn new(
        params: BasicParams,
        launcher: Arc<dyn InstanceLauncher>,
        watcher: Arc<dyn ChangeWatcher>,
        config_source: Arc<dyn ConfigSource>,
        options: PoolOptions,
    ) -> Arc<Self> {
        let capacity = match options.max_instances {
            Some(cap) => params.max_instances.min(cap),
            None => params.max_instances,
        };
        Arc::new_cyclic(|self_ref| {
            let slots = (0..capacity)
                .map(|index| BasicSlot {
                    instance: launcher.new_instance(InstanceId::index(index), true),
                    listener: None,
                    running: false,
                })
                .collect();
            BasicPool {
                core: Arc::new(PoolCore::new(launcher, watcher, config_source, options)),
                idle_timeout: params.idle_timeout,
                state: Mutex::new(BasicState { slots }),
                loop_handle: Mutex::new(None),
                self_ref: self_ref.clone(),
            }
        })
    }

    /// Listener callback dispatching to the slot's current instance.
    fn slot_handler(&self, inst: Arc<dyn Instance>) -> RequestHandler {
        let pool = self.self_ref.clone();
        Arc::new(move |request: Request| {
            let pool = pool.clone();
            let inst = inst.clone();
            Box::pin(async move {
                match pool.upgrade() {
                    Some(pool) => {
                        pool.dispatch_targeted(inst, request, RequestKind::Normal).await
                    }
                    None => Response::service_unavailable("instance pool is shutting down"),
                }
            })
        })
    }

    /// Start a slot's instance and send it the start signal. The slot
    /// must already be marked running.
    async fn start_slot(&self, index: usize) {
        let inst = {
            let state = self.state.lock().await;
            if self.core.is_quitting() {
                return;
            }
            let Some(slot) = state.slots.get(index) else {
                return;
            };
            slot.instance.clone()
        };
        if inst.start().await {
            debug!(instance_id = %inst.id(), "started instance");
            self.core.send_lifecycle_signal(&inst, LifecycleSignal::Start).await;
            self.core.notify_capacity();
        } else {
            warn!(instance_id = %inst.id(), "instance failed to start");
            self.core.record_start_failure();
        }
    }

    fn async_start_slot(&self, index: usize) {
        if let Some(this) = self.self_ref.upgrade() {
            tokio::spawn(async move {
                this.start_slot(index).await;
            });
        }
    }

    /// Dispatch to one specific instance, starting its slot on first
    /// demand.
    async fn dispatch_targeted(
        &self,
        inst: Arc<dyn Instance>,
        request: Request,
        kind: RequestKind,
    ) -> Response {
        let Some(index) = inst.id().as_index() else {
            return Response::not_found("unknown instance");
        };
        let start = Instant::now();
        let deadline = start + self.core.options().route_timeout;
        let response = loop {
            if Instant::now() >= deadline {
                break Response::service_unavailable("timed out waiting for instance");
            }
            debug!(
                instance_id = %inst.id(),
                pending = ?start.elapsed(),
                "dispatching request"
            );
            match inst.handle(request.clone(), kind).await {
                Ok(response) => break response,
                Err(HandleError::CannotAccept) => {}
                Err(HandleError::Transport(e)) => {
                    warn!(instance_id = %inst.id(), error = %e, "instance transport failed");
                    break Response::text(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal Server Error",
                    );
                }
            }
            if inst.has_quit() {
                break Response::service_unavailable("instance has quit");
            }
            let should_start = {
                let mut state = self.state.lock().await;
                match state.slots.get_mut(index) {
                    Some(slot) if !slot.running => {
                        slot.running = true;
                        true
                    }
                    _ => false,
                }
            };
            if should_start {
                // First demand starts the slot, on the request path.
                self.start_slot(index).await;
            } else {
                inst.wait(deadline).await;
            }
        };
        self.core.notify_capacity();
        response
    }

    /// An accepting instance in slot order, else claim and start a
    /// stopped slot, else wait for capacity.
    async fn choose_instance(&self, deadline: Instant) -> Option<Arc<dyn Instance>> {
        loop {
            if Instant::now() >= deadline || self.core.is_quitting() {
                return None;
            }
            let mut claimed: Option<(usize, Arc<dyn Instance>)> = None;
            let notified = {
                let mut state = self.state.lock().await;
                if let Some(slot) = state
                    .slots
                    .iter()
                    .find(|slot| slot.instance.can_accept_requests())
                {
                    return Some(slot.instance.clone());
                }
                for (index, slot) in state.slots.iter_mut().enumerate() {
                    if !slot.running {
                        slot.running = true;
                        claimed = Some((index, slot.instance.clone()));
                        break;
                    }
                }
                if claimed.is_none() {
                    Some(self.core.capacity().notified())
                } else {
                    None
                }
            };

            if let Some((index, inst)) = claimed {
                self.async_start_slot(index);
                inst.wait(deadline).await;
                return Some(inst);
            }
            if let Some(notified) = notified {
                if !self.core.await_capacity(notified, deadline).await {
                    return None;
                }
            }
        }
    }

    async fn route_untargeted(&self, request: Request, kind: RequestKind) -> Response {
        let start = Instant::now();
        let deadline = start + self.core.options().route_timeout;
        loop {
            if Instant::now() >= deadline {
                return Response::service_unavailable("timed out waiting for an instance");
            }
            if self.core.is_quitting() {
                return Response::service_unavailable("instance pool is shutting down");
            }
            let Some(inst) = self.choose_instance(deadline).await else {
                continue;
            };
            debug!(
                instance_id = %inst.id(),
                pending = ?start.elapsed(),
                "dispatching request"
            );
            let result = inst.handle(request.clone(), kind).await;
            self.core.notify_capacity();
            match result {
                Ok(response) => return response,
                Err(HandleError::CannotAccept) => continue,
                Err(HandleError::Transport(e)) => {
                    warn!(instance_id = %inst.id(), error = %e, "instance transport failed");
                    return Response::text(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal Server Error",
                    );
                }
            }
        }
    }

    /// Retire running instances that have idled past the timeout. The
    /// slot gets a fresh unstarted instance and reverts to on-demand
    /// starting.
    async fn sweep_idle_instances(&self) {
        let mut to_stop: Vec<Arc<dyn Instance>> = Vec::new();
        {
            let mut state = self.state.lock().await;
            for index in 0..state.slots.len() {
                let expired = {
                    let slot = &state.slots[index];
                    slot.running && slot.instance.idle_duration() > self.idle_timeout
                };
                if !expired {
                    continue;
                }
                let fresh = self
                    .core
                    .launcher()
                    .new_instance(InstanceId::index(index), true);
                let slot = &mut state.slots[index];
                slot.running = false;
                let old = std::mem::replace(&mut slot.instance, fresh.clone());
                if let Some(listener) = &slot.listener {
                    listener.set_handler(self.slot_handler(fresh)).await;
                }
                to_stop.push(old);
            }
        }
        for inst in to_stop {
            debug!(instance_id = %inst.id(), "retiring idle instance");
            self.core.async_quit(inst);
        }
    }

    /// Replace the instances of running slots with fresh started ones.
    /// Stopped slots are already fresh and stay untouched.
    async fn restart_running(&self) {
        let mut to_stop: Vec<Arc<dyn Instance>> = Vec::new();
        let mut to_start: Vec<usize> = Vec::new();
        {
            let mut state = self.state.lock().await;
            if self.core.is_quitting() {
                return;
            }
            for index in 0..state.slots.len() {
                if !state.slots[index].running {
                    continue;
                }
                let fresh = self
                    .core
                    .launcher()
                    .new_instance(InstanceId::index(index), true);
                let slot = &mut state.slots[index];
                let old = std::mem::replace(&mut slot.instance, fresh.clone());
                if let Some(listener) = &slot.listener {
                    listener.set_handler(self.slot_handler(fresh)).await;
                }
                to_stop.push(old);
                to_start.push(index);
            }
        }
        if to_start.is_empty() {
            return;
        }
        info!(replaced = to_start.len(), "basic pool restarting");
        for index in to_start {
            self.async_start_slot(index);
        }
        for inst in to_stop {
            self.core.async_quit(inst);
        }
    }

    async fn tick(&self) {
        self.sweep_idle_instances().await;
        if self.core.options().automatic_restarts {
            let report = self.core.poll_changes();
            if report.any() {
                self.restart_running().await;
            }
        }
    }

    fn spawn_control_loop(&self) -> Option<JoinHandle<()>> {
        let this = self.self_ref.upgrade()?;
        let tick_interval = self.core.options().tick_interval;
        let mut quit_rx = self.core.subscribe_quit();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(tick_interval) => {
                        this.tick().await;
                    }
                    _ = quit_rx.changed() => {
                        debug!("basic pool control loop shutting down");
                        break;
                    }
                }
            }
        }))
    }
}

#[async_trait]
impl Pool for BasicPool {
    async fn route(
        &self,
        request: Request,
        kind: RequestKind,
        target: Option<&InstanceId>,
    ) -> Response {
        match target {
            Some(id) => {
                let inst = {
                    let state = self.state.lock().await;
                    id.as_index()
                        .and_then(|index| state.slots.get(index))
                        .map(|slot| slot.instance.clone())
                };
                match inst {
                    Some(inst) => self.dispatch_targeted(inst, request, kind).await,
                    None => Response::not_found("unknown instance"),
                }
            }
            None => self.route_untargeted(request, kind).await,
        }
    }

    async fn start(&self) -> PoolResult<()> {
        {
            let mut state = self.state.lock().await;
            for index in 0..state.slots.len() {
                let inst = state.slots[index].instance.clone();
                let listener =
                    InstanceListener::bind(&self.core.options().host, self.slot_handler(inst))
                        .await?;
                state.slots[index].listener = Some(listener);
            }
        }
        *self.loop_handle.lock().await = self.spawn_control_loop();
        let slots = self.instance_count().await;
        info!(slots, "basic pool started");
        Ok(())
    }

    async fn quit(&self) {
        self.core.begin_quit();
        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }
        let instances: Vec<Arc<dyn Instance>> = {
            let state = self.state.lock().await;
            for slot in &state.slots {
                if let Some(listener) = &slot.listener {
                    listener.shutdown();
                }
            }
            state.slots.iter().map(|slot| slot.instance.clone()).collect()
        };
        self.core.notify_capacity();
        for inst in instances {
            let _ = inst.quit(true, false).await;
        }
        info!("basic pool stopped");
    }

    async fn instance_count(&self) -> usize {
        self.state.lock().await.slots.len()
    }

    async fn restart(&self) -> PoolResult<()> {
        self.restart_running().await;
        Ok(())
    }

    async fn instance_address(&self, id: &InstanceId) -> PoolResult<SocketAddr> {
        let index = id
            .as_index()
            .ok_or_else(|| PoolError::InvalidInstanceId(id.to_string()))?;
        let state = self.state.lock().await;
        let addr = state
            .slots
            .get(index)
            .and_then(|slot| slot.listener.as_ref())
            .map(|listener| listener.local_addr());
        addr.ok_or_else(|| PoolError::InvalidInstanceId(id.to_string()))
    }

    fn addressable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::{FakeChanges, FakeLauncher, settle};

    fn test_options() -> PoolOptions {
        PoolOptions {
            host: "127.0.0.1".to_string(),
            route_timeout: Duration::from_millis(60),
            ..PoolOptions::default()
        }
    }

    fn pool_with(
        max_instances: usize,
        idle_timeout: Duration,
        launcher: Arc<FakeLauncher>,
        changes: Arc<FakeChanges>,
        options: PoolOptions,
    ) -> Arc<BasicPool> {
        BasicPool::new(
            BasicParams {
                max_instances,
                idle_timeout,
            },
            launcher,
            changes.clone(),
            changes,
            options,
        )
    }

    fn idle_15m() -> Duration {
        Duration::from_secs(15 * 60)
    }

    #[tokio::test]
    async fn test_slots_precreated_but_unstarted() {
        let launcher = FakeLauncher::new(1);
        let pool = pool_with(
            3,
            idle_15m(),
            launcher.clone(),
            FakeChanges::new(),
            test_options(),
        );
        assert_eq!(pool.instance_count().await, 3);
        assert_eq!(launcher.created_count(), 3);
        assert_eq!(launcher.expect_ready_flags(), vec![true, true, true]);
        for inst in launcher.created() {
            assert_eq!(inst.start_calls(), 0);
        }
    }

    #[tokio::test]
    async fn test_capacity_clamped_by_pool_cap() {
        let launcher = FakeLauncher::new(1);
        let options = PoolOptions {
            max_instances: Some(2),
            ..test_options()
        };
        let pool = pool_with(5, idle_15m(), launcher.clone(), FakeChanges::new(), options);
        assert_eq!(pool.instance_count().await, 2);
    }

    #[tokio::test]
    async fn test_targeted_starts_slot_on_first_demand() {
        let launcher = FakeLauncher::new(1);
        let pool = pool_with(
            1,
            idle_15m(),
            launcher.clone(),
            FakeChanges::new(),
            test_options(),
        );
        let inst = launcher.created()[0].clone();

        let response = pool
            .route(
                Request::new(http::Method::GET, "/job"),
                RequestKind::Background,
                Some(&InstanceId::index(0)),
            )
            .await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(inst.start_calls(), 1);
        // Start signal first, then the retried dispatch.
        let handled = inst.handled();
        assert_eq!(handled[0], ("/start".to_string(), RequestKind::Ready));
        assert_eq!(handled[1], ("/job".to_string(), RequestKind::Background));
        assert!(pool.state.lock().await.slots[0].running);
    }

    #[tokio::test]
    async fn test_targeted_times_out_on_claimed_slot() {
        let launcher = FakeLauncher::new(1);
        let pool = pool_with(
            1,
            idle_15m(),
            launcher.clone(),
            FakeChanges::new(),
            test_options(),
        );
        // Claimed by someone else but never came up.
        pool.state.lock().await.slots[0].running = true;

        let start = Instant::now();
        let response = pool
            .route(
                Request::new(http::Method::GET, "/"),
                RequestKind::Normal,
                Some(&InstanceId::index(0)),
            )
            .await;
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert_eq!(launcher.created()[0].start_calls(), 0);
    }

    #[tokio::test]
    async fn test_untargeted_starts_first_stopped_slot() {
        let launcher = FakeLauncher::new(1);
        let pool = pool_with(
            2,
            idle_15m(),
            launcher.clone(),
            FakeChanges::new(),
            test_options(),
        );

        let response = pool
            .route(
                Request::new(http::Method::GET, "/"),
                RequestKind::Normal,
                None,
            )
            .await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(launcher.created()[0].start_calls(), 1);
        assert_eq!(launcher.created()[1].start_calls(), 0);
        assert!(pool.state.lock().await.slots[0].running);
        assert!(!pool.state.lock().await.slots[1].running);
    }

    #[tokio::test]
    async fn test_untargeted_skips_claimed_slot() {
        let launcher = FakeLauncher::new(1);
        let pool = pool_with(
            2,
            idle_15m(),
            launcher.clone(),
            FakeChanges::new(),
            test_options(),
        );
        // Slot 0 is claimed but not yet accepting; the balancer must
        // claim slot 1 instead of waiting on it.
        pool.state.lock().await.slots[0].running = true;

        let response = pool
            .route(
                Request::new(http::Method::GET, "/"),
                RequestKind::Normal,
                None,
            )
            .await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(launcher.created()[0].start_calls(), 0);
        assert_eq!(launcher.created()[1].start_calls(), 1);
        assert!(pool.state.lock().await.slots[1].running);
    }

    #[tokio::test]
    async fn test_untargeted_prefers_accepting_over_claiming() {
        let launcher = FakeLauncher::new(1);
        let pool = pool_with(
            2,
            idle_15m(),
            launcher.clone(),
            FakeChanges::new(),
            test_options(),
        );
        pool.state.lock().await.slots[1].running = true;
        launcher.created()[1].set_accepting(true);

        let response = pool
            .route(
                Request::new(http::Method::GET, "/"),
                RequestKind::Normal,
                None,
            )
            .await;
        assert_eq!(response.status, StatusCode::OK);
        // Slot 0 was never claimed.
        assert_eq!(launcher.created()[0].start_calls(), 0);
        assert!(!pool.state.lock().await.slots[0].running);
    }

    #[tokio::test]
    async fn test_idle_sweep_replaces_expired_slot() {
        let launcher = FakeLauncher::new(1);
        let pool = pool_with(
            2,
            Duration::from_secs(60),
            launcher.clone(),
            FakeChanges::new(),
            test_options(),
        );
        let expired = launcher.created()[0].clone();
        let fresh_kept = launcher.created()[1].clone();
        {
            let mut state = pool.state.lock().await;
            state.slots[0].running = true;
        }
        expired.set_accepting(true);
        expired.set_idle(Duration::from_secs(61));
        fresh_kept.set_idle(Duration::from_secs(61)); // not running, ignored

        pool.sweep_idle_instances().await;
        settle().await;

        assert_eq!(launcher.created_count(), 3);
        assert!(!pool.state.lock().await.slots[0].running);
        assert_eq!(expired.quit_calls()[0], (false, true));
        assert!(fresh_kept.quit_calls().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_keeps_instances_within_timeout() {
        let launcher = FakeLauncher::new(1);
        let pool = pool_with(
            1,
            Duration::from_secs(60),
            launcher.clone(),
            FakeChanges::new(),
            test_options(),
        );
        pool.state.lock().await.slots[0].running = true;
        launcher.created()[0].set_idle(Duration::from_secs(59));

        pool.sweep_idle_instances().await;
        assert_eq!(launcher.created_count(), 1);
        assert!(pool.state.lock().await.slots[0].running);
    }

    #[tokio::test]
    async fn test_restart_touches_only_running_slots() {
        let launcher = FakeLauncher::new(1);
        let changes = FakeChanges::new();
        let pool = pool_with(
            2,
            idle_15m(),
            launcher.clone(),
            changes.clone(),
            test_options(),
        );
        pool.state.lock().await.slots[0].running = true;
        let old = launcher.created()[0].clone();
        old.set_accepting(true);

        changes.touch_files();
        pool.tick().await;
        settle().await;

        // One replacement for the running slot, none for the stopped one.
        assert_eq!(launcher.created_count(), 3);
        assert_eq!(old.quit_calls()[0], (false, true));
        assert_eq!(launcher.created()[2].start_calls(), 1);
        assert!(pool.state.lock().await.slots[0].running);
    }

    #[tokio::test]
    async fn test_route_times_out_with_no_slots() {
        let pool = pool_with(
            0,
            idle_15m(),
            FakeLauncher::new(1),
            FakeChanges::new(),
            test_options(),
        );
        let start = Instant::now();
        let response = pool
            .route(
                Request::new(http::Method::GET, "/"),
                RequestKind::Normal,
                None,
            )
            .await;
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_listener_round_trip_starts_slot() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let launcher = FakeLauncher::new(1);
        let pool = pool_with(
            1,
            idle_15m(),
            launcher.clone(),
            FakeChanges::new(),
            test_options(),
        );
        pool.start().await.unwrap();

        let addr = pool.instance_address(&InstanceId::index(0)).await.unwrap();
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /lazy HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut body = Vec::new();
        stream.read_to_end(&mut body).await.unwrap();
        assert!(String::from_utf8_lossy(&body).starts_with("HTTP/1.1 200"));
        assert_eq!(launcher.created()[0].start_calls(), 1);
        pool.quit().await;
    }

    #[tokio::test]
    async fn test_quit_stops_everything() {
        let launcher = FakeLauncher::new(1);
        let pool = pool_with(
            2,
            idle_15m(),
            launcher.clone(),
            FakeChanges::new(),
            test_options(),
        );
        pool.start().await.unwrap();
        pool.quit().await;
        for inst in launcher.created() {
            assert!(inst.has_quit());
        }
        assert!(pool.core.is_quitting());
    }
}
