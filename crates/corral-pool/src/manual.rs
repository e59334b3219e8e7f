//! Manually scaled pool.
//!
//! A fixed roster of slots, resized only by explicit operation. Every
//! slot couples one instance with one `InstanceListener`, so each
//! instance is addressable on its own local port. The pool can be
//! suspended (slots keep their ports, traffic gets a parked error) and
//! resumed with fresh instances in the same slots.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use corral_core::config::ManualParams;
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

struct ManualSlot {
    instance: Arc<dyn Instance>,
    listener: InstanceListener,
}

#[derive(Default)]
struct ManualState {
    slots: Vec<ManualSlot>,
    suspended: bool,
}

pub struct ManualPool {
    core: Arc<PoolCore>,
    params: ManualParams,
    state: Mutex<ManualState>,
    /// Serializes resize, suspend, resume, and restart against each
    /// other.
    ops: Mutex<()>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<Self>,
}

impl ManualPool {
    pub fn new(
        params: ManualParams,
        launcher: Arc<dyn InstanceLauncher>,
        watcher: Arc<dyn ChangeWatcher>,
        config_source: Arc<dyn ConfigSource>,
        options: PoolOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| ManualPool {
            core: Arc::new(PoolCore::new(launcher, watcher, config_source, options)),
            params,
            state: Mutex::new(ManualState::default()),
            ops: Mutex::new(()),
            loop_handle: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    fn clamp_to_cap(&self, count: usize) -> usize {
        match self.core.options().max_instances {
            Some(max) => count.min(max),
            None => count,
        }
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
                        pool.targeted_entry(inst, request, RequestKind::Normal).await
                    }
                    None => Response::service_unavailable("instance pool is shutting down"),
                }
            })
        })
    }

    /// Append one slot with a freshly bound listener. Callers hold the
    /// ops lock.
    async fn add_slot(&self) -> PoolResult<()> {
        let index = { self.state.lock().await.slots.len() };
        let inst = self
            .core
            .launcher()
            .new_instance(InstanceId::index(index), true);
        let listener =
            InstanceListener::bind(&self.core.options().host, self.slot_handler(inst.clone()))
                .await?;
        let addr = listener.local_addr();

        let suspended = {
            let mut state = self.state.lock().await;
            if self.core.is_quitting() {
                return Ok(());
            }
            state.slots.push(ManualSlot {
                instance: inst.clone(),
                listener,
            });
            state.suspended
        };
        if !suspended {
            self.async_start_instance(inst, addr);
        }
        Ok(())
    }

    /// Start an instance off the caller's path and send it the start
    /// signal once up.
    fn async_start_instance(&self, inst: Arc<dyn Instance>, addr: SocketAddr) {
        let core = self.core.clone();
        tokio::spawn(async move {
            if inst.start().await {
                debug!(instance_id = %inst.id(), %addr, "started instance");
                core.send_lifecycle_signal(&inst, LifecycleSignal::Start).await;
                core.notify_capacity();
            } else {
                warn!(instance_id = %inst.id(), "instance failed to start");
                core.record_start_failure();
            }
        });
    }

    async fn suspended(&self) -> bool {
        self.state.lock().await.suspended
    }

    /// True when requests of this kind must be refused outright.
    async fn refuses(&self, kind: RequestKind) -> bool {
        let suspended = matches!(kind, RequestKind::Normal | RequestKind::Ready)
            && self.suspended().await;
        suspended || self.core.is_quitting()
    }

    async fn targeted_entry(
        &self,
        inst: Arc<dyn Instance>,
        request: Request,
        kind: RequestKind,
    ) -> Response {
        if self.refuses(kind).await {
            return Response::service_unavailable("instance pool is stopped");
        }
        self.dispatch_targeted(inst, request, kind).await
    }

    /// Dispatch to one specific instance, waiting out warmup within the
    /// routing budget.
    async fn dispatch_targeted(
        &self,
        inst: Arc<dyn Instance>,
        request: Request,
        kind: RequestKind,
    ) -> Response {
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
            inst.wait(deadline).await;
            if inst.has_quit() {
                break Response::service_unavailable("instance has quit");
            }
        };
        self.core.notify_capacity();
        response
    }

    /// First slot in index order whose instance can accept, else wait
    /// for capacity.
    async fn choose_instance(&self, deadline: Instant) -> Option<Arc<dyn Instance>> {
        loop {
            if Instant::now() >= deadline {
                return None;
            }
            let notified = {
                let state = self.state.lock().await;
                if let Some(slot) = state
                    .slots
                    .iter()
                    .find(|slot| slot.instance.can_accept_requests())
                {
                    return Some(slot.instance.clone());
                }
                self.core.capacity().notified()
            };
            if !self.core.await_capacity(notified, deadline).await {
                return None;
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
            if self.refuses(kind).await {
                return Response::service_unavailable("instance pool is stopped");
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

    async fn resolve(&self, id: &InstanceId) -> Option<Arc<dyn Instance>> {
        let index = id.as_index()?;
        let state = self.state.lock().await;
        state.slots.get(index).map(|slot| slot.instance.clone())
    }

    /// Replace every slot's instance with a fresh one. Callers hold the
    /// ops lock.
    async fn restart_locked(&self) {
        let mut to_stop: Vec<Arc<dyn Instance>> = Vec::new();
        let mut to_start: Vec<(Arc<dyn Instance>, SocketAddr)> = Vec::new();
        {
            let mut state = self.state.lock().await;
            if self.core.is_quitting() {
                return;
            }
            for (index, slot) in state.slots.iter_mut().enumerate() {
                let inst = self
                    .core
                    .launcher()
                    .new_instance(InstanceId::index(index), true);
                slot.listener.set_handler(self.slot_handler(inst.clone())).await;
                to_stop.push(std::mem::replace(&mut slot.instance, inst.clone()));
                to_start.push((inst, slot.listener.local_addr()));
            }
        }
        info!(slots = to_start.len(), "manual pool restarting");
        for inst in to_stop {
            self.core.async_quit(inst);
        }
        for (inst, addr) in to_start {
            self.async_start_instance(inst, addr);
        }
    }

    async fn tick(&self) {
        if !self.core.options().automatic_restarts {
            return;
        }
        let report = self.core.poll_changes();
        if !report.any() {
            return;
        }
        let _ops = self.ops.lock().await;
        if self.suspended().await {
            return;
        }
        self.restart_locked().await;
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
                        debug!("manual pool control loop shutting down");
                        break;
                    }
                }
            }
        }))
    }
}

#[async_trait]
impl Pool for ManualPool {
    async fn route(
        &self,
        request: Request,
        kind: RequestKind,
        target: Option<&InstanceId>,
    ) -> Response {
        match target {
            Some(id) => match self.resolve(id).await {
                Some(inst) => self.targeted_entry(inst, request, kind).await,
                None => Response::not_found("unknown instance"),
            },
            None => self.route_untargeted(request, kind).await,
        }
    }

    async fn start(&self) -> PoolResult<()> {
        {
            let _ops = self.ops.lock().await;
            let count = self.clamp_to_cap(self.params.instances);
            for _ in 0..count {
                self.add_slot().await?;
            }
        }
        *self.loop_handle.lock().await = self.spawn_control_loop();
        let instances = self.instance_count().await;
        info!(instances, "manual pool started");
        Ok(())
    }

    async fn quit(&self) {
        self.core.begin_quit();
        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }
        let slots: Vec<ManualSlot> = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.slots)
        };
        self.core.notify_capacity();
        for slot in &slots {
            slot.listener.shutdown();
        }
        for slot in slots {
            let _ = slot.instance.quit(true, false).await;
        }
        info!("manual pool stopped");
    }

    async fn instance_count(&self) -> usize {
        self.state.lock().await.slots.len()
    }

    async fn set_count(&self, count: usize) -> PoolResult<()> {
        let count = self.clamp_to_cap(count);
        let _ops = self.ops.lock().await;
        let current = { self.state.lock().await.slots.len() };
        if count < current {
            let removed: Vec<ManualSlot> = {
                let mut state = self.state.lock().await;
                state.slots.split_off(count)
            };
            info!(from = current, to = count, "manual pool shrinking");
            for slot in removed {
                let core = self.core.clone();
                tokio::spawn(async move {
                    slot.listener.shutdown();
                    let _ = slot.instance.quit(false, true).await;
                    core.shutdown_with_timeout(slot.instance).await;
                });
            }
        } else {
            for _ in current..count {
                self.add_slot().await?;
            }
            if count > current {
                info!(from = current, to = count, "manual pool growing");
            }
        }
        Ok(())
    }

    async fn suspend(&self) -> PoolResult<()> {
        let _ops = self.ops.lock().await;
        let to_stop: Vec<Arc<dyn Instance>> = {
            let mut state = self.state.lock().await;
            if state.suspended {
                return Err(PoolError::AlreadySuspended);
            }
            state.suspended = true;
            for slot in &state.slots {
                slot.listener
                    .set_unavailable(StatusCode::SERVICE_UNAVAILABLE)
                    .await;
            }
            state
                .slots
                .iter()
                .map(|slot| slot.instance.clone())
                .collect()
        };
        info!("manual pool suspended");
        for inst in to_stop {
            self.core.async_quit(inst);
        }
        Ok(())
    }

    async fn resume(&self) -> PoolResult<()> {
        let _ops = self.ops.lock().await;
        let count = {
            let mut state = self.state.lock().await;
            if !state.suspended {
                return Err(PoolError::AlreadyResumed);
            }
            state.suspended = false;
            state.slots.len()
        };

        let mut to_start: Vec<(Arc<dyn Instance>, SocketAddr)> = Vec::new();
        {
            let mut state = self.state.lock().await;
            if self.core.is_quitting() {
                return Ok(());
            }
            for index in 0..count {
                let inst = self
                    .core
                    .launcher()
                    .new_instance(InstanceId::index(index), true);
                let Some(slot) = state.slots.get_mut(index) else {
                    break;
                };
                slot.listener.set_handler(self.slot_handler(inst.clone())).await;
                slot.instance = inst.clone();
                to_start.push((inst, slot.listener.local_addr()));
            }
        }
        info!(instances = count, "manual pool resumed");
        for (inst, addr) in to_start {
            self.async_start_instance(inst, addr);
        }
        Ok(())
    }

    async fn restart(&self) -> PoolResult<()> {
        let _ops = self.ops.lock().await;
        self.restart_locked().await;
        Ok(())
    }

    async fn instance_address(&self, id: &InstanceId) -> PoolResult<SocketAddr> {
        let index = id
            .as_index()
            .ok_or_else(|| PoolError::InvalidInstanceId(id.to_string()))?;
        let state = self.state.lock().await;
        let slot = state
            .slots
            .get(index)
            .ok_or_else(|| PoolError::InvalidInstanceId(id.to_string()))?;
        Ok(slot.listener.local_addr())
    }

    fn addressable(&self) -> bool {
        true
    }
}
