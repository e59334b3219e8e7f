//! Automatically scaled pool.
//!
//! Instances come and go with load. Routing records every counted
//! request in a sliding history window; the peak of that window divided
//! by per-instance concurrency gives the number of instances considered
//! required. Required instances are packed tight, spare instances drain,
//! and a once-a-second control loop grows toward the idle floor and
//! shrinks past the idle ceiling.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use corral_core::config::AutomaticParams;
use corral_core::watcher::{ChangeWatcher, ConfigSource};
use corral_instance::{
    HandleError, Instance, InstanceId, InstanceLauncher, LifecycleSignal, Request, RequestKind,
    Response,
};
use http::StatusCode;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::Pool;
use crate::core::{ChangeReport, PoolCore, PoolOptions};
use crate::error::PoolResult;
use crate::history::RequestHistory;

/// Minimum gap between idle-instance quits, so a load dip does not
/// dismantle the pool all at once.
const MIN_QUIT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct AutoState {
    instances: HashMap<InstanceId, Arc<dyn Instance>>,
    history: RequestHistory,
    outstanding: usize,
    last_quit: Option<Instant>,
}

pub struct AutomaticPool {
    core: Arc<PoolCore>,
    params: AutomaticParams,
    /// Whether new idle instances get a warmup request before traffic.
    warmup_enabled: bool,
    state: Mutex<AutoState>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<Self>,
}

impl AutomaticPool {
    pub fn new(
        params: AutomaticParams,
        warmup_enabled: bool,
        launcher: Arc<dyn InstanceLauncher>,
        watcher: Arc<dyn ChangeWatcher>,
        config_source: Arc<dyn ConfigSource>,
        options: PoolOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| AutomaticPool {
            core: Arc::new(PoolCore::new(launcher, watcher, config_source, options)),
            params,
            warmup_enabled,
            state: Mutex::new(AutoState::default()),
            loop_handle: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    /// Instances needed to cover the peak outstanding count seen in the
    /// history window.
    fn required_instance_count(&self, state: &mut AutoState) -> usize {
        let peak = state.history.peak(Instant::now());
        peak.div_ceil(self.core.max_concurrent())
    }

    /// Partition instances into (required, spare).
    ///
    /// The most loaded accepting instances fill the required set so that
    /// traffic packs tight and the spares drain toward idle. Spares
    /// include instances that cannot accept requests.
    fn split_instances(
        &self,
        state: &mut AutoState,
    ) -> (Vec<Arc<dyn Instance>>, Vec<Arc<dyn Instance>>) {
        let required_count = self.required_instance_count(state);
        let mut accepting: Vec<Arc<dyn Instance>> = state
            .instances
            .values()
            .filter(|inst| inst.can_accept_requests())
            .cloned()
            .collect();
        accepting.sort_by_key(|inst| std::cmp::Reverse(inst.outstanding_requests()));

        let required: Vec<Arc<dyn Instance>> =
            accepting.into_iter().take(required_count).collect();
        let required_ids: HashSet<InstanceId> =
            required.iter().map(|inst| inst.id().clone()).collect();
        let spare = state
            .instances
            .values()
            .filter(|inst| !required_ids.contains(inst.id()))
            .cloned()
            .collect();
        (required, spare)
    }

    /// Pick an instance for a balanced request, waiting until `deadline`
    /// for capacity if none is free.
    async fn choose_instance(&self, deadline: Instant) -> Option<Arc<dyn Instance>> {
        loop {
            if Instant::now() >= deadline {
                return None;
            }
            let notified = {
                let mut state = self.state.lock().await;
                let (required, spare) = self.split_instances(&mut state);

                // Required instances first, preferring the one with the
                // most free slots.
                if let Some(best) = required
                    .iter()
                    .max_by_key(|inst| inst.remaining_capacity())
                {
                    if best.remaining_capacity() > 0 {
                        return Some(best.clone());
                    }
                }

                // Otherwise the most loaded spare, so the rest keep
                // draining toward idle.
                let mut candidates: Vec<Arc<dyn Instance>> = spare
                    .into_iter()
                    .filter(|inst| {
                        inst.remaining_capacity() > 0 && inst.can_accept_requests()
                    })
                    .collect();
                candidates.sort_by_key(|inst| inst.outstanding_requests());
                if let Some(inst) = candidates.pop() {
                    return Some(inst);
                }

                self.core.capacity().notified()
            };
            if !self.core.await_capacity(notified, deadline).await {
                return None;
            }
        }
    }

    /// Create, track, and start one instance. Returns `None` at the
    /// instance cap or when the pool is quitting. An instance whose start
    /// fails stays tracked until the next adjustment pass reaps it.
    async fn add_instance(&self, permit_warmup: bool) -> Option<Arc<dyn Instance>> {
        if let Some(max) = self.core.options().max_instances {
            let state = self.state.lock().await;
            if state.instances.len() >= max {
                return None;
            }
        }

        let perform_warmup = permit_warmup && self.warmup_enabled;
        let inst = self
            .core
            .launcher()
            .new_instance(InstanceId::generate(), perform_warmup);
        {
            let mut state = self.state.lock().await;
            if self.core.is_quitting() {
                return None;
            }
            state.instances.insert(inst.id().clone(), inst.clone());
        }

        if !inst.start().await {
            warn!(instance_id = %inst.id(), "instance failed to start");
            self.core.record_start_failure();
            return None;
        }

        debug!(instance_id = %inst.id(), warmup = perform_warmup, "created instance");
        if perform_warmup {
            self.async_warmup(inst.clone());
        } else {
            self.core.notify_capacity();
        }
        Some(inst)
    }

    /// Send the warmup request off the caller's path, then open the
    /// instance to routing.
    fn async_warmup(&self, inst: Arc<dyn Instance>) {
        let core = self.core.clone();
        tokio::spawn(async move {
            core.send_lifecycle_signal(&inst, LifecycleSignal::Warmup).await;
            core.notify_capacity();
        });
    }

    /// Route a balanced request: pick an instance, growing the pool when
    /// none frees up within the pending-latency budget.
    async fn route_untargeted(&self, request: Request, kind: RequestKind) -> Response {
        let start = Instant::now();
        {
            let mut state = self.state.lock().await;
            state.outstanding += 1;
            let outstanding = state.outstanding;
            state.history.record(Instant::now(), outstanding);
        }

        let response = self.balance(request, kind, start).await;

        {
            let mut state = self.state.lock().await;
            state.outstanding -= 1;
        }
        self.core.notify_capacity();
        response
    }

    async fn balance(&self, request: Request, kind: RequestKind, start: Instant) -> Response {
        let mut deadline = start + self.params.min_pending_latency;
        loop {
            if self.core.is_quitting() {
                return Response::service_unavailable("instance pool is shutting down");
            }
            let inst = match self.choose_instance(deadline).await {
                Some(inst) => inst,
                None => match self.add_instance(false).await {
                    Some(inst) => inst,
                    None => {
                        // At the cap. Give running instances another
                        // pending-latency budget to free a slot.
                        deadline = Instant::now() + self.params.max_pending_latency;
                        continue;
                    }
                },
            };

            debug!(
                instance_id = %inst.id(),
                pending = ?start.elapsed(),
                "dispatching request"
            );
            match inst.handle(request.clone(), kind).await {
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

    /// Dispatch a request addressed to one instance by id.
    async fn route_targeted(
        &self,
        request: Request,
        kind: RequestKind,
        target: &InstanceId,
    ) -> Response {
        let inst = {
            let state = self.state.lock().await;
            state.instances.get(target).cloned()
        };
        let Some(inst) = inst else {
            return Response::not_found("unknown instance");
        };

        let counted = kind.counts_outstanding();
        if counted {
            let mut state = self.state.lock().await;
            state.outstanding += 1;
            let outstanding = state.outstanding;
            state.history.record(Instant::now(), outstanding);
        }

        debug!(instance_id = %inst.id(), "dispatching targeted request");
        let response = match inst.handle(request, kind).await {
            Ok(response) => response,
            Err(e) => {
                warn!(instance_id = %inst.id(), error = %e, "targeted dispatch failed");
                Response::service_unavailable("instance cannot accept requests")
            }
        };

        if counted {
            let mut state = self.state.lock().await;
            state.outstanding -= 1;
        }
        self.core.notify_capacity();
        response
    }

    async fn tick(&self) {
        if self.core.options().automatic_restarts {
            let report = self.core.poll_changes();
            if report.any() {
                self.restart_affected(report).await;
            }
        }
        self.adjust_instances().await;
    }

    /// Quit instances the launcher's restart policy marks as stale.
    async fn restart_affected(&self, report: ChangeReport) {
        let policy = self.core.launcher().restart_policy();
        let to_quit: Vec<Arc<dyn Instance>> = {
            let mut state = self.state.lock().await;
            let affected: Vec<InstanceId> = state
                .instances
                .values()
                .filter(|inst| report.should_restart(policy, inst.total_requests()))
                .map(|inst| inst.id().clone())
                .collect();
            affected
                .iter()
                .filter_map(|id| state.instances.remove(id))
                .collect()
        };
        if to_quit.is_empty() {
            return;
        }
        info!(count = to_quit.len(), "replacing instances after change");
        for inst in to_quit {
            self.core.async_quit(inst);
        }
    }

    /// One maintenance pass: reap instances that have quit, then grow
    /// toward the idle floor or shrink past the idle ceiling. Quits are
    /// rate limited by [`MIN_QUIT_INTERVAL`].
    async fn adjust_instances(&self) {
        let now = Instant::now();
        let mut add_needed = false;
        let mut quit_candidates: Vec<Arc<dyn Instance>> = Vec::new();
        {
            let mut state = self.state.lock().await;
            let before = state.instances.len();
            state.instances.retain(|_, inst| !inst.has_quit());
            let reaped = before - state.instances.len();
            if reaped > 0 {
                debug!(reaped, "reaped quit instances");
            }

            let (_, spare) = self.split_instances(&mut state);
            if spare.len() < self.params.min_idle_instances {
                add_needed = true;
            } else if spare.len() > self.params.max_idle_instances
                && state
                    .last_quit
                    .is_none_or(|t| now > t + MIN_QUIT_INTERVAL)
            {
                quit_candidates = spare
                    .into_iter()
                    .filter(|inst| inst.outstanding_requests() == 0)
                    .collect();
            }
        }

        if add_needed {
            self.add_instance(true).await;
            return;
        }

        for inst in quit_candidates {
            // A request may have landed since the scan; a declined quit
            // just moves on to the next candidate.
            if inst.quit(false, false).await.is_ok() {
                debug!(instance_id = %inst.id(), "quit idle instance");
                let mut state = self.state.lock().await;
                state.last_quit = Some(now);
                state.instances.remove(inst.id());
                break;
            }
        }
    }
}

#[async_trait]
impl Pool for AutomaticPool {
    async fn route(
        &self,
        request: Request,
        kind: RequestKind,
        target: Option<&InstanceId>,
    ) -> Response {
        match target {
            Some(id) => self.route_targeted(request, kind, id).await,
            None => self.route_untargeted(request, kind).await,
        }
    }

    async fn start(&self) -> PoolResult<()> {
        let Some(this) = self.self_ref.upgrade() else {
            return Ok(());
        };
        let tick_interval = self.core.options().tick_interval;
        let mut quit_rx = self.core.subscribe_quit();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(tick_interval) => {
                        this.tick().await;
                    }
                    _ = quit_rx.changed() => {
                        debug!("automatic pool control loop shutting down");
                        break;
                    }
                }
            }
        });
        *self.loop_handle.lock().await = Some(handle);
        info!("automatic pool started");
        Ok(())
    }

    async fn quit(&self) {
        self.core.begin_quit();
        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }
        let instances: Vec<Arc<dyn Instance>> = {
            let mut state = self.state.lock().await;
            state.instances.drain().map(|(_, inst)| inst).collect()
        };
        self.core.notify_capacity();
        for inst in instances {
            let _ = inst.quit(true, false).await;
        }
        info!("automatic pool stopped");
    }

    async fn instance_count(&self) -> usize {
        self.state.lock().await.instances.len()
    }
}
