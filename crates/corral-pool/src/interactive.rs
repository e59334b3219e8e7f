//! Interactive command pool.
//!
//! Manages a single lazily started instance so that an operator's
//! commands share one session's state. Commands queue behind each other
//! inside the instance; a command that cannot get the session within
//! the command budget fails rather than spawning a second instance.

use std::sync::Arc;

use async_trait::async_trait;
use corral_instance::{
    HandleError, Instance, InstanceId, InstanceLauncher, Request, RequestKind, Response,
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::Pool;
use crate::core::{PoolCore, PoolOptions, static_change_sources};
use crate::error::{PoolError, PoolResult};

pub struct InteractivePool {
    core: Arc<PoolCore>,
    current: Mutex<Option<Arc<dyn Instance>>>,
}

impl InteractivePool {
    pub fn new(launcher: Arc<dyn InstanceLauncher>, options: PoolOptions) -> Arc<Self> {
        let (watcher, config_source) = static_change_sources();
        Arc::new(InteractivePool {
            core: Arc::new(PoolCore::new(launcher, watcher, config_source, options)),
            current: Mutex::new(None),
        })
    }

    /// Run one command against the session instance, creating it on
    /// first use.
    async fn dispatch_command(&self, request: Request) -> PoolResult<Response> {
        let deadline = Instant::now() + self.core.options().command_timeout;
        loop {
            if Instant::now() >= deadline {
                return Err(PoolError::RouteTimeout);
            }
            if self.core.is_quitting() {
                return Err(PoolError::Unavailable);
            }
            let (inst, is_new) = {
                let mut current = self.current.lock().await;
                match &*current {
                    Some(inst) => (inst.clone(), false),
                    None => {
                        let inst = self
                            .core
                            .launcher()
                            .new_instance(InstanceId::generate(), false);
                        *current = Some(inst.clone());
                        (inst, true)
                    }
                }
            };
            if is_new {
                debug!(instance_id = %inst.id(), "starting interactive instance");
                let _ = inst.start().await;
            }
            match inst.handle(request.clone(), RequestKind::Interactive).await {
                Ok(response) => return Ok(response),
                Err(HandleError::CannotAccept) => {
                    inst.wait(deadline).await;
                }
                Err(HandleError::Transport(e)) => {
                    let still_current = {
                        let mut current = self.current.lock().await;
                        let still = current
                            .as_ref()
                            .is_some_and(|c| Arc::ptr_eq(c, &inst));
                        if still {
                            *current = None;
                        }
                        still
                    };
                    if !still_current {
                        // Replaced mid-command by a restart.
                        return Err(PoolError::InstanceRestarted);
                    }
                    warn!(instance_id = %inst.id(), error = %e, "interactive instance failed");
                    let _ = inst.quit(true, false).await;
                    return Err(PoolError::Command(format!(
                        "Unexpected command failure: {e}"
                    )));
                }
            }
        }
    }

    /// Evaluate `payload` in the session and return the response body.
    /// Non-success responses become [`PoolError::Command`] with the
    /// status line and body merged into the message.
    pub async fn send_command(&self, payload: impl Into<String>) -> PoolResult<String> {
        let response = self.dispatch_command(Request::interactive(payload.into())).await?;
        if response.status != http::StatusCode::OK {
            let body = response.body_text();
            let message = if body.is_empty() {
                response.status_line()
            } else {
                format!("{}\n{}", response.status_line(), body)
            };
            return Err(PoolError::Command(message));
        }
        Ok(response.body_text())
    }
}

#[async_trait]
impl Pool for InteractivePool {
    async fn route(
        &self,
        request: Request,
        _kind: RequestKind,
        target: Option<&InstanceId>,
    ) -> Response {
        if target.is_some() {
            return Response::not_found("unknown instance");
        }
        match self.dispatch_command(request).await {
            Ok(response) => response,
            Err(PoolError::RouteTimeout) => Response::service_unavailable(
                "The command timed-out while waiting for another one to complete",
            ),
            Err(PoolError::InstanceRestarted) => Response::service_unavailable(
                "Instance was restarted while executing command",
            ),
            Err(e) => Response::service_unavailable(e.to_string()),
        }
    }

    async fn start(&self) -> PoolResult<()> {
        // The session instance is created on first command.
        Ok(())
    }

    async fn quit(&self) {
        self.core.begin_quit();
        if let Some(inst) = self.current.lock().await.take() {
            let _ = inst.quit(true, false).await;
        }
        info!("interactive pool stopped");
    }

    async fn instance_count(&self) -> usize {
        usize::from(self.current.lock().await.is_some())
    }

    async fn restart(&self) -> PoolResult<()> {
        let taken = self.current.lock().await.take();
        if let Some(inst) = taken {
            info!(instance_id = %inst.id(), "replacing interactive instance");
            let _ = inst.quit(true, false).await;
        }
        Ok(())
    }
}
