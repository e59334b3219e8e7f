//! Per-instance HTTP listener.
//!
//! `InstanceListener` owns one local port bound on behalf of a pool slot
//! and forwards requests to a swappable handler. The pool swaps the
//! handler when it replaces the slot's instance, or parks the port on a
//! fixed error status while the slot is suspended.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use corral_instance::{Request, Response};
use http::StatusCode;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error};

use crate::convert;

/// Callback type for routing requests to the slot's current instance.
///
/// The pool provides this callback; it dispatches the request to the
/// instance currently occupying the slot and maps scheduling failures to
/// error responses itself.
pub type RequestHandler = Arc<dyn Fn(Request) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Response> + Send>>;

enum ListenerState {
    Serving(RequestHandler),
    Unavailable(StatusCode),
}

/// HTTP listener owning one local port on behalf of a pool slot.
pub struct InstanceListener {
    local_addr: SocketAddr,
    state: Arc<Mutex<ListenerState>>,
    shutdown_tx: watch::Sender<bool>,
}

impl InstanceListener {
    /// Bind an ephemeral port on `host` and start serving into `handler`.
    pub async fn bind(host: &str, handler: RequestHandler) -> anyhow::Result<Self> {
        let listener = TcpListener::bind((host, 0))
            .await
            .context("failed to bind instance listener")?;
        let local_addr = listener
            .local_addr()
            .context("instance listener has no local address")?;
        let state = Arc::new(Mutex::new(ListenerState::Serving(handler)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(accept_loop(listener, state.clone(), shutdown_rx));
        debug!(addr = %local_addr, "instance listener bound");

        Ok(InstanceListener {
            local_addr,
            state,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Swap in a new handler, typically after replacing the slot's
    /// instance.
    pub async fn set_handler(&self, handler: RequestHandler) {
        *self.state.lock().await = ListenerState::Serving(handler);
    }

    /// Park the port on a fixed error status.
    pub async fn set_unavailable(&self, status: StatusCode) {
        *self.state.lock().await = ListenerState::Unavailable(status);
    }

    /// Stop accepting connections. In-flight requests finish on their own
    /// tasks. Dropping the listener has the same effect.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<Mutex<ListenerState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, peer_addr) = match accept_result {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        continue;
                    }
                };
                let state = state.clone();

                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let svc = service_fn(move |req: hyper::Request<Incoming>| {
                        let state = state.clone();
                        async move {
                            Ok::<_, hyper::Error>(dispatch(req, peer_addr, &state).await)
                        }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                        error!(%peer_addr, error = %e, "connection error");
                    }
                });
            }
            _ = shutdown.changed() => {
                debug!("instance listener shutting down");
                break;
            }
        }
    }
}

async fn dispatch(
    req: hyper::Request<Incoming>,
    peer_addr: SocketAddr,
    state: &Mutex<ListenerState>,
) -> hyper::Response<Full<Bytes>> {
    let request = match convert::request_from_hyper(req, peer_addr.ip()).await {
        Ok(request) => request,
        Err(e) => {
            error!(%peer_addr, error = %e, "failed to read request");
            return convert::response_to_hyper(Response::text(
                StatusCode::BAD_REQUEST,
                "malformed request",
            ));
        }
    };

    // Clone the handler out so the state lock is not held across dispatch.
    let handler = {
        let state = state.lock().await;
        match &*state {
            ListenerState::Serving(handler) => handler.clone(),
            ListenerState::Unavailable(status) => {
                return convert::response_to_hyper(Response::new(*status));
            }
        }
    };

    convert::response_to_hyper(handler(request).await)
}

/// Create a simple echo handler for testing.
///
/// Returns the request method and path as the response body.
pub fn echo_handler() -> RequestHandler {
    Arc::new(|req: Request| {
        Box::pin(async move {
            let body = format!("{} {}", req.method, req.path);
            Response::text(StatusCode::OK, body)
        })
    })
}
