//! Request and response value types shared by pools and instances.
//!
//! These are deliberately decoupled from any one server frontend: a pool
//! can receive traffic from a hyper listener, a test harness, or its own
//! synthetic lifecycle machinery, and dispatches all of it in the same
//! shape.

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// Source address stamped on synthetic lifecycle requests so instances can
/// tell pool-originated traffic from user traffic.
pub const LIFECYCLE_SOURCE: IpAddr = IpAddr::V4(Ipv4Addr::new(0, 1, 0, 3));

/// Source address stamped on interactive command requests (RFC 5737
/// documentation range).
pub const INTERACTIVE_SOURCE: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 0));

/// Classification of a request arriving at a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Ordinary user traffic.
    Normal,
    /// Readiness traffic, i.e. start and warmup signals.
    Ready,
    /// Background work addressed to a specific instance.
    Background,
    /// A command evaluated by an interactive session.
    Interactive,
    /// The graceful stop signal.
    Shutdown,
}

impl RequestKind {
    /// True if the request counts toward outstanding-request accounting
    /// and the load history.
    pub fn counts_outstanding(self) -> bool {
        !matches!(self, RequestKind::Ready | RequestKind::Shutdown)
    }
}

/// Synthetic lifecycle traffic sent by the pools themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// First-request readiness signal for lazily started instances.
    Start,
    /// Pre-traffic warmup for automatically scaled instances.
    Warmup,
    /// Graceful stop, sent ahead of a forced quit.
    Stop,
}

impl LifecycleSignal {
    pub fn path(self) -> &'static str {
        match self {
            LifecycleSignal::Start => "/start",
            LifecycleSignal::Warmup => "/warmup",
            LifecycleSignal::Stop => "/stop",
        }
    }

    /// Request kind the signal is dispatched with.
    pub fn kind(self) -> RequestKind {
        match self {
            LifecycleSignal::Start | LifecycleSignal::Warmup => RequestKind::Ready,
            LifecycleSignal::Stop => RequestKind::Shutdown,
        }
    }
}

/// A request as the pools see it.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Peer address the request arrived from.
    pub remote_addr: IpAddr,
    /// Synthetic requests are marked trusted so authorization layers in
    /// the instance admit them.
    pub trusted: bool,
    pub logged_in: bool,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Request {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            trusted: false,
            logged_in: false,
        }
    }

    /// Synthetic lifecycle request for one instance.
    pub fn lifecycle(signal: LifecycleSignal) -> Self {
        Request {
            method: Method::GET,
            path: signal.path().to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: LIFECYCLE_SOURCE,
            trusted: true,
            logged_in: true,
        }
    }

    /// Synthetic interactive-command request carrying the payload to
    /// evaluate.
    pub fn interactive(payload: impl Into<Bytes>) -> Self {
        Request {
            method: Method::POST,
            path: "/".to_string(),
            headers: HeaderMap::new(),
            body: payload.into(),
            remote_addr: INTERACTIVE_SOURCE,
            trusted: true,
            logged_in: true,
        }
    }
}

/// A response as produced by an instance or by the pool itself.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Response {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Plain-text response with the given status.
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        Response {
            status,
            headers,
            body: Bytes::from(body.into()),
        }
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Response::text(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Response::text(StatusCode::NOT_FOUND, message)
    }

    /// Body decoded as text, lossily.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Status line such as "500 Internal Server Error", used when
    /// surfacing command failures as text.
    pub fn status_line(&self) -> String {
        match self.status.canonical_reason() {
            Some(reason) => format!("{} {}", self.status.as_u16(), reason),
            None => self.status.as_u16().to_string(),
        }
    }
}

/// Identifier of one instance within a pool.
///
/// Automatically scaled pools generate opaque ids; the array-addressed
/// variants use the slot index so external callers can target a specific
/// instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(String);

impl InstanceId {
    /// Random 36-character lowercase hex id.
    pub fn generate() -> Self {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let id = (0..36)
            .map(|_| HEX[rand::random::<u8>() as usize % 16] as char)
            .collect();
        InstanceId(id)
    }

    /// Slot-index id for array-addressed pools.
    pub fn index(n: usize) -> Self {
        InstanceId(n.to_string())
    }

    /// The slot index, if this id is one.
    pub fn as_index(&self) -> Option<usize> {
        self.0.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
