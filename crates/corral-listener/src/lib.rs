//! Per-instance HTTP listener for corral.
//!
//! Pools that address instances individually (manual and basic scaling)
//! bind one listener per instance slot, so external callers can reach a
//! specific instance by port. The listener forwards requests to a
//! swappable handler installed by the pool.
//!
//! # Architecture
//!
//! ```text
//! client → instance port
//!   │
//!   ▼
//! InstanceListener (hyper http1)
//!   │
//!   ├── Serving(handler)     → pool's targeted route → instance
//!   └── Unavailable(status)  → fixed error status (slot suspended
//!                              or mid-replacement)
//! ```
//!
//! Handlers are swapped in place when a slot's instance is replaced, so
//! the port an instance was advertised on stays valid across restarts.

pub mod convert;
pub mod server;

pub use server::{InstanceListener, RequestHandler};
