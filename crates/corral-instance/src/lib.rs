//! Contracts between corral pools and the runtime hosting the instances.
//!
//! A pool never runs application code itself. It schedules requests onto
//! `Instance` handles produced by an `InstanceLauncher`, and talks to them
//! through the request and response value types defined here. Runtimes
//! implement the two traits; everything else in the workspace is generic
//! over them.

pub mod contract;
pub mod types;

pub use contract::{HandleError, Instance, InstanceLauncher, QuitDeclined, RestartPolicy};
pub use types::{
    INTERACTIVE_SOURCE, InstanceId, LIFECYCLE_SOURCE, LifecycleSignal, Request, RequestKind,
    Response,
};
