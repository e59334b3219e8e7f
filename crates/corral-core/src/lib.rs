//! Shared configuration and change detection for corral.
//!
//! Provides the pieces every scaling variant consumes:
//!
//! - **App configuration**: `app.toml` parsing and resolution of the
//!   per-variant scaling parameters with their documented defaults
//! - **Change detection**: the `ConfigSource` and `ChangeWatcher` polling
//!   contracts used by pool control loops, plus `MtimeWatcher`, a
//!   walkdir-based polling implementation

pub mod config;
pub mod watcher;

pub use config::{
    AppConfig, AutomaticParams, BasicParams, ManualParams, ScalingMode, ScalingParams,
};
pub use watcher::{ChangeKind, ChangeWatcher, ConfigSource, MtimeWatcher, Unchanging};
