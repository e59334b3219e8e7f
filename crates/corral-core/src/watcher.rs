//! Change detection contracts and a polling mtime watcher.
//!
//! Pool control loops poll two sources once per tick: a `ConfigSource`
//! for structured manifest changes and a `ChangeWatcher` for raw file
//! changes under the application root. Both report-and-clear, so a
//! change is observed by exactly one tick.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::debug;
use walkdir::WalkDir;

/// A kind of configuration change observed between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeKind {
    /// URL handler table changed.
    Handlers,
    /// Environment variables changed.
    EnvVariables,
    /// Declared library dependencies changed.
    Libraries,
    /// Skip-files patterns changed.
    SkipFiles,
    /// Inbound service list changed. Takes effect without a restart.
    InboundServices,
}

impl ChangeKind {
    /// True if running instances must be replaced for the change to take
    /// effect.
    pub fn requires_restart(self) -> bool {
        !matches!(self, ChangeKind::InboundServices)
    }
}

/// Source of structured configuration changes.
pub trait ConfigSource: Send + Sync {
    /// Changes accumulated since the previous call. Calling this clears
    /// the pending set.
    fn check_for_updates(&self) -> BTreeSet<ChangeKind>;
}

/// Source of raw application file changes.
pub trait ChangeWatcher: Send + Sync {
    /// True if any watched file changed since the previous call. Calling
    /// this clears the pending state.
    fn has_changes(&self) -> bool;
}

/// Polling watcher that walks a directory tree and compares entry counts
/// and the newest modification time against the previous scan.
pub struct MtimeWatcher {
    root: PathBuf,
    last_scan: Mutex<Scan>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct Scan {
    entries: usize,
    newest: Option<SystemTime>,
}

impl MtimeWatcher {
    /// Create a watcher rooted at `root`. The initial scan establishes the
    /// baseline, so pre-existing files are not reported as changes.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let baseline = scan(&root);
        MtimeWatcher {
            root,
            last_scan: Mutex::new(baseline),
        }
    }
}

impl ChangeWatcher for MtimeWatcher {
    fn has_changes(&self) -> bool {
        let current = scan(&self.root);
        let mut last = match self.last_scan.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let changed = current.entries != last.entries || current.newest > last.newest;
        *last = current;
        if changed {
            debug!(root = %self.root.display(), "watched files changed");
        }
        changed
    }
}

fn scan(root: &std::path::Path) -> Scan {
    let mut entries = 0;
    let mut newest = None;
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        entries += 1;
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if let Ok(modified) = metadata.modified() {
            if newest.is_none_or(|prev| modified > prev) {
                newest = Some(modified);
            }
        }
    }
    Scan { entries, newest }
}

/// Watcher and config source that never report changes. Stands in when
/// change-driven restarts are disabled or not wired up.
pub struct Unchanging;

impl ChangeWatcher for Unchanging {
    fn has_changes(&self) -> bool {
        false
    }
}

impl ConfigSource for Unchanging {
    fn check_for_updates(&self) -> BTreeSet<ChangeKind> {
        BTreeSet::new()
    }
}
