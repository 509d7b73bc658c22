//! Completer - reference-counted interval barrier
//!
//! An interval job resets the completer to a new timestamp, enters it once per
//! sub-poll it submits, then arms it with [`Completer::make_ready`]. Each
//! sub-poll holds a [`CompleterTicket`] that captured the epoch at entry time,
//! so a poll still running when the next interval resets the completer leaves
//! the epoch it belongs to, never the new one.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

/// Result of one drained epoch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochSummary {
    pub name: String,
    pub stamp: DateTime<Utc>,
    /// Sub-polls entered during the epoch
    pub entered: usize,
    /// Sub-polls that left with a failure mark
    pub failed: usize,
}

type DrainCallback = Arc<dyn Fn(EpochSummary) + Send + Sync>;

struct Epoch {
    name: String,
    stamp: DateTime<Utc>,
    pending: AtomicUsize,
    entered: AtomicUsize,
    failed: AtomicUsize,
    ready: AtomicBool,
    fired: AtomicBool,
    on_drained: Option<DrainCallback>,
}

impl Epoch {
    fn new(name: &str, stamp: DateTime<Utc>, on_drained: Option<DrainCallback>) -> Self {
        Self {
            name: name.to_string(),
            stamp,
            pending: AtomicUsize::new(0),
            entered: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            ready: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            on_drained,
        }
    }

    /// Fire exactly once, when armed and nothing is pending
    fn try_fire(&self) {
        if !self.ready.load(Ordering::SeqCst) || self.pending.load(Ordering::SeqCst) != 0 {
            return;
        }
        if self
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let summary = EpochSummary {
            name: self.name.clone(),
            stamp: self.stamp,
            entered: self.entered.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        };
        debug!(
            "Completer {} drained @ {} ({} entered, {} failed)",
            summary.name, summary.stamp, summary.entered, summary.failed
        );
        if let Some(cb) = &self.on_drained {
            cb(summary);
        }
    }
}

/// Interval barrier
pub struct Completer {
    name: String,
    current: Mutex<Arc<Epoch>>,
    on_drained: Option<DrainCallback>,
}

impl std::fmt::Debug for Completer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completer")
            .field("name", &self.name)
            .field("stamp", &self.stamp())
            .field("pending", &self.pending())
            .field("drained", &self.is_drained())
            .finish()
    }
}

impl Completer {
    /// Create a completer whose initial epoch is already drained
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let epoch = Epoch::new(&name, Utc::now(), None);
        epoch.ready.store(true, Ordering::SeqCst);
        epoch.fired.store(true, Ordering::SeqCst);
        Self {
            name,
            current: Mutex::new(Arc::new(epoch)),
            on_drained: None,
        }
    }

    /// Call `f` once per drained epoch
    pub fn with_callback<F>(mut self, f: F) -> Self
    where
        F: Fn(EpochSummary) + Send + Sync + 'static,
    {
        self.on_drained = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Timestamp of the current epoch
    pub fn stamp(&self) -> DateTime<Utc> {
        self.current.lock().stamp
    }

    /// Sub-polls still outstanding in the current epoch
    pub fn pending(&self) -> usize {
        self.current.lock().pending.load(Ordering::SeqCst)
    }

    /// True once the current epoch is armed and every entry has left
    pub fn is_drained(&self) -> bool {
        self.current.lock().fired.load(Ordering::SeqCst)
    }

    /// Start a new epoch; tickets of the old one keep counting against it
    pub fn reset(&self, stamp: DateTime<Utc>) {
        let epoch = Arc::new(Epoch::new(&self.name, stamp, self.on_drained.clone()));
        let old = std::mem::replace(&mut *self.current.lock(), epoch);
        let left = old.pending.load(Ordering::SeqCst);
        if left > 0 {
            debug!(
                "Completer {} reset to {} with {} sub-polls of {} outstanding",
                self.name, stamp, left, old.stamp
            );
        }
    }

    /// Register one sub-poll in the current epoch
    ///
    /// Entering an epoch that already drained starts a fresh one.
    pub fn enter(&self) -> CompleterTicket {
        let mut current = self.current.lock();
        if current.fired.load(Ordering::SeqCst) {
            *current = Arc::new(Epoch::new(&self.name, Utc::now(), self.on_drained.clone()));
        }
        current.pending.fetch_add(1, Ordering::SeqCst);
        current.entered.fetch_add(1, Ordering::SeqCst);
        CompleterTicket {
            epoch: Arc::clone(&current),
            failed: false,
        }
    }

    /// Arm the current epoch; it drains when the last ticket leaves
    pub fn make_ready(&self) {
        let epoch = Arc::clone(&self.current.lock());
        epoch.ready.store(true, Ordering::SeqCst);
        epoch.try_fire();
    }
}

/// One sub-poll's hold on an epoch, released on drop
pub struct CompleterTicket {
    epoch: Arc<Epoch>,
    failed: bool,
}

impl std::fmt::Debug for CompleterTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompleterTicket")
            .field("completer", &self.epoch.name)
            .field("stamp", &self.epoch.stamp)
            .field("failed", &self.failed)
            .finish()
    }
}

impl CompleterTicket {
    /// Timestamp of the epoch this ticket belongs to
    pub fn stamp(&self) -> DateTime<Utc> {
        self.epoch.stamp
    }

    /// Count this sub-poll as failed when it leaves
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn leave(self) {}
}

impl Drop for CompleterTicket {
    fn drop(&mut self) {
        if self.failed {
            self.epoch.failed.fetch_add(1, Ordering::SeqCst);
        }
        if self.epoch.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.epoch.try_fire();
        }
    }
}
