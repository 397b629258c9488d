//! Progress and completion bookkeeping for one session.

use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Snapshot passed to progress listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub sofar: u64,
    pub total: u64,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        self.sofar == self.total
    }
}

/// Callback invoked once per completed blob transfer.
pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

/// Counts finished transfers in both directions.
///
/// Updates are serialized under one lock, and the listener runs while it is
/// held, so listeners observe `sofar` strictly increasing.
pub struct ProgressTracker {
    total: u64,
    sofar: Mutex<u64>,
    listener: Option<ProgressFn>,
}

impl ProgressTracker {
    pub fn new(total: u64, listener: Option<ProgressFn>) -> Self {
        Self {
            total,
            sofar: Mutex::new(0),
            listener,
        }
    }

    /// Record one finished blob and notify the listener.
    pub fn advance(&self) -> Progress {
        let mut sofar = self.sofar.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert!(*sofar < self.total, "progress beyond planned total");
        *sofar = (*sofar + 1).min(self.total);

        let progress = Progress {
            sofar: *sofar,
            total: self.total,
        };
        if let Some(listener) = &self.listener {
            listener(progress);
        }
        progress
    }

    pub fn snapshot(&self) -> Progress {
        Progress {
            sofar: *self.sofar.lock().unwrap_or_else(|e| e.into_inner()),
            total: self.total,
        }
    }
}
