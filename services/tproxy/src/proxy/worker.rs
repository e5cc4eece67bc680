//! Shared connection accounting.
//!
//! The worker owns the active connection count and a human-readable status
//! line. Sessions never touch it directly: they go through a
//! [`ConnectionTracker`], which performs the count change and the status
//! refresh together under one lock. No `.await` happens while it is held.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

/// Worker capability consumed by sessions.
pub trait Worker: Send {
    fn increment_active(&mut self);
    fn decrement_active(&mut self);
    /// Recompute the status line from the current count.
    fn refresh_status(&mut self);
    fn active(&self) -> usize;
    fn status(&self) -> &str;
}

/// Default worker: a named connection counter.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    name: String,
    active: usize,
    status: String,
}

impl WorkerStatus {
    pub fn new(name: impl Into<String>) -> Self {
        let mut worker = Self {
            name: name.into(),
            active: 0,
            status: String::new(),
        };
        worker.refresh_status();
        worker
    }
}

impl Worker for WorkerStatus {
    fn increment_active(&mut self) {
        self.active += 1;
    }

    fn decrement_active(&mut self) {
        self.active = self.active.saturating_sub(1);
    }

    fn refresh_status(&mut self) {
        let plural = if self.active == 1 { "" } else { "s" };
        self.status = format!(
            "{} [{} active connection{}]",
            self.name, self.active, plural
        );
        trace!(status = %self.status, "Worker status refreshed");
    }

    fn active(&self) -> usize {
        self.active
    }

    fn status(&self) -> &str {
        &self.status
    }
}

/// Cloneable, lock-guarded handle to the worker.
#[derive(Clone)]
pub struct ConnectionTracker {
    worker: Arc<Mutex<dyn Worker>>,
}

impl ConnectionTracker {
    pub fn new<W: Worker + 'static>(worker: W) -> Self {
        let worker: Arc<Mutex<dyn Worker>> = Arc::new(Mutex::new(worker));
        Self { worker }
    }

    fn lock(&self) -> MutexGuard<'_, dyn Worker + 'static> {
        // Count updates are single statements, so a poisoned lock still holds a usable value.
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count a session in. The returned guard counts it out when dropped.
    pub fn enter(&self) -> ActiveGuard {
        {
            let mut worker = self.lock();
            worker.increment_active();
            worker.refresh_status();
        }
        ActiveGuard {
            tracker: self.clone(),
        }
    }

    fn leave(&self) {
        let mut worker = self.lock();
        worker.decrement_active();
        worker.refresh_status();
    }

    /// Current number of active sessions.
    pub fn active(&self) -> usize {
        self.lock().active()
    }

    /// Current status line.
    pub fn status(&self) -> String {
        self.lock().status().to_string()
    }
}

impl std::fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTracker")
            .field("active", &self.active())
            .finish()
    }
}

/// Balances one [`ConnectionTracker::enter`].
///
/// Dropping it is the only way to count a session out, so the pair stays
/// balanced on early returns, panics, and aborted tasks alike.
#[must_use = "dropping the guard immediately counts the session out"]
pub struct ActiveGuard {
    tracker: ConnectionTracker,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.tracker.leave();
    }
}
