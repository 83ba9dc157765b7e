use parking_lot::Mutex;
use serde::Serialize;

/// Value copy of the task-manager state, as served by `/api/progress`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressSnapshot {
    pub is_running: bool,
    pub total: usize,
    pub current: usize,
    pub current_feed: Option<String>,
}

/// Shared refresh progress.
///
/// One mutex, no exposed fields; every exported method is a single atomic
/// operation so readers can only ever observe consistent values. `current`
/// is monotonic within a batch.
#[derive(Default)]
pub struct TaskManager {
    inner: Mutex<ProgressSnapshot>,
}

impl TaskManager {
    /// Mark a batch as running and grow the work count.
    ///
    /// Called synchronously by the refresh endpoint before it returns, so
    /// the very next progress poll already shows `is_running = true`. Safe
    /// to call while a batch is active: the new work folds into it.
    pub fn start_batch(&self, additional: usize) {
        let mut inner = self.inner.lock();
        inner.is_running = true;
        inner.total += additional;
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().is_running
    }

    pub fn set_current_feed(&self, name: &str) {
        self.inner.lock().current_feed = Some(name.to_owned());
    }

    /// One feed finished (in either direction).
    pub fn increment(&self) {
        let mut inner = self.inner.lock();
        inner.current += 1;
    }

    /// Atomically detect batch completion.
    ///
    /// Exactly one caller gets `true` per batch; it is responsible for the
    /// completion side effects (timestamp stamp, retention pass).
    pub fn try_complete(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.is_running && inner.current >= inner.total {
            *inner = ProgressSnapshot::default();
            true
        } else {
            false
        }
    }

    /// Forced reset, used on shutdown.
    pub fn reset(&self) {
        *self.inner.lock() = ProgressSnapshot::default();
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.inner.lock().clone()
    }
}
