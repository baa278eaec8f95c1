//! Batch progress that can be polled from another thread.
//!
//! A [`ProgressState`] is owned by the caller and passed into the batch by
//! reference. The batch writes it as tracks complete; a UI thread reads
//! [`ProgressState::snapshot`] at any time. Updates go through an `RwLock`
//! so a reader never sees a half-written snapshot.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

/// What a poller sees.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// 0-100, never decreases within one batch
    pub percent: u32,
    pub current_step: String,
    pub running: bool,
}

#[derive(Debug, Default)]
struct Published {
    snapshot: ProgressSnapshot,
    /// Completion count the snapshot was written for
    done: u32,
}

/// Shared progress for one batch run at a time.
#[derive(Debug, Default)]
pub struct ProgressState {
    published: RwLock<Published>,
    completed: AtomicU32,
    total: AtomicU32,
    cancelled: AtomicBool,
}

impl ProgressState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current progress.
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.read().snapshot.clone()
    }

    /// Request cooperative cancellation of the current (or next) batch.
    /// Tracks already running finish; tracks not yet started are skipped.
    ///
    /// A batch consumes the request when it finishes or is rejected. A
    /// request that arrives after the running batch has finished applies
    /// to the next batch.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Reset for a new batch of `total` units.
    pub(crate) fn begin(&self, total: u32, step: &str) {
        self.completed.store(0, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
        let mut published = self.write();
        published.done = 0;
        published.snapshot = ProgressSnapshot {
            percent: 0,
            current_step: step.to_string(),
            running: true,
        };
    }

    /// Record one completed unit. Returns the number completed so far.
    ///
    /// Safe to call from several workers. Workers may reach the lock out
    /// of order; a stale count never overwrites a newer one, so percent is
    /// only ever raised.
    pub(crate) fn complete_one(&self, label: &str) -> u32 {
        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        let total = self.total.load(Ordering::SeqCst).max(1);

        let mut published = self.write();
        if done > published.done {
            published.done = done;
            published.snapshot.percent = percent_of(done, total);
            published.snapshot.current_step = format!("{}: {}/{}", label, done, total);
        }
        done
    }

    /// Mark the batch as finished and consume any cancel request.
    /// Returns whether the batch was cancelled.
    pub(crate) fn finish(&self, done_step: &str, cancelled_step: &str) -> bool {
        let cancelled = self.cancelled.swap(false, Ordering::SeqCst);
        let mut published = self.write();
        published.snapshot.percent = 100;
        let step = if cancelled { cancelled_step } else { done_step };
        published.snapshot.current_step = step.to_string();
        published.snapshot.running = false;
        cancelled
    }

    /// Drop a pending cancel request without touching the snapshot.
    pub(crate) fn clear_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    fn read(&self) -> RwLockReadGuard<'_, Published> {
        self.published.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Published> {
        self.published.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// round(done / total * 100). Only a complete batch reads 100; anything
/// short of that is capped at 99.
pub fn percent_of(done: u32, total: u32) -> u32 {
    if done >= total {
        return 100;
    }
    ((done as f64 / total as f64 * 100.0).round() as u32).min(99)
}
