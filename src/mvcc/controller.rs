use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use tracing::debug;
use crate::core::types::Timestamp;

/// Pinned snapshot: reads through this view see every version committed at
/// or before `timestamp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadView {
    pub id: u64,
    pub timestamp: Timestamp,
}

/// Hands out commit timestamps, tracks the committed watermark and the
/// active read views, and serializes the validate+apply phase of commits.
pub struct MVCCController {
    last_issued: AtomicU64,
    committed: AtomicU64,
    next_view_id: AtomicU64,
    active_reads: Mutex<HashMap<u64, Timestamp>>,
    commit_lock: Mutex<()>,
}

impl MVCCController {
    pub fn new() -> Self {
        MVCCController {
            last_issued: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            next_view_id: AtomicU64::new(1),
            active_reads: Mutex::new(HashMap::new()),
            commit_lock: Mutex::new(()),
        }
    }

    /// Strictly greater than every timestamp issued before, even when called
    /// concurrently or when the wall clock goes backwards.
    pub fn next_timestamp(&self) -> Timestamp {
        let now = Utc::now().timestamp_micros().max(0) as u64;
        let previous = self
            .last_issued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }

    pub fn last_committed(&self) -> Timestamp {
        self.committed.load(Ordering::SeqCst)
    }

    /// Advance the committed watermark to `timestamp` if it is newer.
    pub fn mark_committed(&self, timestamp: Timestamp) {
        let mut current = self.committed.load(Ordering::SeqCst);
        while timestamp > current {
            match self.committed.compare_exchange(current, timestamp, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Pin a read view at the current watermark.
    pub fn begin_read(&self) -> ReadView {
        let id = self.next_view_id.fetch_add(1, Ordering::SeqCst);
        let mut active = self.active_reads.lock();
        let timestamp = self.last_committed();
        active.insert(id, timestamp);
        ReadView { id, timestamp }
    }

    pub fn release_read(&self, view: &ReadView) {
        if self.active_reads.lock().remove(&view.id).is_some() {
            debug!(view = view.id, timestamp = view.timestamp, "read view released");
        }
    }

    pub fn active_read_count(&self) -> usize {
        self.active_reads.lock().len()
    }

    /// Oldest timestamp any active read view can still observe; versions
    /// superseded before it may be vacuumed.
    pub fn vacuum_horizon(&self) -> Timestamp {
        let active = self.active_reads.lock();
        active
            .values()
            .copied()
            .min()
            .unwrap_or_else(|| self.last_committed())
    }

    /// Held across validation and application of one Transaction Set so that
    /// concurrent sets commit one at a time.
    pub fn commit_guard(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }
}

impl Default for MVCCController {
    fn default() -> Self {
        Self::new()
    }
}
