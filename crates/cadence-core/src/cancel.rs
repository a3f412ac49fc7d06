//! Cancellation registry — sticky per-side record of cancelled jobs.
//!
//! The broker and the dispatcher each own one. They are never reconciled:
//! each side consults only its own registry before acting on a job, and a
//! mark, once set, is never cleared for that id. Job ids are never reused,
//! so the set only grows for the lifetime of its owner.

use dashmap::DashSet;

use crate::job::JobId;

#[derive(Debug, Default)]
pub struct CancellationRegistry {
    cancelled: DashSet<JobId>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `id` cancelled. Returns true the first time, false on repeats.
    pub fn cancel(&self, id: &JobId) -> bool {
        self.cancelled.insert(id.clone())
    }

    pub fn is_cancelled(&self, id: &JobId) -> bool {
        self.cancelled.contains(id)
    }

    pub fn len(&self) -> usize {
        self.cancelled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cancelled.is_empty()
    }
}
