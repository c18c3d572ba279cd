use crate::mutator::{DiscardSet, IterationCursor};
use crate::stats::RunningStatistics;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// State shared between the search loop and the mutators, always taken
/// together under one lock and never held across a subprocess call.
#[derive(Debug)]
pub struct SharedState {
    pub stats: RunningStatistics,
    pub cursor: IterationCursor,
    pub discards: DiscardSet,
}

impl SharedState {
    pub fn new(stats: RunningStatistics) -> Self {
        Self {
            stats,
            cursor: IterationCursor::default(),
            discards: DiscardSet::default(),
        }
    }
}

/// Locks the shared state. A panic while the lock was held leaves the data
/// consistent, so a poisoned lock is taken over rather than propagated.
pub fn lock_shared(shared: &Mutex<SharedState>) -> MutexGuard<'_, SharedState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}
