use crate::stats::RunningStatistics;
use std::collections::VecDeque;

/// Search state captured just before a template was superseded.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSnapshot {
    pub template: Vec<u8>,
    pub stats: RunningStatistics,
    pub generation_value: i64,
}

/// Bounded rollback stack: pushing past capacity evicts the oldest entry,
/// popping returns the newest.
#[derive(Debug, Clone)]
pub struct GenerationHistory {
    capacity: usize,
    snapshots: VecDeque<GenerationSnapshot>,
}

impl GenerationHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            snapshots: VecDeque::with_capacity(capacity),
        }
    }

    /// Follows a live change of `max-generations`, trimming the oldest
    /// snapshots if the history shrank.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.snapshots.len() > self.capacity {
            self.snapshots.pop_front();
        }
    }

    pub fn push(&mut self, template: Vec<u8>, stats: RunningStatistics, generation_value: i64) {
        if self.snapshots.len() >= self.capacity {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(GenerationSnapshot {
            template,
            stats,
            generation_value,
        });
    }

    pub fn pop_latest(&mut self) -> Option<GenerationSnapshot> {
        self.snapshots.pop_back()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
