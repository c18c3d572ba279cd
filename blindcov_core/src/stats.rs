use crate::coverage::CoverageSample;
use crate::persist::{PersistError, atomic_write};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// How a candidate's coverage compares with the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Improved,
    Regressed,
    Neutral,
}

#[derive(Error, Debug)]
pub enum ResumeError {
    #[error("Failed to read state file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("State file {path:?} is not valid JSON statistics: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("State file {path:?} has min {min} above max {max}")]
    Inconsistent { path: PathBuf, min: u64, max: u64 },
}

/// Sliding coverage window plus every block seen so far.
///
/// Only `min`, `max` and `avg` are persisted; the block set lives for the
/// process lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningStatistics {
    pub min: u64,
    pub max: u64,
    pub avg: f64,
    #[serde(skip)]
    pub seen_blocks: HashSet<String>,
}

impl RunningStatistics {
    pub fn new(min: u64, max: u64, avg: f64) -> Self {
        Self {
            min,
            max,
            avg,
            seen_blocks: HashSet::new(),
        }
    }

    /// Window spanned by bootstrap samples. The average is taken over the
    /// distinct values observed. `None` when there are no samples.
    pub fn from_samples(samples: &[CoverageSample], non_uniques: bool) -> Option<Self> {
        let distinct: BTreeSet<u64> = samples.iter().map(|s| s.metric(non_uniques)).collect();
        let min = *distinct.first()?;
        let max = *distinct.last()?;
        let avg = distinct.iter().sum::<u64>() as f64 / distinct.len() as f64;
        Some(Self::new(min, max, avg))
    }

    pub fn classify(&self, count: u64) -> Verdict {
        if count > self.max {
            Verdict::Improved
        } else if count < self.min {
            Verdict::Regressed
        } else {
            Verdict::Neutral
        }
    }

    /// Slides the window up after an acceptance: the previous maximum
    /// becomes the new minimum.
    pub fn rebase(&mut self, old_max: u64, new_max: u64) {
        self.max = new_max;
        self.min = old_max;
        self.avg = (self.max + self.min) as f64 / 2.0;
    }

    pub fn has_unseen_blocks(&self, blocks: &HashSet<String>) -> bool {
        blocks.iter().any(|b| !self.seen_blocks.contains(b))
    }

    pub fn absorb_blocks(&mut self, blocks: &HashSet<String>) {
        self.seen_blocks.extend(blocks.iter().cloned());
    }
}

impl fmt::Display for RunningStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Min {}, Max {}, Avg {:.6}", self.min, self.max, self.avg)
    }
}

/// JSON checkpoint `{min, max, avg}` used to resume a campaign.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn load(&self) -> Result<RunningStatistics, ResumeError> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| ResumeError::Io {
            path: self.path.clone(),
            source,
        })?;
        let stats: RunningStatistics =
            serde_json::from_str(&content).map_err(|source| ResumeError::Json {
                path: self.path.clone(),
                source,
            })?;
        if stats.min > stats.max {
            return Err(ResumeError::Inconsistent {
                path: self.path.clone(),
                min: stats.min,
                max: stats.max,
            });
        }
        Ok(stats)
    }

    pub fn save(&self, stats: &RunningStatistics) -> Result<(), PersistError> {
        let json = serde_json::to_vec(stats).map_err(|e| PersistError {
            path: self.path.clone(),
            source: e.into(),
        })?;
        atomic_write(&self.path, &json)
    }
}
