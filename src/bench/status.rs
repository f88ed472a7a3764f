//! Trial lifecycle states and the events trials emit.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::ThroughputSampler;

/// Lifecycle state of a trial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialStatus {
    NotStarted,
    Started,
    InitializingBuffer,
    PurgingCache,
    WarmingUp,
    Running,
    Completed,
    Interrupted,
    InsufficientMemory,
}

impl TrialStatus {
    /// Whether the trial can no longer make progress
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TrialStatus::Completed | TrialStatus::Interrupted | TrialStatus::InsufficientMemory
        )
    }

    pub fn description(self) -> &'static str {
        match self {
            TrialStatus::NotStarted => "Not started",
            TrialStatus::Started => "Started",
            TrialStatus::InitializingBuffer => "Initializing buffer",
            TrialStatus::PurgingCache => "Purging cache",
            TrialStatus::WarmingUp => "Warming up",
            TrialStatus::Running => "Running",
            TrialStatus::Completed => "Completed",
            TrialStatus::Interrupted => "Interrupted",
            TrialStatus::InsufficientMemory => "Insufficient memory",
        }
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Kind of measurement a trial performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialKind {
    SequentialWrite,
    SequentialRead,
    RandomRead,
    RandomWrite,
    MemoryCopy,
}

impl TrialKind {
    pub fn is_random(self) -> bool {
        matches!(self, TrialKind::RandomRead | TrialKind::RandomWrite)
    }

    pub fn is_read(self) -> bool {
        matches!(self, TrialKind::SequentialRead | TrialKind::RandomRead)
    }

    pub fn is_write(self) -> bool {
        matches!(self, TrialKind::SequentialWrite | TrialKind::RandomWrite)
    }

    pub fn description(self) -> &'static str {
        match self {
            TrialKind::SequentialWrite => "Sequential write",
            TrialKind::SequentialRead => "Sequential read",
            TrialKind::RandomRead => "Random read",
            TrialKind::RandomWrite => "Random write",
            TrialKind::MemoryCopy => "Memory copy",
        }
    }
}

impl fmt::Display for TrialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Status or progress event emitted by a trial
#[derive(Debug, Clone)]
pub struct TrialUpdate {
    /// Position of the trial within its suite
    pub trial_index: usize,
    pub name: String,
    pub kind: TrialKind,
    pub status: TrialStatus,
    /// Displayed progress in percent, present on progress events
    pub progress_percent: Option<f64>,
    /// Smoothed rate of the most recent samples in MB/s
    pub recent_rate: Option<f64>,
    /// Milliseconds since the trial started
    pub elapsed_ms: Option<u64>,
    /// Complete samples, only on `Completed`
    pub results: Option<Arc<ThroughputSampler>>,
}

impl TrialUpdate {
    /// Whether this is a progress event rather than a state change
    pub fn is_progress(&self) -> bool {
        self.progress_percent.is_some()
    }
}

/// Callback receiving trial events on the worker thread
pub type ProgressSink = Arc<dyn Fn(&TrialUpdate) + Send + Sync>;
