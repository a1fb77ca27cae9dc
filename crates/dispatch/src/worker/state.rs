//! Worker lifecycle states

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// What a worker is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkerState {
    /// Spawned but not yet polling the queue
    Idle = 0,
    /// Waiting for a task
    Dequeuing = 1,
    /// Holding a task, waiting for a rate limit token
    RateLimited = 2,
    /// Running a task body
    Executing = 3,
    /// Handing a result to the merger
    Publishing = 4,
    /// Loop finished; the worker's result channel is closed
    Exited = 5,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Dequeuing,
            2 => Self::RateLimited,
            3 => Self::Executing,
            4 => Self::Publishing,
            _ => Self::Exited,
        }
    }

    /// Whether the worker may be holding a task
    pub fn holds_task(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Executing | Self::Publishing)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Dequeuing => write!(f, "dequeuing"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Executing => write!(f, "executing"),
            Self::Publishing => write!(f, "publishing"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// Lock-free cell the engine reads while the worker writes
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(WorkerState::Idle as u8))
    }

    pub(crate) fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}
