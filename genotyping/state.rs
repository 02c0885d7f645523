// ========================================================================================
//                          Chunked job lifecycle tracking
// ========================================================================================
//
//   Planned -> Dispatched -> (per chunk: Pending -> Running -> Done | Failed)
//           -> AllDone | PartialFailure | Cancelled
//   AllDone -> Merged | MergeFailed
//
// Merged, MergeFailed, PartialFailure and Cancelled are terminal. Cancelled runs
// stay distinguishable from partial failures so a retry can tell "never completed"
// apart from "some chunks failed".

use std::fmt;
use thiserror::Error;

use crate::types::JobLabel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Planned,
    Dispatched,
    AllDone,
    PartialFailure,
    Cancelled,
    Merged,
    MergeFailed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::PartialFailure | Self::Cancelled | Self::Merged | Self::MergeFailed
        )
    }

    fn can_become(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Planned, Dispatched)
                | (Dispatched, AllDone)
                | (Dispatched, PartialFailure)
                | (Dispatched, Cancelled)
                | (AllDone, Merged)
                | (AllDone, MergeFailed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Planned => "PLANNED",
            Self::Dispatched => "DISPATCHED",
            Self::AllDone => "ALL_DONE",
            Self::PartialFailure => "PARTIAL_FAILURE",
            Self::Cancelled => "CANCELLED",
            Self::Merged => "MERGED",
            Self::MergeFailed => "MERGE_FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("{label}: cannot move from {from} to {to}")]
    InvalidTransition {
        label: String,
        from: JobState,
        to: JobState,
    },
    #[error("{label}: chunk {index} does not exist")]
    UnknownChunk { label: String, index: usize },
    #[error("{label}: chunk {index} cannot move from {from:?} to {to:?}")]
    InvalidChunkTransition {
        label: String,
        index: usize,
        from: ChunkState,
        to: ChunkState,
    },
}

/// Tracks one invocation of a chunked job.
#[derive(Debug, Clone)]
pub struct JobTracker {
    label: JobLabel,
    state: JobState,
    chunks: Vec<ChunkState>,
}

impl JobTracker {
    pub fn new(label: JobLabel, chunks: usize) -> Self {
        Self {
            label,
            state: JobState::Planned,
            chunks: vec![ChunkState::Pending; chunks],
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn chunk_state(&self, index: usize) -> Option<ChunkState> {
        self.chunks.get(index).copied()
    }

    pub fn count(&self, state: ChunkState) -> usize {
        self.chunks.iter().filter(|&&s| s == state).count()
    }

    fn transition(&mut self, next: JobState) -> Result<(), StateError> {
        if !self.state.can_become(next) {
            return Err(StateError::InvalidTransition {
                label: self.label.to_string(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    fn move_chunk(&mut self, index: usize, next: ChunkState) -> Result<(), StateError> {
        if self.state != JobState::Dispatched {
            return Err(StateError::InvalidTransition {
                label: self.label.to_string(),
                from: self.state,
                to: JobState::Dispatched,
            });
        }
        let label = &self.label;
        let current = self
            .chunks
            .get_mut(index)
            .ok_or_else(|| StateError::UnknownChunk {
                label: label.to_string(),
                index,
            })?;
        let allowed = matches!(
            (*current, next),
            (ChunkState::Pending, ChunkState::Running)
                | (ChunkState::Pending, ChunkState::Done)
                | (ChunkState::Pending, ChunkState::Failed)
                | (ChunkState::Running, ChunkState::Done)
                | (ChunkState::Running, ChunkState::Failed)
        );
        if !allowed {
            return Err(StateError::InvalidChunkTransition {
                label: label.to_string(),
                index,
                from: *current,
                to: next,
            });
        }
        *current = next;
        Ok(())
    }

    pub fn dispatched(&mut self) -> Result<(), StateError> {
        self.transition(JobState::Dispatched)
    }

    pub fn chunk_started(&mut self, index: usize) -> Result<(), StateError> {
        self.move_chunk(index, ChunkState::Running)
    }

    /// Records a chunk result; chunks satisfied from memo go straight from
    /// pending to done.
    pub fn chunk_finished(&mut self, index: usize, succeeded: bool) -> Result<(), StateError> {
        let next = if succeeded {
            ChunkState::Done
        } else {
            ChunkState::Failed
        };
        self.move_chunk(index, next)
    }

    /// Closes the dispatch phase. Chunks that never reported are failed.
    pub fn settle(&mut self) -> Result<JobState, StateError> {
        if self.state != JobState::Dispatched {
            return Err(StateError::InvalidTransition {
                label: self.label.to_string(),
                from: self.state,
                to: JobState::AllDone,
            });
        }
        for chunk in &mut self.chunks {
            if matches!(chunk, ChunkState::Pending | ChunkState::Running) {
                *chunk = ChunkState::Failed;
            }
        }
        let next = if self.count(ChunkState::Failed) == 0 {
            JobState::AllDone
        } else {
            JobState::PartialFailure
        };
        self.transition(next)?;
        Ok(next)
    }

    pub fn cancelled(&mut self) -> Result<(), StateError> {
        self.transition(JobState::Cancelled)
    }

    pub fn merged(&mut self) -> Result<(), StateError> {
        self.transition(JobState::Merged)
    }

    pub fn merge_failed(&mut self) -> Result<(), StateError> {
        self.transition(JobState::MergeFailed)
    }
}
