// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use itertools::Itertools;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::identity::TaskKey;
use crate::partition::PartitionError;
use crate::shared::files::{missing_or_empty, plink_fileset};

/// A zero-based, half-open `[start, end)` span of sample or SNP indices.
///
/// Every caller in this crate receives its bounds in this convention. An empty
/// range (`start == end`) is valid and covers no indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct IndexRange {
    start: u64,
    end: u64,
}

impl IndexRange {
    pub fn new(start: u64, end: u64) -> Result<Self, PartitionError> {
        if start > end {
            return Err(PartitionError::InvalidRange {
                from: start,
                to: end,
            });
        }
        Ok(Self { start, end })
    }

    /// Callers must already have checked `start <= end`.
    pub(crate) const fn spanning(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    #[inline]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.end
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline]
    pub fn contains(&self, index: u64) -> bool {
        index >= self.start && index < self.end
    }
}

impl fmt::Display for IndexRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// One chunk's unit of work inside a job array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionSpec {
    /// 0-based position of the chunk among all chunks of the array.
    pub index: usize,
    pub range: IndexRange,
    /// The grouped output base handed to the caller command.
    pub output_path: PathBuf,
    pub task_key: TaskKey,
}

/// The files a chunk (or a merge) must leave behind, in a fixed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpectedOutputSet {
    pub index: usize,
    pub files: Vec<PathBuf>,
}

impl ExpectedOutputSet {
    pub fn single(index: usize, path: impl Into<PathBuf>) -> Self {
        Self {
            index,
            files: vec![path.into()],
        }
    }

    /// A `.bed` output always travels with its `.bim` and `.fam` siblings.
    pub fn plink_trio(index: usize, bed: &Path) -> Self {
        Self {
            index,
            files: plink_fileset(bed).to_vec(),
        }
    }

    pub fn primary(&self) -> Option<&Path> {
        self.files.first().map(PathBuf::as_path)
    }

    /// Files that are absent or zero-length. An empty result means the
    /// post-condition holds.
    pub fn missing_files(&self) -> Vec<PathBuf> {
        missing_or_empty(&self.files)
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }
}

/// The combined dataset produced by a successful reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedArtifact {
    pub files: Vec<PathBuf>,
    pub chunks_merged: usize,
}

impl MergedArtifact {
    pub fn primary(&self) -> Option<&Path> {
        self.files.first().map(PathBuf::as_path)
    }
}

/// Human-readable identity of a job array, used to name failed chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobLabel {
    pub caller: String,
    pub scope: Option<String>,
}

impl JobLabel {
    pub fn new(caller: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            scope: None,
        }
    }

    pub fn scoped(caller: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            scope: Some(scope.into()),
        }
    }

    /// e.g. "illuminus chunk 7 of 20 for chromosome 12". Chunk numbers are
    /// partition indices, so they run from 0 to `total - 1`.
    pub fn chunk(&self, index: usize, total: usize) -> String {
        match &self.scope {
            Some(scope) => format!("{} chunk {index} of {total} for {scope}", self.caller),
            None => format!("{} chunk {index} of {total}", self.caller),
        }
    }
}

impl fmt::Display for JobLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{} for {scope}", self.caller),
            None => f.write_str(&self.caller),
        }
    }
}

/// Why a dispatched chunk did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkFailureReason {
    /// The command finished but its expected outputs are absent or empty.
    MissingOutputs(Vec<PathBuf>),
    /// The command exited unsuccessfully; `None` when killed by a signal.
    ExitStatus(Option<i32>),
    /// The command could not be started.
    Launch(String),
    /// The dispatcher never reported a result for this chunk.
    NotReported,
}

impl fmt::Display for ChunkFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingOutputs(paths) => write!(
                f,
                "missing or empty outputs: {}",
                paths.iter().map(|p| p.display()).join(", ")
            ),
            Self::ExitStatus(Some(code)) => write!(f, "command exited with status {code}"),
            Self::ExitStatus(None) => f.write_str("command was terminated by a signal"),
            Self::Launch(message) => write!(f, "command could not be started: {message}"),
            Self::NotReported => f.write_str("no result was reported"),
        }
    }
}

/// A single chunk that must be re-dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub index: usize,
    pub label: String,
    pub reason: ChunkFailureReason,
}

impl fmt::Display for ChunkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.reason)
    }
}

/// Tagged result of dispatch and merge operations.
///
/// `Incomplete` names the chunks to retry, `Cancelled` marks a run that was
/// stopped before completion, and `Failure` covers everything that cannot be
/// repaired by re-dispatching a subset (timeouts, dispatcher breakdowns).
#[derive(Debug)]
pub enum Outcome<T> {
    Success(T),
    Incomplete(Vec<ChunkFailure>),
    Cancelled,
    Failure(String),
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn success(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Self::Success(value) => Outcome::Success(f(value)),
            Self::Incomplete(failures) => Outcome::Incomplete(failures),
            Self::Cancelled => Outcome::Cancelled,
            Self::Failure(reason) => Outcome::Failure(reason),
        }
    }

    /// Splits off the success value; anything else is handed back retyped so a
    /// later step can return it unchanged.
    pub fn into_result<U>(self) -> Result<T, Outcome<U>> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Incomplete(failures) => Err(Outcome::Incomplete(failures)),
            Self::Cancelled => Err(Outcome::Cancelled),
            Self::Failure(reason) => Err(Outcome::Failure(reason)),
        }
    }

    /// Partition indices that need to be dispatched again.
    pub fn failed_indices(&self) -> Vec<usize> {
        match self {
            Self::Incomplete(failures) => failures.iter().map(|f| f.index).collect(),
            _ => Vec::new(),
        }
    }
}
