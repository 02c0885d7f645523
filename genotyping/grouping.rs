// ========================================================================================
//
//                            Grouped Path Allocator
//
// ========================================================================================
//
// Chunk outputs are bucketed into numbered subdirectories so that no single
// directory collects more than `group_size` partitions. The layout is
// `<dir>/<partition_index div group_size>/<basename>` and must not change: existing
// pipelines locate their chunk outputs by it.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default number of partitions placed in one grouping directory.
pub const DEFAULT_GROUP_SIZE: usize = 100;

const DEFAULT_GROUP_SIZE_NONZERO: NonZeroUsize = match NonZeroUsize::new(DEFAULT_GROUP_SIZE) {
    Some(size) => size,
    None => panic!("default group size must be non-zero"),
};

/// Infix separating an output stem from its partition index.
const PARTITION_INFIX: &str = ".part.";

#[derive(Debug, Error)]
pub enum GroupingError {
    #[error("group size must be at least 1")]
    ZeroGroupSize,
    #[error("partition base '{0}' has no file name")]
    NoFileName(PathBuf),
    #[error("failed to create group directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupedPathAllocator {
    group_size: NonZeroUsize,
}

impl Default for GroupedPathAllocator {
    fn default() -> Self {
        Self {
            group_size: DEFAULT_GROUP_SIZE_NONZERO,
        }
    }
}

impl GroupedPathAllocator {
    pub fn new(group_size: usize) -> Result<Self, GroupingError> {
        NonZeroUsize::new(group_size)
            .map(|group_size| Self { group_size })
            .ok_or(GroupingError::ZeroGroupSize)
    }

    pub fn group_size(&self) -> usize {
        self.group_size.get()
    }

    #[inline]
    pub fn group_index(&self, partition_index: usize) -> usize {
        partition_index / self.group_size.get()
    }

    /// Maps `dir/name` to `dir/<group>/name` for the given partition.
    pub fn group_path(&self, base: &Path, partition_index: usize) -> Result<PathBuf, GroupingError> {
        let file_name = base
            .file_name()
            .ok_or_else(|| GroupingError::NoFileName(base.to_path_buf()))?;
        let dir = base.parent().unwrap_or_else(|| Path::new(""));
        Ok(dir
            .join(self.group_index(partition_index).to_string())
            .join(file_name))
    }

    /// Creates the directory holding `grouped_path`, treating an existing
    /// directory as success. Safe to call concurrently for paths in one group.
    pub fn ensure_group_dir(grouped_path: &Path) -> Result<(), GroupingError> {
        let Some(dir) = grouped_path.parent() else {
            return Ok(());
        };
        if dir.as_os_str().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(dir).map_err(|source| GroupingError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })
    }
}

/// Free-function form of [`GroupedPathAllocator::group_path`].
pub fn group_path(
    base: &Path,
    partition_index: usize,
    group_size: usize,
) -> Result<PathBuf, GroupingError> {
    GroupedPathAllocator::new(group_size)?.group_path(base, partition_index)
}

/// Names partition `index` of `base`: `dir/stem.ext` becomes `dir/stem.part.<index>.ext`.
pub fn partition_name(base: &Path, index: usize) -> Result<PathBuf, GroupingError> {
    let stem = base
        .file_stem()
        .ok_or_else(|| GroupingError::NoFileName(base.to_path_buf()))?;
    let mut name = OsString::from(stem);
    name.push(format!("{PARTITION_INFIX}{index}"));
    if let Some(ext) = base.extension() {
        name.push(".");
        name.push(ext);
    }
    Ok(base.with_file_name(name))
}

/// Recovers the partition index from a name produced by [`partition_name`].
pub fn partition_index(path: &Path) -> Option<usize> {
    let name = path.file_name()?.to_str()?;
    let at = name.rfind(PARTITION_INFIX)?;
    let digits = &name[at + PARTITION_INFIX.len()..];
    let end = digits.find('.').unwrap_or(digits.len());
    digits[..end].parse().ok()
}
