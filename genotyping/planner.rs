// ========================================================================================
//
//                               Chunk Job Planner
//
// ========================================================================================
//
// Turns a caller and its index span into a job array: one partition spec, one
// command and one expected output set per chunk, plus a key for the whole array.
// Planning with identical inputs yields byte-identical commands and keys, which is
// what lets a memoizing engine skip arrays that already ran.

use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::callers::{ChunkedCaller, SingleJob};
use crate::config::PlannerConfig;
use crate::dispatch::ChunkJob;
use crate::grouping::{GroupedPathAllocator, GroupingError, partition_name};
use crate::identity::TaskKey;
use crate::partition::{PartitionError, RangeChunks};
use crate::shared::files::{ensure_readable, resolve_against};
use crate::types::{ExpectedOutputSet, IndexRange, JobLabel, PartitionSpec};

/// Placeholder the dispatcher replaces with the partition index in log paths.
pub const ARRAY_INDEX_PLACEHOLDER: &str = "%I";

const CHUNK_KEY_TAG: &str = "genoflow.chunk";

#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Grouping(#[from] GroupingError),
    #[error("Input '{path}' is unavailable: {source}")]
    InputUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to derive task identity: {0}")]
    Identity(#[from] serde_json::Error),
    #[error("{0} declares no output files")]
    NoOutputs(String),
    #[error("Failed to create log directory '{path}': {source}")]
    LogDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Everything that determines a chunk's identity.
#[derive(Serialize)]
struct ChunkIdentity<'a> {
    caller: &'a str,
    index: usize,
    work_dir: &'a Path,
    range: IndexRange,
    command: &'a str,
}

/// A fully planned job array.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    pub label: JobLabel,
    pub work_dir: PathBuf,
    pub specs: Vec<PartitionSpec>,
    pub commands: Vec<String>,
    pub outputs: Vec<ExpectedOutputSet>,
    pub array_key: TaskKey,
    /// `<log_dir>/<array_key>.%I.log`
    pub log_pattern: PathBuf,
}

impl ChunkPlan {
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// e.g. "illuminus chunk 7 of 20 for chromosome 12".
    pub fn describe_chunk(&self, index: usize) -> String {
        self.label.chunk(index, self.len())
    }

    pub fn log_path(&self, index: usize) -> PathBuf {
        let pattern = self.log_pattern.to_string_lossy();
        PathBuf::from(pattern.replace(ARRAY_INDEX_PLACEHOLDER, &index.to_string()))
    }

    /// Creates every grouping directory and the log directory. Idempotent and
    /// safe to run while other plans share the same directories.
    pub fn create_group_dirs(&self) -> Result<(), PlanError> {
        let mut seen = BTreeSet::new();
        let paths = self
            .outputs
            .iter()
            .flat_map(|set| set.files.iter())
            .chain(self.specs.iter().map(|spec| &spec.output_path));
        for path in paths {
            if path.parent().is_some_and(|dir| seen.insert(dir)) {
                GroupedPathAllocator::ensure_group_dir(path)?;
            }
        }
        if let Some(log_dir) = self.log_pattern.parent() {
            fs::create_dir_all(log_dir).map_err(|source| PlanError::LogDir {
                path: log_dir.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn jobs(&self) -> Vec<ChunkJob> {
        self.specs
            .iter()
            .zip(&self.commands)
            .zip(&self.outputs)
            .map(|((spec, command), outputs)| ChunkJob {
                index: spec.index,
                label: self.describe_chunk(spec.index),
                task_key: spec.task_key,
                command: command.clone(),
                work_dir: self.work_dir.clone(),
                log_path: self.log_path(spec.index),
                outputs: outputs.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ChunkJobPlanner {
    work_dir: PathBuf,
    log_dir: PathBuf,
    group_size: usize,
}

impl ChunkJobPlanner {
    pub fn new(config: &PlannerConfig) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            log_dir: config.log_dir(),
            group_size: config.group_size,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn check_inputs(&self, inputs: &[&Path]) -> Result<(), PlanError> {
        for input in inputs {
            let path = resolve_against(&self.work_dir, input);
            ensure_readable(&path).map_err(|source| PlanError::InputUnavailable {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Computes the plan without touching the filesystem beyond checking that
    /// the caller's inputs are readable.
    pub fn prepare<C: ChunkedCaller + ?Sized>(&self, caller: &C) -> Result<ChunkPlan, PlanError> {
        // --- 1. Fail fast on inputs, before anything is computed or created ---
        self.check_inputs(&caller.required_inputs())?;

        // --- 2. Partition and allocate grouped paths ---
        let span = caller.span();
        let chunks = RangeChunks::new(span.start(), span.end(), caller.chunk_size())?;
        let group_size = caller.group_size().unwrap_or(self.group_size);
        let allocator = GroupedPathAllocator::new(group_size)?;
        let base = resolve_against(&self.work_dir, caller.output_base());

        let total = chunks.len();
        let mut specs = Vec::with_capacity(total);
        let mut commands = Vec::with_capacity(total);
        let mut outputs = Vec::with_capacity(total);

        // --- 3. Render commands and derive identities ---
        for (index, range) in chunks.enumerate() {
            let output_path = allocator.group_path(&partition_name(&base, index)?, index)?;
            let command = caller.chunk_command(range, &output_path).render();
            let task_key = TaskKey::derive(
                CHUNK_KEY_TAG,
                &ChunkIdentity {
                    caller: caller.name(),
                    index,
                    work_dir: &self.work_dir,
                    range,
                    command: &command,
                },
            )?;
            outputs.push(caller.chunk_outputs(index, &output_path));
            specs.push(PartitionSpec {
                index,
                range,
                output_path,
                task_key,
            });
            commands.push(command);
        }

        let plan = self.assemble(caller.label(), caller.name(), specs, commands, outputs);
        info!(
            "Planned {} chunk(s) for {} over {} (array {})",
            plan.len(),
            plan.label,
            span,
            plan.array_key
        );
        Ok(plan)
    }

    /// Plans a caller and creates its grouping and log directories.
    pub fn plan<C: ChunkedCaller + ?Sized>(&self, caller: &C) -> Result<ChunkPlan, PlanError> {
        let plan = self.prepare(caller)?;
        plan.create_group_dirs()?;
        Ok(plan)
    }

    /// Plans a step that runs once, as a one-element array.
    pub fn plan_single<J: SingleJob + ?Sized>(&self, job: &J) -> Result<ChunkPlan, PlanError> {
        self.check_inputs(&job.required_inputs())?;

        let outputs = job.outputs();
        let output_path = outputs
            .primary()
            .map(Path::to_path_buf)
            .ok_or_else(|| PlanError::NoOutputs(job.name().to_string()))?;
        let command = job.command().render();
        let range = IndexRange::spanning(0, 0);
        let task_key = TaskKey::derive(
            CHUNK_KEY_TAG,
            &ChunkIdentity {
                caller: job.name(),
                index: 0,
                work_dir: &self.work_dir,
                range,
                command: &command,
            },
        )?;
        let spec = PartitionSpec {
            index: 0,
            range,
            output_path,
            task_key,
        };

        let plan = self.assemble(
            JobLabel::new(job.name()),
            job.name(),
            vec![spec],
            vec![command],
            vec![outputs.with_index(0)],
        );
        debug!("Planned single job {} ({})", plan.label, plan.array_key);
        plan.create_group_dirs()?;
        Ok(plan)
    }

    fn assemble(
        &self,
        label: JobLabel,
        name: &str,
        specs: Vec<PartitionSpec>,
        commands: Vec<String>,
        outputs: Vec<ExpectedOutputSet>,
    ) -> ChunkPlan {
        let keys: Vec<TaskKey> = specs.iter().map(|spec| spec.task_key).collect();
        let array_key = TaskKey::combine(name, &keys);
        let log_pattern = self
            .log_dir
            .join(format!("{array_key}.{ARRAY_INDEX_PLACEHOLDER}.log"));
        ChunkPlan {
            label,
            work_dir: self.work_dir.clone(),
            specs,
            commands,
            outputs,
            array_key,
            log_pattern,
        }
    }
}
