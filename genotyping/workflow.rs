// ========================================================================================
//
//                                   Workflows
//
// ========================================================================================
//
// Chunked steps chain planning, dispatch and reassembly; the workflows below wire
// callers together the way a genotyping run needs them. A step reports an
// `Outcome` so the caller can retry just the failed chunks: re-running with the
// same inputs plans the same keys, and memoized chunks are skipped.

use log::{info, warn};
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::callers::{
    ChunkedCaller, GenoSnp, Illuminus, SingleJob, ZCallEvaluate, ZCallInputs, ZCallMergeEvaluation,
    ZCallPrepare, ZCallRun,
};
use crate::chromosomes::{ChromosomeError, read_bounds};
use crate::config::WorkflowConfig;
use crate::dispatch::{ArrayExecutor, CancelToken, DispatchError, JobArrayDispatcher, MemoStore};
use crate::merge::{MergeAxis, MergeError, MergeLayout, MergeReassembler, verify_chunks};
use crate::planner::{ChunkJobPlanner, ChunkPlan, PlanError};
use crate::shared::files::resolve_against;
use crate::sim::{SimError, SimHeader};
use crate::state::{JobTracker, StateError};
use crate::types::{
    ChunkFailure, ChunkFailureReason, ExpectedOutputSet, IndexRange, MergedArtifact, Outcome,
};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Planning failed: {0}")]
    Plan(#[from] PlanError),
    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("Merge failed: {0}")]
    Merge(#[from] MergeError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Sim(#[from] SimError),
    #[error(transparent)]
    Chromosome(#[from] ChromosomeError),
    #[error("Failed to read '{path}': {message}")]
    Input { path: PathBuf, message: String },
    #[error("Failed to write JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Workflow I/O error: {0}")]
    Io(#[from] io::Error),
}

fn input_error(path: &Path, message: impl ToString) -> WorkflowError {
    WorkflowError::Input {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

/// Maps a merge that found missing chunk outputs back onto labelled chunk failures.
fn merge_failures(err: &MergeError, describe: impl Fn(usize) -> String) -> Option<Vec<ChunkFailure>> {
    match err {
        MergeError::Incomplete { missing } => Some(
            missing
                .iter()
                .map(|chunk| ChunkFailure {
                    index: chunk.index,
                    label: describe(chunk.index),
                    reason: if chunk.files.is_empty() {
                        ChunkFailureReason::NotReported
                    } else {
                        ChunkFailureReason::MissingOutputs(chunk.files.clone())
                    },
                })
                .collect(),
        ),
        _ => None,
    }
}

/// Planner, executor and configuration shared by every step of a run.
pub struct WorkflowContext<'a> {
    config: &'a WorkflowConfig,
    planner: ChunkJobPlanner,
    executor: ArrayExecutor<'a>,
}

impl<'a> WorkflowContext<'a> {
    pub fn new(
        config: &'a WorkflowConfig,
        dispatcher: &'a dyn JobArrayDispatcher,
        memo: &'a dyn MemoStore,
    ) -> Self {
        let executor = ArrayExecutor::new(dispatcher, memo, config.dispatch.clone())
            .with_resources(config.resources.clone());
        Self {
            config,
            planner: ChunkJobPlanner::new(&config.planner),
            executor,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.executor = self.executor.with_progress(show);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.executor = self.executor.with_cancel_token(cancel);
        self
    }

    pub fn config(&self) -> &WorkflowConfig {
        self.config
    }

    pub fn work_path(&self, path: &Path) -> PathBuf {
        resolve_against(&self.config.planner.work_dir, path)
    }

    fn dispatch(
        &self,
        plan: &ChunkPlan,
    ) -> Result<(JobTracker, Outcome<Vec<ExpectedOutputSet>>), WorkflowError> {
        let mut tracker = JobTracker::new(plan.label.clone(), plan.len());
        let outcome = self.executor.execute(plan, &mut tracker)?;
        match &outcome {
            Outcome::Success(_) => info!("{} finished all {} chunk(s)", plan.label, plan.len()),
            Outcome::Incomplete(failures) => {
                warn!("{}: {} chunk(s) failed", plan.label, failures.len())
            }
            Outcome::Cancelled => warn!("{} was cancelled", plan.label),
            Outcome::Failure(reason) => warn!("{reason}"),
        }
        Ok((tracker, outcome))
    }

    /// Plans and dispatches `caller` without merging, returning the verified
    /// chunk outputs in index order.
    pub fn run_chunks<C: ChunkedCaller + ?Sized>(
        &self,
        caller: &C,
    ) -> Result<(ChunkPlan, Outcome<Vec<ExpectedOutputSet>>), WorkflowError> {
        let plan = self.planner.plan(caller)?;
        let (_, outcome) = self.dispatch(&plan)?;
        Ok((plan, outcome))
    }

    /// Plans, dispatches and merges `caller` into `destination`.
    ///
    /// Callers without a merge layout only have their outputs verified; the
    /// artifact then lists the chunk outputs in index order.
    pub fn run_chunked<C: ChunkedCaller + ?Sized>(
        &self,
        caller: &C,
        destination: &Path,
    ) -> Result<Outcome<MergedArtifact>, WorkflowError> {
        let plan = self.planner.plan(caller)?;
        let (mut tracker, outcome) = self.dispatch(&plan)?;
        let outputs = match outcome.into_result() {
            Ok(outputs) => outputs,
            Err(unfinished) => return Ok(unfinished),
        };

        let merged = match caller.merge_layout() {
            Some(layout) => {
                let destination = self.work_path(destination);
                MergeReassembler::new(layout).reassemble(&outputs, &destination)
            }
            None => verify_chunks(&outputs).map(|ordered| MergedArtifact {
                files: ordered
                    .iter()
                    .filter_map(|set| set.primary().map(Path::to_path_buf))
                    .collect(),
                chunks_merged: ordered.len(),
            }),
        };

        match merged {
            Ok(artifact) => {
                tracker.merged()?;
                Ok(Outcome::Success(artifact))
            }
            Err(err) => {
                tracker.merge_failed()?;
                match merge_failures(&err, |i| plan.describe_chunk(i)) {
                    Some(failures) => Ok(Outcome::Incomplete(failures)),
                    None => Err(err.into()),
                }
            }
        }
    }

    /// Runs a one-off step and checks its outputs.
    pub fn run_single<J: SingleJob + ?Sized>(
        &self,
        job: &J,
    ) -> Result<Outcome<ExpectedOutputSet>, WorkflowError> {
        let plan = self.planner.plan_single(job)?;
        let (_, outcome) = self.dispatch(&plan)?;
        match outcome.into_result() {
            Ok(outputs) => outputs
                .into_iter()
                .next()
                .map(Outcome::Success)
                .ok_or_else(|| PlanError::NoOutputs(job.name().to_string()).into()),
            Err(unfinished) => Ok(unfinished),
        }
    }
}

// ========================================================================================
//                                       GenoSNP
// ========================================================================================

#[derive(Debug, Clone)]
pub struct GenoSnpRun {
    pub run_name: String,
    pub sim: PathBuf,
    pub snp_json: PathBuf,
    pub manifest: PathBuf,
    pub start: u64,
    /// Defaults to the sample count in the SIM header.
    pub end: Option<u64>,
}

pub fn genotype_genosnp(
    ctx: &WorkflowContext<'_>,
    run: &GenoSnpRun,
) -> Result<Outcome<MergedArtifact>, WorkflowError> {
    let sim = ctx.work_path(&run.sim);
    let end = match run.end {
        Some(end) => end,
        None => SimHeader::read(&sim)?.num_samples as u64,
    };
    let samples = IndexRange::new(run.start, end).map_err(PlanError::from)?;
    let caller = GenoSnp {
        sim,
        snp_json: ctx.work_path(&run.snp_json),
        manifest: ctx.work_path(&run.manifest),
        output: PathBuf::from(format!("{}.genosnp", run.run_name)),
        samples,
        options: ctx.config().genosnp.clone(),
    };
    let destination = PathBuf::from(format!("{}.genosnp.bed", run.run_name));
    ctx.run_chunked(&caller, &destination)
}

// ========================================================================================
//                                      Illuminus
// ========================================================================================

#[derive(Debug, Clone)]
pub struct IlluminusRun {
    pub run_name: String,
    pub sim: PathBuf,
    pub manifest: PathBuf,
    pub sample_json: PathBuf,
    /// JSON array of `{"chromosome", "start", "end"}` SNP bounds.
    pub chromosome_json: PathBuf,
}

/// Calls every chromosome as its own array, then merges all chunks of all
/// chromosomes, in chromosome then chunk order, into `<run>.illuminus.bed`.
pub fn genotype_illuminus(
    ctx: &WorkflowContext<'_>,
    run: &IlluminusRun,
) -> Result<Outcome<MergedArtifact>, WorkflowError> {
    let bounds = read_bounds(&ctx.work_path(&run.chromosome_json))?;
    let options = ctx.config().illuminus.clone();

    let mut outputs = Vec::new();
    let mut labels = Vec::new();
    let mut failures = Vec::new();
    for chromosome in &bounds {
        if chromosome.snps.is_empty() {
            warn!(
                "Skipping chromosome {}: no SNPs at index {}",
                chromosome.chromosome,
                chromosome.snps.start()
            );
            continue;
        }
        info!(
            "Illuminus on chromosome {} ({:?}, SNPs {})",
            chromosome.chromosome,
            chromosome.kind(),
            chromosome.snps
        );
        let caller = Illuminus {
            sim: ctx.work_path(&run.sim),
            manifest: ctx.work_path(&run.manifest),
            sample_json: ctx.work_path(&run.sample_json),
            output: PathBuf::from(format!("{}.{}", run.run_name, chromosome.chromosome)),
            snps: chromosome.snps,
            chromosome: Some(chromosome.chromosome.clone()),
            options: options.clone(),
        };
        let (plan, outcome) = ctx.run_chunks(&caller)?;
        match outcome {
            Outcome::Success(chunk_outputs) => {
                for set in chunk_outputs {
                    let global = outputs.len();
                    labels.push(plan.describe_chunk(set.index));
                    outputs.push(set.with_index(global));
                }
            }
            Outcome::Incomplete(chromosome_failures) => failures.extend(chromosome_failures),
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
            Outcome::Failure(reason) => return Ok(Outcome::Failure(reason)),
        }
    }
    if !failures.is_empty() {
        return Ok(Outcome::Incomplete(failures));
    }
    if outputs.is_empty() {
        return Ok(Outcome::Failure(format!(
            "no chromosome in '{}' has any SNPs",
            run.chromosome_json.display()
        )));
    }

    let layout = if options.plink {
        MergeLayout::PlinkTrio(MergeAxis::Variants)
    } else {
        MergeLayout::Text { header_lines: 1 }
    };
    let destination = ctx.work_path(Path::new(&format!("{}.illuminus.bed", run.run_name)));
    match MergeReassembler::new(layout).reassemble(&outputs, &destination) {
        Ok(artifact) => Ok(Outcome::Success(artifact)),
        Err(err) => match merge_failures(&err, |i| labels.get(i).cloned().unwrap_or_default()) {
            Some(failures) => Ok(Outcome::Incomplete(failures)),
            None => Err(err.into()),
        },
    }
}

// ========================================================================================
//                                        zCall
// ========================================================================================

#[derive(Debug, Clone)]
pub struct ZCallWorkflowRun {
    pub run_name: String,
    pub sample_json: PathBuf,
    pub manifest: PathBuf,
    pub egt: PathBuf,
}

#[derive(Deserialize)]
struct EvaluationSummary {
    #[serde(rename = "BEST_THRESHOLDS")]
    best_thresholds: PathBuf,
}

/// Number of records in a sample JSON array.
pub fn count_samples(sample_json: &Path) -> Result<u64, WorkflowError> {
    let text = fs::read_to_string(sample_json).map_err(|e| input_error(sample_json, e))?;
    let samples: Vec<serde_json::Value> =
        serde_json::from_str(&text).map_err(|e| input_error(sample_json, e))?;
    Ok(samples.len() as u64)
}

/// Prepares candidate thresholds, evaluates them in sample chunks to pick the
/// best, then re-calls every sample chunk and merges along the sample axis into
/// `<run>.zcall.bed`.
pub fn genotype_zcall(
    ctx: &WorkflowContext<'_>,
    run: &ZCallWorkflowRun,
) -> Result<Outcome<MergedArtifact>, WorkflowError> {
    let work_dir = ctx.config().planner.work_dir.clone();
    let options = ctx.config().zcall.clone();
    let inputs = ZCallInputs {
        sample_json: ctx.work_path(&run.sample_json),
        manifest: ctx.work_path(&run.manifest),
        egt: ctx.work_path(&run.egt),
    };
    let samples =
        IndexRange::new(0, count_samples(&inputs.sample_json)?).map_err(PlanError::from)?;

    // --- 1. Candidate thresholds ---
    let prepare = ZCallPrepare {
        egt: inputs.egt.clone(),
        work_dir: work_dir.clone(),
        zstart: options.zstart,
        ztotal: options.ztotal,
    };
    if let Err(unfinished) = ctx.run_single(&prepare)?.into_result() {
        return Ok(unfinished);
    }

    // --- 2. Pick the best threshold set ---
    let thresholds = if options.ztotal == 1 {
        prepare
            .threshold_files()
            .into_iter()
            .next()
            .ok_or_else(|| input_error(&prepare.threshold_index(), "no threshold files"))?
    } else {
        let evaluate = ZCallEvaluate {
            thresholds_json: prepare.threshold_index(),
            inputs: inputs.clone(),
            output: PathBuf::from(format!("{}.zcall_evaluation.json", run.run_name)),
            samples,
            options: options.clone(),
        };
        let evaluations = match ctx.run_chunked(&evaluate, &evaluate.output)?.into_result() {
            Ok(artifact) => artifact.files,
            Err(unfinished) => return Ok(unfinished),
        };

        let metrics_list = work_dir.join(format!("{}.zcall_metrics.json", run.run_name));
        fs::write(&metrics_list, serde_json::to_vec_pretty(&evaluations)?)?;
        let merge = ZCallMergeEvaluation {
            metrics_list,
            thresholds_json: prepare.threshold_index(),
            output: work_dir.join(format!("{}.zcall_metrics_merged.json", run.run_name)),
            summary: work_dir.join("metric_summary.txt"),
        };
        if let Err(unfinished) = ctx.run_single(&merge)?.into_result() {
            return Ok(unfinished);
        }
        let text = fs::read_to_string(&merge.output)?;
        let summary: EvaluationSummary =
            serde_json::from_str(&text).map_err(|e| input_error(&merge.output, e))?;
        resolve_against(&work_dir, &summary.best_thresholds)
    };
    info!("zCall using thresholds {}", thresholds.display());

    // --- 3. Call and merge ---
    let call = ZCallRun {
        thresholds,
        inputs,
        output: PathBuf::from(format!("{}.zcall", run.run_name)),
        samples,
        options,
    };
    ctx.run_chunked(&call, Path::new(&format!("{}.zcall.bed", run.run_name)))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::command::{CommandLine, Pipeline};
    use crate::dispatch::{InMemoryMemo, LocalDispatcher};
    use crate::types::JobLabel;
    use tempfile::tempdir;

    /// Writes its range into a text file with a header line.
    struct Echo {
        output: PathBuf,
        span: IndexRange,
    }

    impl ChunkedCaller for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn required_inputs(&self) -> Vec<&Path> {
            Vec::new()
        }

        fn output_base(&self) -> &Path {
            &self.output
        }

        fn span(&self) -> IndexRange {
            self.span
        }

        fn chunk_size(&self) -> u64 {
            3
        }

        fn group_size(&self) -> Option<usize> {
            Some(2)
        }

        fn label(&self) -> JobLabel {
            JobLabel::scoped("echo", "test")
        }

        fn chunk_command(&self, range: IndexRange, output: &Path) -> Pipeline {
            CommandLine::new("sh")
                .word("-c")
                .word(r#"printf 'range\n%s\n' "$1" > "$0""#)
                .word(output.display().to_string())
                .word(format!("{}-{}", range.start(), range.end()))
                .into()
        }

        fn chunk_outputs(&self, index: usize, output: &Path) -> ExpectedOutputSet {
            ExpectedOutputSet::single(index, output)
        }

        fn merge_layout(&self) -> Option<MergeLayout> {
            Some(MergeLayout::Text { header_lines: 1 })
        }
    }

    #[test]
    fn chunked_step_merges_in_index_order() {
        let dir = tempdir().expect("tempdir");
        let config = WorkflowConfig::for_work_dir(dir.path());
        let dispatcher = LocalDispatcher::new(3);
        let memo = InMemoryMemo::new();
        let ctx = WorkflowContext::new(&config, &dispatcher, &memo);

        let caller = Echo {
            output: "echo.txt".into(),
            span: IndexRange::new(0, 10).unwrap(),
        };
        let outcome = ctx.run_chunked(&caller, Path::new("merged.txt")).unwrap();
        let artifact = outcome.success().expect("merge succeeds");
        assert_eq!(artifact.chunks_merged, 4);
        assert_eq!(
            fs::read_to_string(dir.path().join("merged.txt")).unwrap(),
            "range\n0-3\n3-6\n6-9\n9-10\n"
        );
    }

    #[test]
    fn count_samples_reads_json_arrays() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("s.json");
        fs::write(&path, r#"[{"sample":"a"},{"sample":"b"},{"sample":"c"}]"#).unwrap();
        assert_eq!(count_samples(&path).unwrap(), 3);
        fs::write(&path, "{").unwrap();
        assert!(matches!(count_samples(&path), Err(WorkflowError::Input { .. })));
    }

    struct Touch {
        target: PathBuf,
    }

    impl SingleJob for Touch {
        fn name(&self) -> &str {
            "touch"
        }

        fn required_inputs(&self) -> Vec<&Path> {
            Vec::new()
        }

        fn command(&self) -> Pipeline {
            CommandLine::new("sh")
                .word("-c")
                .word(r#"echo done > "$0""#)
                .word(self.target.display().to_string())
                .into()
        }

        fn outputs(&self) -> ExpectedOutputSet {
            ExpectedOutputSet::single(0, &self.target)
        }
    }

    #[test]
    fn single_job_reports_its_outputs() {
        let dir = tempdir().expect("tempdir");
        let config = WorkflowConfig::for_work_dir(dir.path());
        let dispatcher = LocalDispatcher::new(1);
        let memo = InMemoryMemo::new();
        let ctx = WorkflowContext::new(&config, &dispatcher, &memo);

        let job = Touch {
            target: dir.path().join("prepared.txt"),
        };
        let outputs = ctx.run_single(&job).unwrap().success().expect("job succeeds");
        assert_eq!(outputs.files, vec![dir.path().join("prepared.txt")]);
    }

    #[test]
    fn illuminus_skips_chromosomes_without_snps() {
        let dir = tempdir().expect("tempdir");
        for input in ["run1.sim", "chip.bpm.csv", "run1.sample.json"] {
            fs::write(dir.path().join(input), "x").unwrap();
        }
        let config = WorkflowConfig::for_work_dir(dir.path());
        let dispatcher = LocalDispatcher::new(1);
        let memo = InMemoryMemo::new();
        let ctx = WorkflowContext::new(&config, &dispatcher, &memo);
        let run = IlluminusRun {
            run_name: "run1".into(),
            sim: "run1.sim".into(),
            manifest: "chip.bpm.csv".into(),
            sample_json: "run1.sample.json".into(),
            chromosome_json: "run1.chr.json".into(),
        };

        fs::write(
            dir.path().join("run1.chr.json"),
            r#"[{"chromosome":"1","start":0,"end":2},{"chromosome":"Y","start":2,"end":2}]"#,
        )
        .unwrap();
        // The callers are not installed, so chromosome 1 fails; Y is never planned.
        match genotype_illuminus(&ctx, &run).unwrap() {
            Outcome::Incomplete(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].label, "illuminus chunk 0 of 1 for chromosome 1");
            }
            other => panic!("expected an incomplete outcome, got {other:?}"),
        }

        fs::write(
            dir.path().join("run1.chr.json"),
            r#"[{"chromosome":"MT","start":7,"end":7}]"#,
        )
        .unwrap();
        assert!(matches!(
            genotype_illuminus(&ctx, &run).unwrap(),
            Outcome::Failure(_)
        ));
    }

    #[test]
    fn genosnp_needs_a_readable_sim_when_end_is_open() {
        let dir = tempdir().expect("tempdir");
        let config = WorkflowConfig::for_work_dir(dir.path());
        let dispatcher = LocalDispatcher::new(1);
        let memo = InMemoryMemo::new();
        let ctx = WorkflowContext::new(&config, &dispatcher, &memo);

        let run = GenoSnpRun {
            run_name: "run1".into(),
            sim: "absent.sim".into(),
            snp_json: "run1.snp.json".into(),
            manifest: "chip.bpm.csv".into(),
            start: 0,
            end: None,
        };
        assert!(matches!(
            genotype_genosnp(&ctx, &run),
            Err(WorkflowError::Sim(SimError::Io { .. }))
        ));
        assert!(!dir.path().join("0").exists());
    }
}
