// ========================================================================================
//
//                              Job Array Dispatch
//
// ========================================================================================
//
// The dispatcher contract: hand over a planned array, stream back per-chunk events,
// and block until every chunk has reported, the run was cancelled, or the timeout
// expired. A timeout fails the whole array. The executor on top applies memoization
// and the per-chunk output post-condition and reports a tagged outcome.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use dashmap::DashSet;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::{BatchResources, DispatchSettings};
use crate::identity::TaskKey;
use crate::planner::ChunkPlan;
use crate::state::{JobTracker, StateError};
use crate::types::{ChunkFailure, ChunkFailureReason, ExpectedOutputSet, Outcome};

/// Environment variable carrying the partition index into every chunk command.
pub const ARRAY_INDEX_ENV: &str = "GENOFLOW_ARRAY_INDEX";

const CHILD_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Failed to start job array: {0}")]
    Start(String),
    #[error("Memo store error: {0}")]
    Memo(#[from] io::Error),
    #[error(transparent)]
    State(#[from] StateError),
}

/// One chunk as handed to a dispatcher.
#[derive(Debug, Clone)]
pub struct ChunkJob {
    pub index: usize,
    pub label: String,
    pub task_key: TaskKey,
    pub command: String,
    pub work_dir: PathBuf,
    pub log_path: PathBuf,
    pub outputs: ExpectedOutputSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkStatus {
    Started,
    Exited(Option<i32>),
    /// Stopped by cancellation or timeout.
    Killed,
    LaunchFailed(String),
}

impl ChunkStatus {
    fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEvent {
    pub index: usize,
    pub status: ChunkStatus,
}

/// Shared cancellation flag. Cancelling stops unstarted chunks and kills running ones.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How waiting on an array ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayReport {
    /// Every chunk reported, or the dispatcher closed its event stream.
    /// Chunks absent from the map never reported.
    Completed(BTreeMap<usize, ChunkStatus>),
    TimedOut { finished: usize, total: usize },
    Cancelled { finished: usize, total: usize },
}

/// A submitted array. `stop` is shared with whatever executes the chunks and
/// is raised when the waiter gives up on them.
pub struct ArrayRun {
    events: Receiver<ChunkEvent>,
    total: usize,
    stop: CancelToken,
    worker: Option<thread::JoinHandle<()>>,
}

impl ArrayRun {
    pub fn new(
        events: Receiver<ChunkEvent>,
        total: usize,
        stop: CancelToken,
        worker: Option<thread::JoinHandle<()>>,
    ) -> Self {
        Self {
            events,
            total,
            stop,
            worker,
        }
    }

    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Dispatch worker panicked");
            }
        }
    }

    /// Blocks until the array finishes, `cancel` is raised, or `timeout`
    /// elapses, checking for cancellation every `poll_interval`. A timeout too
    /// large to represent as an instant never expires. `on_event` sees every
    /// event as it arrives.
    pub fn wait(
        mut self,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &CancelToken,
        mut on_event: impl FnMut(&ChunkEvent),
    ) -> ArrayReport {
        let deadline = Instant::now().checked_add(timeout);
        let mut finished = BTreeMap::new();

        while finished.len() < self.total {
            if cancel.is_cancelled() {
                self.stop.cancel();
                self.join_worker();
                return ArrayReport::Cancelled {
                    finished: finished.len(),
                    total: self.total,
                };
            }
            let mut wait_for = poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    self.stop.cancel();
                    self.join_worker();
                    return ArrayReport::TimedOut {
                        finished: finished.len(),
                        total: self.total,
                    };
                }
                wait_for = wait_for.min(deadline - now);
            }
            match self.events.recv_timeout(wait_for) {
                Ok(event) => {
                    on_event(&event);
                    if event.status.is_terminal() {
                        finished.insert(event.index, event.status);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.join_worker();
        ArrayReport::Completed(finished)
    }
}

/// Submits planned chunks for execution.
pub trait JobArrayDispatcher {
    fn submit(
        &self,
        jobs: Vec<ChunkJob>,
        resources: &BatchResources,
    ) -> Result<ArrayRun, DispatchError>;
}

// ========================================================================================
//                                  Local execution
// ========================================================================================

/// Runs chunk commands with `sh -c` on a bounded pool of local workers.
#[derive(Debug, Clone)]
pub struct LocalDispatcher {
    workers: usize,
    shell: PathBuf,
}

impl LocalDispatcher {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            shell: PathBuf::from("sh"),
        }
    }

    pub fn from_settings(settings: &DispatchSettings) -> Self {
        Self::new(settings.workers())
    }
}

impl JobArrayDispatcher for LocalDispatcher {
    fn submit(
        &self,
        jobs: Vec<ChunkJob>,
        resources: &BatchResources,
    ) -> Result<ArrayRun, DispatchError> {
        debug!(
            "Local dispatch of {} chunk(s) on {} worker(s), ignoring scheduler hints (memory {} MB, queue {})",
            jobs.len(),
            self.workers,
            resources.memory_mb,
            resources.queue
        );
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("genoflow-chunk-{i}"))
            .build()
            .map_err(|e| DispatchError::Start(e.to_string()))?;

        let (tx, rx) = unbounded();
        let total = jobs.len();
        let stop = CancelToken::new();
        let token = stop.clone();
        let shell = self.shell.clone();
        let worker = thread::Builder::new()
            .name("genoflow-dispatch".to_string())
            .spawn(move || {
                pool.install(|| {
                    jobs.par_iter()
                        .with_max_len(1)
                        .for_each(|job| run_chunk(&shell, job, &tx, &token));
                });
            })
            .map_err(|e| DispatchError::Start(e.to_string()))?;

        Ok(ArrayRun::new(rx, total, stop, Some(worker)))
    }
}

fn run_chunk(shell: &Path, job: &ChunkJob, events: &Sender<ChunkEvent>, cancel: &CancelToken) {
    if cancel.is_cancelled() {
        return;
    }
    let status = spawn_and_wait(shell, job, events, cancel)
        .unwrap_or_else(|e| ChunkStatus::LaunchFailed(e.to_string()));
    // The receiver is gone once the waiter gave up; nothing is listening then.
    let _ = events.send(ChunkEvent {
        index: job.index,
        status,
    });
}

fn spawn_and_wait(
    shell: &Path,
    job: &ChunkJob,
    events: &Sender<ChunkEvent>,
    cancel: &CancelToken,
) -> io::Result<ChunkStatus> {
    if let Some(dir) = job.log_path.parent() {
        fs::create_dir_all(dir)?;
    }
    let log = File::create(&job.log_path)?;
    let mut child = Command::new(shell)
        .arg("-c")
        .arg(&job.command)
        .current_dir(&job.work_dir)
        .env(ARRAY_INDEX_ENV, job.index.to_string())
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .spawn()?;
    debug!("Started {} (pid {})", job.label, child.id());
    let _ = events.send(ChunkEvent {
        index: job.index,
        status: ChunkStatus::Started,
    });

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(ChunkStatus::Exited(status.code()));
        }
        if cancel.is_cancelled() {
            if let Err(e) = child.kill() {
                debug!("Kill of {} failed: {e}", job.label);
            }
            child.wait()?;
            return Ok(ChunkStatus::Killed);
        }
        thread::sleep(CHILD_POLL);
    }
}

// ========================================================================================
//                                     Memoization
// ========================================================================================

/// Records task keys whose work has completed.
pub trait MemoStore: Send + Sync {
    fn is_recorded(&self, key: &TaskKey) -> bool;

    fn record(&self, key: &TaskKey) -> io::Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryMemo {
    done: DashSet<TaskKey>,
}

impl InMemoryMemo {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoStore for InMemoryMemo {
    fn is_recorded(&self, key: &TaskKey) -> bool {
        self.done.contains(key)
    }

    fn record(&self, key: &TaskKey) -> io::Result<()> {
        self.done.insert(*key);
        Ok(())
    }
}

/// Marker files under `<work_dir>/.memo`, so completion survives re-runs.
#[derive(Debug, Clone)]
pub struct FileMemo {
    dir: PathBuf,
}

impl FileMemo {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn in_work_dir(work_dir: &Path) -> Self {
        Self::new(work_dir.join(".memo"))
    }

    fn marker(&self, key: &TaskKey) -> PathBuf {
        self.dir.join(format!("{key}.done"))
    }
}

impl MemoStore for FileMemo {
    fn is_recorded(&self, key: &TaskKey) -> bool {
        self.marker(key).is_file()
    }

    fn record(&self, key: &TaskKey) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.marker(key), format!("{key}\n"))
    }
}

// ========================================================================================
//                                   Array execution
// ========================================================================================

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(10)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

/// Runs planned arrays through a dispatcher with memoization and post-condition checks.
pub struct ArrayExecutor<'a> {
    dispatcher: &'a dyn JobArrayDispatcher,
    memo: &'a dyn MemoStore,
    settings: DispatchSettings,
    resources: BatchResources,
    cancel: CancelToken,
    show_progress: bool,
}

impl<'a> ArrayExecutor<'a> {
    pub fn new(
        dispatcher: &'a dyn JobArrayDispatcher,
        memo: &'a dyn MemoStore,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            dispatcher,
            memo,
            settings,
            resources: BatchResources::default(),
            cancel: CancelToken::new(),
            show_progress: false,
        }
    }

    pub fn with_resources(mut self, resources: BatchResources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Runs `plan`, recording progress in `tracker`.
    ///
    /// Chunks whose key is memoized and whose outputs are present are not run
    /// again. An array whose key is memoized and whose outputs all verify is not
    /// submitted at all.
    pub fn execute(
        &self,
        plan: &ChunkPlan,
        tracker: &mut JobTracker,
    ) -> Result<Outcome<Vec<ExpectedOutputSet>>, DispatchError> {
        tracker.dispatched()?;
        if self.cancel.is_cancelled() {
            tracker.cancelled()?;
            return Ok(Outcome::Cancelled);
        }

        if self.memo.is_recorded(&plan.array_key)
            && plan.outputs.iter().all(|set| set.missing_files().is_empty())
        {
            info!("{} already complete (array {})", plan.label, plan.array_key);
            for spec in &plan.specs {
                tracker.chunk_finished(spec.index, true)?;
            }
            tracker.settle()?;
            return Ok(Outcome::Success(plan.outputs.clone()));
        }

        let mut to_run = Vec::new();
        for job in plan.jobs() {
            if self.memo.is_recorded(&job.task_key) && job.outputs.missing_files().is_empty() {
                debug!("Skipping memoized {}", job.label);
                tracker.chunk_finished(job.index, true)?;
            } else {
                to_run.push(job);
            }
        }

        let mut failures = Vec::new();
        if !to_run.is_empty() {
            info!(
                "Dispatching {} of {} chunk(s) for {}",
                to_run.len(),
                plan.len(),
                plan.label
            );
            let pending: Vec<ChunkJob> = to_run.clone();
            let run = self.dispatcher.submit(to_run, &self.resources)?;

            let pb = self
                .show_progress
                .then(|| create_progress_bar(pending.len() as u64, &plan.label.to_string()));
            let mut state_error = None;
            let report = run.wait(
                self.settings.timeout(),
                self.settings.poll_interval(),
                &self.cancel,
                |event| {
                    let result = match &event.status {
                        ChunkStatus::Started => tracker.chunk_started(event.index),
                        _ => {
                            if let Some(pb) = &pb {
                                pb.inc(1);
                            }
                            Ok(())
                        }
                    };
                    if let Err(e) = result {
                        state_error.get_or_insert(e);
                    }
                },
            );
            if let Some(pb) = &pb {
                pb.finish_and_clear();
            }
            if let Some(e) = state_error {
                return Err(e.into());
            }

            let statuses = match report {
                ArrayReport::Completed(statuses) => statuses,
                ArrayReport::Cancelled { finished, total } => {
                    warn!("{} cancelled after {finished} of {total} chunk(s)", plan.label);
                    tracker.cancelled()?;
                    return Ok(Outcome::Cancelled);
                }
                ArrayReport::TimedOut { finished, total } => {
                    tracker.settle()?;
                    return Ok(Outcome::Failure(format!(
                        "{} timed out after {:?} with {finished} of {total} chunk(s) finished",
                        plan.label,
                        self.settings.timeout()
                    )));
                }
            };

            for job in &pending {
                let reason = match statuses.get(&job.index) {
                    Some(ChunkStatus::Exited(Some(0))) => {
                        let missing = job.outputs.missing_files();
                        if missing.is_empty() {
                            self.memo.record(&job.task_key)?;
                            None
                        } else {
                            Some(ChunkFailureReason::MissingOutputs(missing))
                        }
                    }
                    Some(ChunkStatus::Exited(code)) => Some(ChunkFailureReason::ExitStatus(*code)),
                    Some(ChunkStatus::Killed) => Some(ChunkFailureReason::ExitStatus(None)),
                    Some(ChunkStatus::LaunchFailed(message)) => {
                        Some(ChunkFailureReason::Launch(message.clone()))
                    }
                    Some(ChunkStatus::Started) | None => Some(ChunkFailureReason::NotReported),
                };
                tracker.chunk_finished(job.index, reason.is_none())?;
                if let Some(reason) = reason {
                    warn!("{} failed: {reason} (log: {})", job.label, job.log_path.display());
                    failures.push(ChunkFailure {
                        index: job.index,
                        label: job.label.clone(),
                        reason,
                    });
                }
            }
        }

        tracker.settle()?;
        if failures.is_empty() {
            self.memo.record(&plan.array_key)?;
            Ok(Outcome::Success(plan.outputs.clone()))
        } else {
            failures.sort_by_key(|f| f.index);
            Ok(Outcome::Incomplete(failures))
        }
    }
}
