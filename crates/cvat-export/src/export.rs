// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 CVAT Export Contributors. All Rights Reserved.

//! Concurrent export of many tasks.
//!
//! Every task id becomes one job that walks through the following states,
//! owned by a single worker from start to finish:
//!
//! ```text
//! Submitted -> Polling -> Ready -> Downloaded -> Decoded -> Written
//!      \__________\__________\__________\___________\-----> Failed
//! ```
//!
//! Jobs run on the Tokio runtime, limited to [`ExportConfig::workers`]
//! concurrent exports. A failed job is recorded in the error log and in the
//! returned [`ExportReport`]; it never stops the other jobs.
//!
//! # Example
//!
//! ```rust,no_run
//! use cvat_export::{Client, ExportConfig, ExportFormat, ExportOrchestrator, TaskId};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), cvat_export::Error> {
//! let client = Client::new()?
//!     .with_server("https://app.cvat.ai")?
//!     .with_login("user", "password")
//!     .await?;
//!
//! let config = ExportConfig::new(ExportFormat::Yolo)
//!     .with_output_dir("exports")
//!     .with_images(true);
//!
//! let orchestrator = ExportOrchestrator::new(Arc::new(client), config)?;
//! orchestrator.submit([TaskId::try_from(12u64).unwrap(), TaskId::try_from(13u64).unwrap()]);
//! let report = orchestrator.shutdown().await?;
//! println!("{} exported, {} failed", report.succeeded.len(), report.failed.len());
//! # Ok(())
//! # }
//! ```

use crate::{
    ArchiveDecoder, Dataset, Error, ExportAction, ExportApi, ExportFormat, ExportRequest,
    ExportStatus, OutputLayout, PollPolicy, TaskId, archive::decoder_for,
    error_log::{ErrorLog, ErrorRecorder},
};
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use futures::future::join_all;
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Semaphore, mpsc::Sender},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Default number of concurrent exports.
pub const DEFAULT_WORKERS: usize = 4;

/// Environment prefix for configuration overrides, e.g.
/// `CVAT_EXPORT_WORKERS=8`.
pub const ENV_PREFIX: &str = "CVAT_EXPORT";

/// Settings of an export run.
///
/// Every field has a default, so a configuration file only needs the values
/// it changes:
///
/// ```toml
/// format = "yolo"
/// output_dir = "/data/exports"
/// include_images = true
/// workers = 8
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ExportConfig {
    /// Annotation format requested from the server.
    pub format: ExportFormat,
    /// Root directory receiving one `task_<id>` folder per task.
    pub output_dir: PathBuf,
    /// Also download and convert the task images.
    pub include_images: bool,
    /// Number of concurrent exports.
    pub workers: usize,
    /// Maximum number of export requests per task.
    pub max_attempts: u32,
    /// Pause between two export requests of the same task.
    pub poll_interval_ms: u64,
    /// File receiving the ids of failed tasks.
    pub error_log: PathBuf,
    /// How archive paths map to output files.
    pub layout: OutputLayout,
}

impl Default for ExportConfig {
    fn default() -> Self {
        let poll = PollPolicy::default();
        ExportConfig {
            format: ExportFormat::default(),
            output_dir: PathBuf::from("."),
            include_images: false,
            workers: DEFAULT_WORKERS,
            max_attempts: poll.max_attempts,
            poll_interval_ms: poll.interval.as_millis() as u64,
            error_log: PathBuf::from("error.txt"),
            layout: OutputLayout::default(),
        }
    }
}

impl ExportConfig {
    pub fn new(format: ExportFormat) -> Self {
        ExportConfig {
            format,
            ..Default::default()
        }
    }

    /// Loads the configuration from a TOML file and the environment.
    ///
    /// Sources, lowest priority first:
    ///
    /// 1. built-in defaults
    /// 2. `path`, or the per-user `config.toml` if `path` is `None` (the
    ///    per-user file is optional, an explicit `path` is not)
    /// 3. `CVAT_EXPORT_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => builder = builder.add_source(config::File::from(path)),
            None => {
                if let Some(default) = Self::default_config_path() {
                    debug!("looking for configuration in {:?}", default);
                    builder =
                        builder.add_source(config::File::from(default.as_path()).required(false));
                }
            }
        }

        let config: ExportConfig = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Per-user configuration file, e.g. `~/.config/cvat-export/config.toml`
    /// on Linux.
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "cvat-export").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn with_output_dir(self, output_dir: impl Into<PathBuf>) -> Self {
        ExportConfig {
            output_dir: output_dir.into(),
            ..self
        }
    }

    pub fn with_images(self, include_images: bool) -> Self {
        ExportConfig {
            include_images,
            ..self
        }
    }

    pub fn with_workers(self, workers: usize) -> Self {
        ExportConfig { workers, ..self }
    }

    pub fn with_poll_policy(self, policy: PollPolicy) -> Self {
        ExportConfig {
            max_attempts: policy.max_attempts,
            poll_interval_ms: policy.interval.as_millis() as u64,
            ..self
        }
    }

    pub fn with_error_log(self, error_log: impl Into<PathBuf>) -> Self {
        ExportConfig {
            error_log: error_log.into(),
            ..self
        }
    }

    pub fn with_layout(self, layout: OutputLayout) -> Self {
        ExportConfig { layout, ..self }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.poll_interval_ms),
        )
    }

    /// Output directory of a single task.
    pub fn task_dir(&self, task_id: TaskId) -> PathBuf {
        self.output_dir.join(task_id.dir_name())
    }

    /// Rejects settings that would make every job fail or hang.
    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::InvalidParameters(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(Error::InvalidParameters(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.error_log.is_dir() {
            return Err(Error::InvalidParameters(format!(
                "error log {:?} is a directory",
                self.error_log
            )));
        }
        Ok(())
    }
}

/// Progress information for an export run.
///
/// `current` counts finished jobs (successful or not) out of `total`
/// submitted jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
}

/// Lifecycle of a single export job.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum JobState {
    Submitted,
    Polling,
    Ready,
    Downloaded,
    Decoded,
    Written,
    Failed,
}

/// A task whose dataset was written to disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExportedTask {
    pub task_id: TaskId,
    pub output_dir: PathBuf,
    /// Number of images written, zero when images were not requested.
    pub images: usize,
    /// Number of annotation files written.
    pub annotations: usize,
}

/// A task whose export failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailedTask {
    pub task_id: TaskId,
    /// Last state the job reached before failing.
    pub state: JobState,
    pub reason: String,
}

/// Outcome of the jobs collected by [`ExportOrchestrator::wait`].
///
/// Both lists are sorted by task id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExportReport {
    pub succeeded: Vec<ExportedTask>,
    pub failed: Vec<FailedTask>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Set when failed task ids could not be appended to the error log.
    pub error_log_failure: Option<String>,
}

impl ExportReport {
    fn empty() -> Self {
        let now = Utc::now();
        ExportReport {
            succeeded: Vec::new(),
            failed: Vec::new(),
            started_at: now,
            finished_at: now,
            error_log_failure: None,
        }
    }

    pub fn succeeded_ids(&self) -> Vec<TaskId> {
        self.succeeded.iter().map(|t| t.task_id).collect()
    }

    pub fn failed_ids(&self) -> Vec<TaskId> {
        self.failed.iter().map(|t| t.task_id).collect()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// True when no job failed.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    fn merge(&mut self, other: ExportReport) {
        if self.total() == 0 {
            self.started_at = other.started_at;
        } else {
            self.started_at = self.started_at.min(other.started_at);
        }
        self.finished_at = self.finished_at.max(other.finished_at);
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
        self.error_log_failure = self.error_log_failure.take().or(other.error_log_failure);
        self.sort();
    }

    fn sort(&mut self) {
        self.succeeded.sort_by_key(|t| t.task_id);
        self.failed.sort_by_key(|t| t.task_id);
    }
}

type JobOutcome = Result<ExportedTask, FailedTask>;

/// State shared read-only by every job, apart from the counters and the set
/// of active task ids.
struct Shared {
    api: Arc<dyn ExportApi>,
    config: ExportConfig,
    decoder: Arc<dyn ArchiveDecoder>,
    workers: Semaphore,
    cancel: CancellationToken,
    recorder: ErrorRecorder,
    active: Mutex<HashSet<TaskId>>,
    submitted: AtomicUsize,
    completed: AtomicUsize,
}

impl Shared {
    fn release(&self, task_id: TaskId) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_id);
    }
}

struct PendingJob {
    task_id: TaskId,
    submitted_at: DateTime<Utc>,
    handle: JoinHandle<JobOutcome>,
}

/// Runs export jobs for many tasks on a bounded worker pool.
///
/// The orchestrator must be created inside a Tokio runtime. Call
/// [`shutdown`](Self::shutdown) before dropping it: jobs that are still
/// running when the orchestrator is dropped keep running detached and the
/// error log is not flushed.
pub struct ExportOrchestrator {
    shared: Arc<Shared>,
    error_log: ErrorLog,
    jobs: Mutex<Vec<PendingJob>>,
    progress: Option<Sender<Progress>>,
}

impl ExportOrchestrator {
    /// Validates `config`, selects the archive decoder and starts the error
    /// log writer. No request is sent until tasks are submitted.
    pub fn new(api: Arc<dyn ExportApi>, config: ExportConfig) -> Result<Self, Error> {
        config.validate()?;

        let decoder: Arc<dyn ArchiveDecoder> = Arc::from(decoder_for(config.format));
        let error_log = ErrorLog::open(&config.error_log);

        info!(
            "exporting as {} into {:?} with {} workers (images: {})",
            config.format.wire_name(),
            config.output_dir,
            config.workers,
            config.include_images
        );

        let shared = Shared {
            api,
            decoder,
            workers: Semaphore::new(config.workers),
            cancel: CancellationToken::new(),
            recorder: error_log.recorder(),
            active: Mutex::new(HashSet::new()),
            submitted: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            config,
        };

        Ok(ExportOrchestrator {
            shared: Arc::new(shared),
            error_log,
            jobs: Mutex::new(Vec::new()),
            progress: None,
        })
    }

    /// Sends a [`Progress`] update after every finished job.
    pub fn with_progress(self, progress: Sender<Progress>) -> Self {
        ExportOrchestrator {
            progress: Some(progress),
            ..self
        }
    }

    pub fn config(&self) -> &ExportConfig {
        &self.shared.config
    }

    pub fn error_log_path(&self) -> &Path {
        self.error_log.path()
    }

    /// Token that cancels every submitted job when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Cancels every running and queued job.
    ///
    /// Jobs notice the cancellation before their next request, during poll
    /// pauses and before decoding or writing. Cancelled jobs are reported as
    /// failed and recorded in the error log.
    pub fn cancel(&self) {
        warn!("export cancelled");
        self.shared.cancel.cancel();
    }

    /// Dispatches one job per task id and returns immediately.
    ///
    /// Ids that already have a job in flight are skipped. Returns the number
    /// of jobs dispatched.
    pub fn submit(&self, task_ids: impl IntoIterator<Item = TaskId>) -> usize {
        let mut dispatched = Vec::new();

        {
            let mut active = self
                .shared
                .active
                .lock()
                .unwrap_or_else(|e| e.into_inner());

            for task_id in task_ids {
                if !active.insert(task_id) {
                    warn!("task {} is already being exported, skipping", task_id);
                    continue;
                }
                dispatched.push(task_id);
            }
        }

        self.shared
            .submitted
            .fetch_add(dispatched.len(), Ordering::SeqCst);

        let pending = dispatched.iter().map(|&task_id| {
            let shared = self.shared.clone();
            let progress = self.progress.clone();

            PendingJob {
                task_id,
                submitted_at: Utc::now(),
                handle: tokio::spawn(async move {
                    let outcome = run_job(&shared, task_id).await;
                    shared.release(task_id);

                    let current = shared.completed.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(progress) = &progress {
                        let _ = progress
                            .send(Progress {
                                current,
                                total: shared.submitted.load(Ordering::SeqCst),
                            })
                            .await;
                    }

                    outcome
                }),
            }
        });

        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(pending);

        debug!("dispatched {} export jobs", dispatched.len());
        dispatched.len()
    }

    /// Waits for every job submitted so far and reports their outcome.
    pub async fn wait(&self) -> Result<ExportReport, Error> {
        let pending = std::mem::take(&mut *self.jobs.lock().unwrap_or_else(|e| e.into_inner()));
        if pending.is_empty() {
            return Ok(ExportReport::empty());
        }

        let started_at = pending
            .iter()
            .map(|job| job.submitted_at)
            .min()
            .unwrap_or_else(Utc::now);

        let (task_ids, handles): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .map(|job| (job.task_id, job.handle))
            .unzip();

        let mut report = ExportReport::empty();
        report.started_at = started_at;

        for (task_id, joined) in task_ids.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(Ok(exported)) => report.succeeded.push(exported),
                Ok(Err(failed)) => report.failed.push(failed),
                Err(err) => {
                    error!("export job for task {} aborted: {}", task_id, err);
                    self.shared.release(task_id);
                    self.shared.recorder.record(task_id).await;
                    report.failed.push(FailedTask {
                        task_id,
                        state: JobState::Failed,
                        reason: Error::from(err).to_string(),
                    });
                }
            }
        }

        report.finished_at = Utc::now();
        report.sort();
        Ok(report)
    }

    /// Submits `task_ids` and waits for all outstanding jobs.
    pub async fn export(
        &self,
        task_ids: impl IntoIterator<Item = TaskId>,
    ) -> Result<ExportReport, Error> {
        self.submit(task_ids);
        self.wait().await
    }

    /// Waits for in-flight jobs, flushes the error log and releases the
    /// worker pool.
    ///
    /// Returns the report of every job that had not been collected by an
    /// earlier [`wait`](Self::wait). A failing error log does not discard
    /// the report; it is noted in [`ExportReport::error_log_failure`].
    pub async fn shutdown(self) -> Result<ExportReport, Error> {
        let mut report = ExportReport::empty();
        loop {
            let collected = self.wait().await?;
            if collected.total() == 0 {
                break;
            }
            report.merge(collected);
        }

        let ExportOrchestrator {
            shared, error_log, ..
        } = self;
        shared.workers.close();
        drop(shared);

        let error_log_path = error_log.path().to_path_buf();
        match error_log.close().await {
            Ok(logged) if logged > 0 => {
                warn!("{} failed tasks recorded in {:?}", logged, error_log_path);
            }
            Ok(_) => {}
            Err(err) => {
                error!("could not write error log {:?}: {}", error_log_path, err);
                report.error_log_failure = Some(err.to_string());
            }
        }

        info!(
            "export finished: {} succeeded, {} failed",
            report.succeeded.len(),
            report.failed.len()
        );
        Ok(report)
    }
}

/// A single task moving through the export states.
struct ExportJob {
    task_id: TaskId,
    state: JobState,
    output_dir: PathBuf,
}

impl ExportJob {
    fn new(task_id: TaskId, output_dir: PathBuf) -> Self {
        ExportJob {
            task_id,
            state: JobState::Submitted,
            output_dir,
        }
    }

    fn advance(&mut self, state: JobState) {
        debug!("task {}: {:?} -> {:?}", self.task_id, self.state, state);
        self.state = state;
    }
}

async fn run_job(shared: &Shared, task_id: TaskId) -> JobOutcome {
    let mut job = ExportJob::new(task_id, shared.config.task_dir(task_id));

    let result = match shared.workers.acquire().await {
        Ok(_permit) => execute(shared, &mut job).await,
        Err(err) => Err(err.into()),
    };

    match result {
        Ok(exported) => {
            info!(
                "task {} exported to {:?} ({} images, {} annotation files)",
                task_id, exported.output_dir, exported.images, exported.annotations
            );
            Ok(exported)
        }
        Err(err) => {
            error!(
                "task {} failed after reaching {:?}: {}",
                task_id, job.state, err
            );
            let state = job.state;
            job.advance(JobState::Failed);
            shared.recorder.record(task_id).await;
            Err(FailedTask {
                task_id,
                state,
                reason: err.to_string(),
            })
        }
    }
}

#[cfg_attr(feature = "profiling", tracing::instrument(skip_all, fields(task_id = %job.task_id)))]
async fn execute(shared: &Shared, job: &mut ExportJob) -> Result<ExportedTask, Error> {
    let archive = fetch_archive(shared, job).await?;

    ensure_active(&shared.cancel)?;
    let decoder = shared.decoder.clone();
    let dataset = tokio::task::spawn_blocking(move || decoder.decode(&archive)).await??;
    job.advance(JobState::Decoded);

    ensure_active(&shared.cancel)?;
    let output_dir = job.output_dir.clone();
    let include_images = shared.config.include_images;
    let layout = shared.config.layout;
    let (images, annotations) = tokio::task::spawn_blocking(move || {
        materialize(&dataset, &output_dir, include_images, layout)
    })
    .await??;
    job.advance(JobState::Written);

    Ok(ExportedTask {
        task_id: job.task_id,
        output_dir: job.output_dir.clone(),
        images,
        annotations,
    })
}

/// Polls the export until the archive is available and downloads it.
///
/// At most `max_attempts` `Prepare` requests are sent. Once the server
/// answers `Accepted` the archive is fetched with `Download` requests, which
/// get a budget of their own so that a ready export is always downloaded.
#[cfg_attr(feature = "profiling", tracing::instrument(skip_all, fields(task_id = %job.task_id)))]
async fn fetch_archive(shared: &Shared, job: &mut ExportJob) -> Result<Vec<u8>, Error> {
    let policy = shared.config.poll_policy();
    let request = ExportRequest {
        task_id: job.task_id,
        format: shared.config.format,
        with_images: shared.config.include_images,
        action: ExportAction::Prepare,
    };

    job.advance(JobState::Polling);

    for attempt in 1..=policy.max_attempts {
        ensure_active(&shared.cancel)?;

        match shared.api.request_export(&request).await? {
            ExportStatus::Ready(archive) => {
                job.advance(JobState::Ready);
                return Ok(downloaded(job, archive, attempt));
            }
            ExportStatus::Accepted => {
                job.advance(JobState::Ready);
                return download(shared, job, request, &policy).await;
            }
            status => {
                trace!(
                    "task {}: attempt {}/{} answered {:?}",
                    job.task_id, attempt, policy.max_attempts, status
                );
            }
        }

        pause_after(shared, &policy, attempt).await?;
    }

    Err(Error::ExportTimeout {
        task_id: job.task_id,
        attempts: policy.max_attempts,
    })
}

/// Fetches an export the server has accepted.
async fn download(
    shared: &Shared,
    job: &mut ExportJob,
    request: ExportRequest,
    policy: &PollPolicy,
) -> Result<Vec<u8>, Error> {
    let request = ExportRequest {
        action: ExportAction::Download,
        ..request
    };

    for attempt in 1..=policy.max_attempts {
        ensure_active(&shared.cancel)?;

        match shared.api.request_export(&request).await? {
            ExportStatus::Ready(archive) => return Ok(downloaded(job, archive, attempt)),
            status => {
                trace!(
                    "task {}: download {}/{} answered {:?}",
                    job.task_id, attempt, policy.max_attempts, status
                );
            }
        }

        pause_after(shared, policy, attempt).await?;
    }

    Err(Error::DownloadIncomplete {
        task_id: job.task_id,
        attempts: policy.max_attempts,
    })
}

fn downloaded(job: &mut ExportJob, archive: Vec<u8>, attempt: u32) -> Vec<u8> {
    job.advance(JobState::Downloaded);
    debug!(
        "task {}: downloaded {} bytes after {} requests",
        job.task_id,
        archive.len(),
        attempt
    );
    archive
}

/// Sleeps between two requests unless `attempt` was the last one.
async fn pause_after(shared: &Shared, policy: &PollPolicy, attempt: u32) -> Result<(), Error> {
    if attempt < policy.max_attempts && !policy.pause(&shared.cancel).await {
        return Err(Error::Cancelled);
    }
    Ok(())
}

fn ensure_active(cancel: &CancellationToken) -> Result<(), Error> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Writes the dataset below `output_dir`.
///
/// If the task directory did not exist before and writing fails, it is
/// removed again so that only completed tasks leave a directory behind.
fn materialize(
    dataset: &Dataset,
    output_dir: &Path,
    include_images: bool,
    layout: OutputLayout,
) -> Result<(usize, usize), Error> {
    let created = !output_dir.exists();

    let result = write_task_dir(dataset, output_dir, include_images, layout);
    if result.is_err()
        && created
        && let Err(err) = fs::remove_dir_all(output_dir)
    {
        warn!(
            "could not remove incomplete output {:?}: {}",
            output_dir, err
        );
    }
    result
}

fn write_task_dir(
    dataset: &Dataset,
    output_dir: &Path,
    include_images: bool,
    layout: OutputLayout,
) -> Result<(usize, usize), Error> {
    let labels_dir = output_dir.join("labels");
    fs::create_dir_all(&labels_dir)?;

    let images = if include_images {
        let images_dir = output_dir.join("images");
        fs::create_dir_all(&images_dir)?;
        dataset.write_images(&images_dir, layout)?
    } else {
        0
    };

    let annotations = dataset.write_annotations(&labels_dir, layout)?;
    Ok((images, annotations))
}
