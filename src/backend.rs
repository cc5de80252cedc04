use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::RunConfig;
use crate::domain::ExecutionMode;
use crate::error::SraError;
use crate::jobs::{ChunkJob, JobBatch};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "code")]
pub enum JobOutcome {
    Succeeded,
    Failed(Option<i32>),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub index: usize,
    pub outcome: JobOutcome,
}

/// Per-job outcomes plus whether the batch was stopped by a signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchStatus {
    pub jobs: Vec<JobStatus>,
    pub cancelled: bool,
}

impl BatchStatus {
    pub fn succeeded(&self) -> bool {
        !self.cancelled
            && self
                .jobs
                .iter()
                .all(|job| job.outcome == JobOutcome::Succeeded)
    }

    pub fn failed_indices(&self) -> Vec<usize> {
        self.jobs
            .iter()
            .filter(|job| job.outcome != JobOutcome::Succeeded)
            .map(|job| job.index)
            .collect()
    }
}

/// Where and how a batch is submitted.
#[derive(Debug, Clone)]
pub struct SubmitContext {
    pub job_name: String,
    pub logs_dir: Utf8PathBuf,
    pub workdir: Utf8PathBuf,
    pub queues: Vec<String>,
    pub cpu: u32,
    pub memory_gb: u32,
}

impl SubmitContext {
    pub fn from_config(config: &RunConfig, logs_dir: Utf8PathBuf) -> Self {
        Self {
            job_name: config.job_name.clone(),
            logs_dir,
            workdir: config.workdir.clone(),
            queues: config.queues.clone(),
            cpu: config.cpu,
            memory_gb: config.memory_gb,
        }
    }

    fn chunk_name(&self, job: &ChunkJob) -> String {
        format!("{}_{}", self.job_name, job.index)
    }
}

/// Runs a compiled batch. `await_completion` blocks until every job has an
/// outcome or `cancel` trips, in which case in-flight jobs are stopped.
pub trait JobBackend {
    type Handle;

    fn submit(&self, batch: &JobBatch, ctx: &SubmitContext) -> Result<Self::Handle, SraError>;
    fn await_completion(
        &self,
        handle: Self::Handle,
        cancel: &CancelToken,
    ) -> Result<BatchStatus, SraError>;
}

#[derive(Debug, Clone)]
pub enum Backend {
    Local(LocalBackend),
    Clustered(ClusterBackend),
}

impl Backend {
    pub fn for_mode(mode: ExecutionMode) -> Self {
        match mode {
            ExecutionMode::Local => Backend::Local(LocalBackend),
            ExecutionMode::Clustered => Backend::Clustered(ClusterBackend::new()),
        }
    }
}

impl JobBackend for Backend {
    type Handle = RunningBatch;

    fn submit(&self, batch: &JobBatch, ctx: &SubmitContext) -> Result<RunningBatch, SraError> {
        match self {
            Backend::Local(local) => local.submit(batch, ctx),
            Backend::Clustered(cluster) => cluster.submit(batch, ctx),
        }
    }

    fn await_completion(
        &self,
        handle: RunningBatch,
        cancel: &CancelToken,
    ) -> Result<BatchStatus, SraError> {
        match self {
            Backend::Local(local) => local.await_completion(handle, cancel),
            Backend::Clustered(cluster) => cluster.await_completion(handle, cancel),
        }
    }
}

#[derive(Debug)]
pub struct RunningJob {
    index: usize,
    name: String,
    child: Child,
}

#[derive(Debug)]
pub struct RunningBatch {
    jobs: Vec<RunningJob>,
}

/// Every chunk as a direct child process, all started at once.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBackend;

impl JobBackend for LocalBackend {
    type Handle = RunningBatch;

    fn submit(&self, batch: &JobBatch, ctx: &SubmitContext) -> Result<RunningBatch, SraError> {
        let mut running = RunningBatch { jobs: Vec::new() };
        for job in &batch.jobs {
            let name = ctx.chunk_name(job);
            let (program, args) = split_command(job)?;
            let mut cmd = Command::new(program);
            cmd.args(args).current_dir(ctx.workdir.as_std_path());
            redirect_output(&mut cmd, &ctx.logs_dir, &name)?;
            match cmd.spawn() {
                Ok(child) => {
                    debug!(chunk = job.index, pid = child.id(), "chunk job started");
                    running.jobs.push(RunningJob {
                        index: job.index,
                        name,
                        child,
                    });
                }
                Err(err) => {
                    stop_all(&mut running.jobs);
                    return Err(SraError::Submit(format!("{program}: {err}")));
                }
            }
        }
        info!(jobs = running.jobs.len(), "submitted chunk jobs locally");
        Ok(running)
    }

    fn await_completion(
        &self,
        handle: RunningBatch,
        cancel: &CancelToken,
    ) -> Result<BatchStatus, SraError> {
        wait_all(handle.jobs, cancel, |_| {})
    }
}

/// Each chunk as its own SGE job through `qsub -sync y`, so the qsub process
/// exits with the job's exit status.
#[derive(Debug, Clone)]
pub struct ClusterBackend {
    qsub: PathBuf,
    qdel: PathBuf,
}

impl ClusterBackend {
    pub fn new() -> Self {
        Self::with_programs(PathBuf::from("qsub"), PathBuf::from("qdel"))
    }

    pub fn with_programs(qsub: PathBuf, qdel: PathBuf) -> Self {
        Self { qsub, qdel }
    }

    pub fn qsub_args(&self, job: &ChunkJob, ctx: &SubmitContext) -> Vec<String> {
        let mut args = vec![
            "-sync".to_string(),
            "y".to_string(),
            "-b".to_string(),
            "y".to_string(),
            "-cwd".to_string(),
            "-terse".to_string(),
            "-N".to_string(),
            ctx.chunk_name(job),
            "-o".to_string(),
            ctx.logs_dir.to_string(),
            "-e".to_string(),
            ctx.logs_dir.to_string(),
            "-l".to_string(),
            format!("h_vmem={}G", ctx.memory_gb),
        ];
        if !ctx.queues.is_empty() {
            args.push("-q".to_string());
            args.push(ctx.queues.join(","));
        }
        if ctx.cpu > 1 {
            args.push("-pe".to_string());
            args.push("smp".to_string());
            args.push(ctx.cpu.to_string());
        }
        args.extend(job.command.iter().cloned());
        args
    }

    fn delete_jobs(&self, names: &[String]) {
        for name in names {
            match Command::new(&self.qdel).arg(name).output() {
                Ok(output) if output.status.success() => debug!(job = %name, "qdel ok"),
                Ok(output) => warn!(
                    job = %name,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "qdel failed"
                ),
                Err(err) => warn!(job = %name, error = %err, "qdel failed"),
            }
        }
    }
}

impl Default for ClusterBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl JobBackend for ClusterBackend {
    type Handle = RunningBatch;

    fn submit(&self, batch: &JobBatch, ctx: &SubmitContext) -> Result<RunningBatch, SraError> {
        let mut running = RunningBatch { jobs: Vec::new() };
        for job in &batch.jobs {
            let name = ctx.chunk_name(job);
            let mut cmd = Command::new(&self.qsub);
            cmd.args(self.qsub_args(job, ctx))
                .current_dir(ctx.workdir.as_std_path());
            redirect_output(&mut cmd, &ctx.logs_dir, &format!("{name}.qsub"))?;
            match cmd.spawn() {
                Ok(child) => running.jobs.push(RunningJob {
                    index: job.index,
                    name,
                    child,
                }),
                Err(err) => {
                    let names = running
                        .jobs
                        .iter()
                        .map(|job| job.name.clone())
                        .collect::<Vec<_>>();
                    stop_all(&mut running.jobs);
                    self.delete_jobs(&names);
                    return Err(SraError::Submit(format!("{}: {err}", self.qsub.display())));
                }
            }
        }
        info!(
            jobs = running.jobs.len(),
            queues = %ctx.queues.join(","),
            "submitted chunk jobs to cluster"
        );
        Ok(running)
    }

    fn await_completion(
        &self,
        handle: RunningBatch,
        cancel: &CancelToken,
    ) -> Result<BatchStatus, SraError> {
        wait_all(handle.jobs, cancel, |names| self.delete_jobs(names))
    }
}

fn split_command(job: &ChunkJob) -> Result<(&str, &[String]), SraError> {
    job.command
        .split_first()
        .map(|(program, args)| (program.as_str(), args))
        .ok_or_else(|| SraError::Submit(format!("chunk {} has an empty command", job.index)))
}

fn redirect_output(cmd: &mut Command, logs_dir: &Utf8Path, name: &str) -> Result<(), SraError> {
    let log_path = logs_dir.join(format!("{name}.log"));
    let stdout = File::create(log_path.as_std_path())
        .map_err(|err| SraError::Filesystem(format!("create {log_path}: {err}")))?;
    let stderr = stdout
        .try_clone()
        .map_err(|err| SraError::Filesystem(err.to_string()))?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    Ok(())
}

fn stop_all(jobs: &mut [RunningJob]) {
    for job in jobs {
        let _ = job.child.kill();
        let _ = job.child.wait();
    }
}

/// Polls children until all exit. On cancellation the remaining ones are
/// killed, reported as cancelled, and their names handed to `on_cancel`.
fn wait_all<F>(
    jobs: Vec<RunningJob>,
    cancel: &CancelToken,
    on_cancel: F,
) -> Result<BatchStatus, SraError>
where
    F: FnMut(&[String]),
{
    wait_all_with(jobs, cancel, Child::try_wait, on_cancel)
}

/// A failed poll aborts the batch the same way a cancellation does, then
/// surfaces the error.
fn wait_all_with<P, F>(
    jobs: Vec<RunningJob>,
    cancel: &CancelToken,
    mut poll: P,
    mut on_cancel: F,
) -> Result<BatchStatus, SraError>
where
    P: FnMut(&mut Child) -> io::Result<Option<ExitStatus>>,
    F: FnMut(&[String]),
{
    let mut statuses = Vec::with_capacity(jobs.len());
    let mut pending = jobs;
    let mut cancelled = false;

    while !pending.is_empty() {
        let mut still_running = Vec::with_capacity(pending.len());
        let mut poll_error = None;
        for mut job in pending {
            if poll_error.is_some() {
                still_running.push(job);
                continue;
            }
            match poll(&mut job.child) {
                Ok(Some(status)) if status.success() => {
                    info!(chunk = job.index, "chunk job finished");
                    statuses.push(JobStatus {
                        index: job.index,
                        outcome: JobOutcome::Succeeded,
                    });
                }
                Ok(Some(status)) => {
                    warn!(chunk = job.index, code = ?status.code(), "chunk job failed");
                    statuses.push(JobStatus {
                        index: job.index,
                        outcome: JobOutcome::Failed(status.code()),
                    });
                }
                Ok(None) => still_running.push(job),
                Err(err) => {
                    poll_error = Some(SraError::Submit(format!("{}: {err}", job.name)));
                    still_running.push(job);
                }
            }
        }
        pending = still_running;

        if let Some(err) = poll_error {
            warn!(
                finished = statuses.len(),
                stopped = pending.len(),
                error = %err,
                "lost track of chunk jobs, stopping the rest"
            );
            abort_pending(&mut pending, &mut on_cancel);
            return Err(err);
        }
        if !pending.is_empty() && cancel.is_cancelled() {
            cancelled = true;
            abort_pending(&mut pending, &mut on_cancel);
            statuses.extend(pending.drain(..).map(|job| JobStatus {
                index: job.index,
                outcome: JobOutcome::Cancelled,
            }));
            break;
        }
        if !pending.is_empty() {
            thread::sleep(POLL_INTERVAL);
        }
    }

    statuses.sort_by_key(|status| status.index);
    Ok(BatchStatus {
        jobs: statuses,
        cancelled: cancelled || cancel.is_cancelled(),
    })
}

fn abort_pending<F>(pending: &mut [RunningJob], on_cancel: &mut F)
where
    F: FnMut(&[String]),
{
    let names = pending
        .iter()
        .map(|job| job.name.clone())
        .collect::<Vec<_>>();
    stop_all(pending);
    on_cancel(&names);
}
