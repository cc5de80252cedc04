use std::fmt;
use std::fs;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{info, warn};

use crate::backend::{JobBackend, SubmitContext};
use crate::cancel::CancelToken;
use crate::config::{FetchConfig, RunConfig};
use crate::domain::{Accession, ExecutionMode, SpotRange};
use crate::error::SraError;
use crate::fetch::{DownloadPlan, ObjectStore, finalize_download, object_uri, part_path};
use crate::jobs::{self, JobBatch};
use crate::merge;
use crate::partition::partition;
use crate::toolkit::{SraToolkit, ToolPaths};
use crate::workspace::WorkingArea;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DumpState {
    Validating,
    Partitioning,
    Compiling,
    Submitted,
    Merged,
    Failed,
}

impl fmt::Display for DumpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DumpReport {
    pub job_name: String,
    pub mode: ExecutionMode,
    pub archive: String,
    pub total_spots: u64,
    pub ranges: Vec<SpotRange>,
    pub files: Vec<String>,
    pub finished_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub accession: Accession,
    pub url: String,
    pub path: String,
    pub bytes: u64,
    pub finished_at: String,
}

/// Drives one chunked dump: validate, partition, compile, submit, merge.
pub struct Dumper<T: SraToolkit, B: JobBackend> {
    toolkit: T,
    backend: B,
    cancel: CancelToken,
}

impl<T: SraToolkit, B: JobBackend> Dumper<T, B> {
    pub fn new(toolkit: T, backend: B, cancel: CancelToken) -> Self {
        Self {
            toolkit,
            backend,
            cancel,
        }
    }

    pub fn run(&self, config: &RunConfig, sink: &dyn ProgressSink) -> Result<DumpReport, SraError> {
        let started = Instant::now();
        let result = self.run_states(config, sink, started);
        if let Err(err) = &result {
            self.enter(DumpState::Failed, &err.to_string(), sink, started);
        }
        result
    }

    fn run_states(
        &self,
        config: &RunConfig,
        sink: &dyn ProgressSink,
        started: Instant,
    ) -> Result<DumpReport, SraError> {
        self.enter(DumpState::Validating, config.archive.as_str(), sink, started);
        let tools = self.toolkit.preflight()?;
        if !config.archive.as_std_path().is_file() {
            return Err(SraError::Preflight(format!(
                "no such sra file: {}",
                config.archive
            )));
        }

        self.enter(DumpState::Partitioning, "counting spots", sink, started);
        let total_spots = self.toolkit.count_spots(&config.archive)?;
        let ranges = partition(total_spots, config.chunks)?;
        info!(total_spots, chunks = ranges.len(), "spot ranges ready");
        self.check_cancelled(config.outdir.clone())?;

        self.enter(DumpState::Compiling, &config.job_name, sink, started);
        let area = WorkingArea::create_in(&config.outdir)?;
        match self.dump_in(&area, config, &tools, &ranges, sink, started) {
            Ok(_) if self.cancel.is_cancelled() => {
                let root = area.retain();
                Err(SraError::Interrupted(root))
            }
            Ok(files) => {
                area.release()?;
                Ok(DumpReport {
                    job_name: config.job_name.clone(),
                    mode: config.mode,
                    archive: config.archive.to_string(),
                    total_spots,
                    ranges,
                    files: files.into_iter().map(|path| path.to_string()).collect(),
                    finished_at: chrono::Utc::now().to_rfc3339(),
                })
            }
            Err(err) => {
                area.retain();
                Err(err)
            }
        }
    }

    fn dump_in(
        &self,
        area: &WorkingArea,
        config: &RunConfig,
        tools: &ToolPaths,
        ranges: &[SpotRange],
        sink: &dyn ProgressSink,
        started: Instant,
    ) -> Result<Vec<Utf8PathBuf>, SraError> {
        let batch: JobBatch = jobs::compile(
            area,
            &config.job_name,
            &tools.dump,
            &config.archive,
            ranges,
            config.filter,
        )?;
        self.check_cancelled(area.root().to_path_buf())?;

        let logs_dir = area.ensure_logs_dir()?;
        let ctx = SubmitContext::from_config(config, logs_dir);
        self.enter(
            DumpState::Submitted,
            &format!("{} jobs, mode={}", batch.jobs.len(), config.mode),
            sink,
            started,
        );
        let handle = self.backend.submit(&batch, &ctx)?;
        let status = self.backend.await_completion(handle, &self.cancel)?;
        if status.cancelled {
            return Err(SraError::Interrupted(area.root().to_path_buf()));
        }
        if !status.succeeded() {
            return Err(SraError::BackendFailure {
                failed: status.failed_indices(),
                working_dir: area.root().to_path_buf(),
            });
        }

        self.check_cancelled(area.root().to_path_buf())?;

        let files = merge::merge_cancellable(
            &batch.output_dirs(),
            &config.outdir,
            config.filter,
            &self.cancel,
        )
        .map_err(|err| match err {
            SraError::Interrupted(_) => SraError::Interrupted(area.root().to_path_buf()),
            other => other,
        })?;
        self.enter(
            DumpState::Merged,
            &format!("{} files", files.len()),
            sink,
            started,
        );
        info!(
            files = %files.iter().map(|path| path.as_str()).collect::<Vec<_>>().join(", "),
            "sra dumps finished"
        );
        Ok(files)
    }

    fn check_cancelled(&self, working_dir: Utf8PathBuf) -> Result<(), SraError> {
        if self.cancel.is_cancelled() {
            return Err(SraError::Interrupted(working_dir));
        }
        Ok(())
    }

    fn enter(&self, state: DumpState, detail: &str, sink: &dyn ProgressSink, started: Instant) {
        if state == DumpState::Failed {
            warn!(%state, detail, "dump state");
        } else {
            info!(%state, detail, "dump state");
        }
        sink.event(ProgressEvent {
            message: format!("phase={state}; {detail}"),
            elapsed: Some(started.elapsed()),
        });
    }
}

/// Checks the accession upstream and downloads `<ID>.sra`.
pub struct Fetcher<S: ObjectStore> {
    store: S,
}

impl<S: ObjectStore> Fetcher<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn run(&self, config: &FetchConfig, sink: &dyn ProgressSink) -> Result<FetchReport, SraError> {
        let started = Instant::now();
        let accession = &config.accession;
        let url = object_uri(accession);
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; {url}"),
            elapsed: None,
        });
        let object = self.store.head(accession)?;

        fs::create_dir_all(config.outdir.as_std_path())
            .map_err(|err| SraError::Filesystem(format!("create {}: {err}", config.outdir)))?;
        let destination = config.outdir.join(accession.archive_file_name());
        let part = part_path(destination.as_std_path());
        let plan = DownloadPlan {
            concurrency: config.concurrency,
            max_speed: config.max_speed,
        };
        sink.event(ProgressEvent {
            message: format!("phase=Download; {} bytes", object.size.unwrap_or_default()),
            elapsed: Some(started.elapsed()),
        });
        let bytes = match self.store.download(accession, &object, &part, &plan) {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = fs::remove_file(&part);
                return Err(err);
            }
        };
        finalize_download(&part, destination.as_std_path())?;
        info!(%destination, bytes, "fetched");
        sink.event(ProgressEvent {
            message: format!("phase=Store; {destination}"),
            elapsed: Some(started.elapsed()),
        });

        Ok(FetchReport {
            accession: accession.clone(),
            url,
            path: destination.to_string(),
            bytes,
            finished_at: chrono::Utc::now().to_rfc3339(),
        })
    }
}
