use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use kira_srautils::app::{DumpState, Dumper, ProgressEvent, ProgressSink};
use kira_srautils::backend::{BatchStatus, JobBackend, JobOutcome, JobStatus, SubmitContext};
use kira_srautils::cancel::CancelToken;
use kira_srautils::config::{DumpRequest, RunConfig};
use kira_srautils::error::SraError;
use kira_srautils::jobs::JobBatch;
use kira_srautils::toolkit::{SraToolkit, ToolPaths};

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn phases(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter_map(|message| message.split(';').next())
            .map(|phase| phase.trim_start_matches("phase=").to_string())
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.messages.lock().unwrap().push(event.message);
    }
}

struct MockToolkit {
    spots: u64,
    preflight_ok: bool,
}

impl SraToolkit for MockToolkit {
    fn preflight(&self) -> Result<ToolPaths, SraError> {
        if !self.preflight_ok {
            return Err(SraError::Preflight("sratoolkit not found in $PATH".to_string()));
        }
        Ok(ToolPaths {
            stat: PathBuf::from("sra-stat"),
            dump: PathBuf::from("fastq-dump"),
        })
    }

    fn count_spots(&self, _archive: &Utf8Path) -> Result<u64, SraError> {
        Ok(self.spots)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OnWait {
    Finish,
    /// Jobs are stopped by a signal while running.
    Cancelled,
    /// Every job finishes, then a signal arrives before the merge.
    SignalAfterJobs,
}

/// Writes one artifact per chunk on submit and fails the configured chunks.
struct MockBackend {
    failing: Vec<usize>,
    on_wait: OnWait,
    submitted: Mutex<usize>,
}

impl MockBackend {
    fn new(failing: Vec<usize>) -> Self {
        Self {
            failing,
            on_wait: OnWait::Finish,
            submitted: Mutex::new(0),
        }
    }

    fn waiting(on_wait: OnWait) -> Self {
        Self {
            on_wait,
            ..Self::new(Vec::new())
        }
    }
}

impl JobBackend for MockBackend {
    type Handle = JobBatch;

    fn submit(&self, batch: &JobBatch, ctx: &SubmitContext) -> Result<JobBatch, SraError> {
        assert!(ctx.logs_dir.as_std_path().is_dir());
        assert!(batch.script.as_std_path().is_file());
        *self.submitted.lock().unwrap() += batch.jobs.len();
        for job in &batch.jobs {
            let name = job.output_dir.join("SRR1_1.fastq.gz");
            fs::write(name, format!("{}\n", job.range)).unwrap();
        }
        Ok(batch.clone())
    }

    fn await_completion(
        &self,
        handle: JobBatch,
        cancel: &CancelToken,
    ) -> Result<BatchStatus, SraError> {
        if self.on_wait != OnWait::Finish {
            cancel.cancel();
        }
        let cancelled = self.on_wait == OnWait::Cancelled;
        Ok(BatchStatus {
            jobs: handle
                .jobs
                .iter()
                .map(|job| JobStatus {
                    index: job.index,
                    outcome: if cancelled {
                        JobOutcome::Cancelled
                    } else if self.failing.contains(&job.index) {
                        JobOutcome::Failed(Some(1))
                    } else {
                        JobOutcome::Succeeded
                    },
                })
                .collect(),
            cancelled,
        })
    }
}

fn setup(chunks: u64) -> (tempfile::TempDir, RunConfig) {
    let temp = tempfile::tempdir().unwrap();
    let archive = temp.path().join("SRR1.sra");
    fs::write(&archive, b"sra").unwrap();
    let config = RunConfig::resolve(DumpRequest {
        input: archive,
        outdir: Some(temp.path().join("out")),
        chunks,
        local: true,
        ..DumpRequest::default()
    })
    .unwrap();
    (temp, config)
}

fn working_areas(outdir: &Utf8Path) -> Vec<Utf8PathBuf> {
    fs::read_dir(outdir.as_std_path())
        .unwrap()
        .flatten()
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("srautils_"))
        .map(|entry| Utf8PathBuf::from_path_buf(entry.path()).unwrap())
        .collect()
}

#[test]
fn successful_dump_merges_and_cleans_up() {
    let (_temp, config) = setup(3);
    let sink = RecordingSink::default();
    let dumper = Dumper::new(
        MockToolkit {
            spots: 100,
            preflight_ok: true,
        },
        MockBackend::new(Vec::new()),
        CancelToken::new(),
    );

    let report = dumper.run(&config, &sink).unwrap();

    let merged = config.outdir.join("SRR1_1.fastq.gz");
    assert_eq!(report.files, vec![merged.to_string()]);
    assert_eq!(report.total_spots, 100);
    assert_eq!(
        fs::read_to_string(&merged).unwrap(),
        "1-33\n34-66\n67-100\n"
    );
    assert!(working_areas(&config.outdir).is_empty());
    assert_eq!(
        sink.phases(),
        vec![
            DumpState::Validating.to_string(),
            DumpState::Partitioning.to_string(),
            DumpState::Compiling.to_string(),
            DumpState::Submitted.to_string(),
            DumpState::Merged.to_string(),
        ]
    );
}

#[test]
fn failed_chunk_skips_merge_and_keeps_working_area() {
    let (_temp, config) = setup(3);
    let dumper = Dumper::new(
        MockToolkit {
            spots: 100,
            preflight_ok: true,
        },
        MockBackend::new(vec![1]),
        CancelToken::new(),
    );

    let err = dumper.run(&config, &RecordingSink::default()).unwrap_err();
    let working_dir = match err {
        SraError::BackendFailure {
            failed,
            working_dir,
        } => {
            assert_eq!(failed, vec![1]);
            working_dir
        }
        other => panic!("unexpected error: {other:?}"),
    };

    assert!(!config.outdir.join("SRR1_1.fastq.gz").as_std_path().exists());
    for index in 0..3 {
        let chunk = working_dir.join("chunks").join(index.to_string());
        assert!(chunk.join("SRR1_1.fastq.gz").as_std_path().is_file());
    }
    assert!(working_dir.join("sra_dumps.sh").as_std_path().is_file());
}

#[test]
fn preflight_failure_runs_nothing() {
    let (_temp, config) = setup(3);
    let backend = MockBackend::new(Vec::new());
    let dumper = Dumper::new(
        MockToolkit {
            spots: 100,
            preflight_ok: false,
        },
        backend,
        CancelToken::new(),
    );

    let err = dumper.run(&config, &RecordingSink::default()).unwrap_err();
    assert_matches!(err, SraError::Preflight(_));
    assert!(!config.outdir.as_std_path().exists());
}

#[test]
fn missing_archive_is_a_preflight_error() {
    let (_temp, mut config) = setup(3);
    config.archive = config.archive.with_file_name("missing.sra");
    let dumper = Dumper::new(
        MockToolkit {
            spots: 100,
            preflight_ok: true,
        },
        MockBackend::new(Vec::new()),
        CancelToken::new(),
    );

    let err = dumper.run(&config, &RecordingSink::default()).unwrap_err();
    assert_matches!(err, SraError::Preflight(_));
}

#[test]
fn too_many_chunks_is_rejected_before_submission() {
    let (_temp, config) = setup(5);
    let dumper = Dumper::new(
        MockToolkit {
            spots: 4,
            preflight_ok: true,
        },
        MockBackend::new(Vec::new()),
        CancelToken::new(),
    );

    let err = dumper.run(&config, &RecordingSink::default()).unwrap_err();
    assert_matches!(err, SraError::InvalidPartition { total: 4, chunks: 5 });
    assert!(!config.outdir.as_std_path().exists());
}

#[test]
fn cancelled_before_submission_is_interrupted() {
    let (_temp, config) = setup(2);
    let cancel = CancelToken::new();
    cancel.cancel();
    let backend = MockBackend::new(Vec::new());
    let dumper = Dumper::new(
        MockToolkit {
            spots: 10,
            preflight_ok: true,
        },
        backend,
        cancel,
    );

    let err = dumper.run(&config, &RecordingSink::default()).unwrap_err();
    assert_matches!(err, SraError::Interrupted(_));
}

fn assert_interrupted_without_merge(on_wait: OnWait) {
    let (_temp, config) = setup(3);
    let sink = RecordingSink::default();
    let dumper = Dumper::new(
        MockToolkit {
            spots: 30,
            preflight_ok: true,
        },
        MockBackend::waiting(on_wait),
        CancelToken::new(),
    );

    let err = dumper.run(&config, &sink).unwrap_err();
    let working_dir = match err {
        SraError::Interrupted(working_dir) => working_dir,
        other => panic!("unexpected error: {other:?}"),
    };

    assert!(!config.outdir.join("SRR1_1.fastq.gz").as_std_path().exists());
    assert_eq!(working_areas(&config.outdir), vec![working_dir.clone()]);
    assert!(
        working_dir
            .join("chunks")
            .join("0")
            .join("SRR1_1.fastq.gz")
            .as_std_path()
            .is_file()
    );
    let phases = sink.phases();
    assert!(!phases.contains(&DumpState::Merged.to_string()));
    assert_eq!(phases.last(), Some(&DumpState::Failed.to_string()));
}

#[test]
fn cancelled_while_submitted_keeps_working_area() {
    assert_interrupted_without_merge(OnWait::Cancelled);
}

#[test]
fn signal_after_jobs_finish_skips_merge() {
    assert_interrupted_without_merge(OnWait::SignalAfterJobs);
}

#[test]
fn job_script_is_deterministic() {
    let (_temp, config) = setup(4);
    let area = kira_srautils::workspace::WorkingArea::create_in(&config.outdir).unwrap();
    let ranges = kira_srautils::partition::partition(10, 4).unwrap();
    let dump = PathBuf::from("/opt/sra/bin/fastq-dump");

    let first = kira_srautils::jobs::compile(
        &area,
        "sra_dump_1",
        &dump,
        &config.archive,
        &ranges,
        config.filter,
    )
    .unwrap();
    let first_script = fs::read_to_string(&first.script).unwrap();
    let second = kira_srautils::jobs::compile(
        &area,
        "sra_dump_1",
        &dump,
        &config.archive,
        &ranges,
        config.filter,
    )
    .unwrap();

    assert_eq!(first.jobs, second.jobs);
    assert_eq!(first_script, fs::read_to_string(&second.script).unwrap());
    assert_eq!(first_script.lines().count(), 4);
    assert!(first_script.lines().last().unwrap().contains("-N 7 -X 10 --gzip"));
    for job in &first.jobs {
        assert!(job.output_dir.as_std_path().is_dir());
    }
    area.release().unwrap();
}

#[cfg(unix)]
#[test]
fn local_backend_end_to_end() {
    use std::os::unix::fs::PermissionsExt;

    use kira_srautils::backend::Backend;
    use kira_srautils::domain::ExecutionMode;

    struct ScriptToolkit {
        dump: PathBuf,
    }

    impl SraToolkit for ScriptToolkit {
        fn preflight(&self) -> Result<ToolPaths, SraError> {
            Ok(ToolPaths {
                stat: PathBuf::from("sra-stat"),
                dump: self.dump.clone(),
            })
        }

        fn count_spots(&self, _archive: &Utf8Path) -> Result<u64, SraError> {
            Ok(10)
        }
    }

    let temp = tempfile::tempdir().unwrap();
    let fake_dump = temp.path().join("fastq-dump");
    fs::write(
        &fake_dump,
        "#!/bin/sh\n# --split-files -O dir -N start -X end archive\necho \"@$5-$7\" > \"$3/SRR1_1.fastq\"\necho \"ignored\" > \"$3/SRR1_1.fastq.gz\"\n",
    )
    .unwrap();
    fs::set_permissions(&fake_dump, fs::Permissions::from_mode(0o755)).unwrap();
    let archive = temp.path().join("SRR1.sra");
    fs::write(&archive, b"sra").unwrap();

    let config = RunConfig::resolve(DumpRequest {
        input: archive,
        outdir: Some(temp.path().join("out")),
        chunks: 3,
        local: true,
        no_gzip: true,
        ..DumpRequest::default()
    })
    .unwrap();
    assert_eq!(config.mode, ExecutionMode::Local);

    let dumper = Dumper::new(
        ScriptToolkit { dump: fake_dump },
        Backend::for_mode(config.mode),
        CancelToken::new(),
    );
    let report = dumper.run(&config, &RecordingSink::default()).unwrap();

    assert_eq!(report.files.len(), 1);
    assert_eq!(
        fs::read_to_string(config.outdir.join("SRR1_1.fastq")).unwrap(),
        "@1-3\n@4-6\n@7-10\n"
    );
    assert!(!config.outdir.join("SRR1_1.fastq.gz").as_std_path().exists());
    assert!(working_areas(&config.outdir).is_empty());
}
