use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SraError {
    #[error("preflight check failed: {0}")]
    #[diagnostic(help("install sratoolkit and make sure sra-stat and fastq-dump are on $PATH"))]
    Preflight(String),

    #[error("invalid partition: {total} spots cannot be split into {chunks} chunks")]
    InvalidPartition { total: u64, chunks: u64 },

    #[error("failed to determine spot count: {0}")]
    Probe(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("{} chunk job(s) failed: {failed:?}; working area kept at {working_dir}", .failed.len())]
    BackendFailure {
        failed: Vec<usize>,
        working_dir: Utf8PathBuf,
    },

    #[error("dump interrupted; working area kept at {0}")]
    Interrupted(Utf8PathBuf),

    #[error("not a sra id: {0}")]
    InvalidAccession(String),

    #[error("no such sra id: {0}")]
    RemoteNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("object store request failed: {0}")]
    Http(String),

    #[error("object store returned status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("job submission failed: {0}")]
    Submit(String),
}
