use std::path::{Path, PathBuf};

use camino::Utf8PathBuf;

use crate::domain::{Accession, ExecutionMode, MaxSpeed, OutputFilter};
use crate::error::SraError;

pub const DEFAULT_CHUNKS: u64 = 10;
pub const DEFAULT_QUEUE: &str = "all.q";
pub const DEFAULT_CONCURRENCY: usize = 100;
pub const MAX_CONCURRENCY: usize = 300;

/// Raw `dump` input as it comes off the command line.
#[derive(Debug, Clone)]
pub struct DumpRequest {
    pub input: PathBuf,
    pub outdir: Option<PathBuf>,
    pub chunks: u64,
    pub queues: Vec<String>,
    pub log_file: Option<PathBuf>,
    pub no_gzip: bool,
    pub fasta: bool,
    pub local: bool,
}

impl Default for DumpRequest {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            outdir: None,
            chunks: DEFAULT_CHUNKS,
            queues: vec![DEFAULT_QUEUE.to_string()],
            log_file: None,
            no_gzip: false,
            fasta: false,
            local: false,
        }
    }
}

/// Everything one dump run needs, fixed once before any work starts.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub archive: Utf8PathBuf,
    pub outdir: Utf8PathBuf,
    pub workdir: Utf8PathBuf,
    pub chunks: u64,
    pub mode: ExecutionMode,
    pub job_name: String,
    pub queues: Vec<String>,
    pub cpu: u32,
    pub memory_gb: u32,
    pub filter: OutputFilter,
    pub log_file: Option<Utf8PathBuf>,
}

impl RunConfig {
    pub fn resolve(request: DumpRequest) -> Result<Self, SraError> {
        if request.chunks == 0 {
            return Err(SraError::InvalidArgument(
                "chunk count must be at least 1".to_string(),
            ));
        }
        let cwd = std::env::current_dir().map_err(|err| SraError::Filesystem(err.to_string()))?;
        let queues = request
            .queues
            .into_iter()
            .flat_map(|value| {
                value
                    .split_whitespace()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        Ok(Self {
            archive: absolute_utf8(&request.input)?,
            outdir: absolute_utf8(request.outdir.as_deref().unwrap_or(cwd.as_path()))?,
            workdir: to_utf8(cwd)?,
            chunks: request.chunks,
            mode: if request.local {
                ExecutionMode::Local
            } else {
                ExecutionMode::Clustered
            },
            job_name: format!("sra_dump_{}", std::process::id()),
            queues: if queues.is_empty() {
                vec![DEFAULT_QUEUE.to_string()]
            } else {
                queues
            },
            cpu: 1,
            memory_gb: 1,
            filter: OutputFilter {
                compressed: !request.no_gzip,
                fasta_only: request.fasta,
            },
            log_file: request
                .log_file
                .as_deref()
                .map(absolute_utf8)
                .transpose()?,
        })
    }
}

/// Raw `fetch` input as it comes off the command line.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub id: String,
    pub outdir: Option<PathBuf>,
    pub concurrency: usize,
    pub max_speed: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub accession: Accession,
    pub outdir: Utf8PathBuf,
    pub concurrency: usize,
    pub max_speed: Option<MaxSpeed>,
}

impl FetchConfig {
    pub fn resolve(request: FetchRequest) -> Result<Self, SraError> {
        let accession = request.id.parse::<Accession>()?;
        let cwd = std::env::current_dir().map_err(|err| SraError::Filesystem(err.to_string()))?;
        let max_speed = request
            .max_speed
            .as_deref()
            .map(str::parse::<MaxSpeed>)
            .transpose()?;
        Ok(Self {
            accession,
            outdir: absolute_utf8(request.outdir.as_deref().unwrap_or(cwd.as_path()))?,
            concurrency: request.concurrency.clamp(1, MAX_CONCURRENCY),
            max_speed,
        })
    }
}

fn absolute_utf8(path: &Path) -> Result<Utf8PathBuf, SraError> {
    let absolute = std::path::absolute(path)
        .map_err(|err| SraError::Filesystem(format!("{}: {err}", path.display())))?;
    to_utf8(absolute)
}

fn to_utf8(path: PathBuf) -> Result<Utf8PathBuf, SraError> {
    Utf8PathBuf::from_path_buf(path)
        .map_err(|path| SraError::Filesystem(format!("non UTF-8 path: {}", path.display())))
}
