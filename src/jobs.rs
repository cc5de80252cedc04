use std::fs;
use std::io::Write;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::domain::{OutputFilter, SpotRange};
use crate::error::SraError;
use crate::workspace::WorkingArea;

/// One `fastq-dump` invocation over a single spot range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkJob {
    pub index: usize,
    pub range: SpotRange,
    pub output_dir: Utf8PathBuf,
    pub command: Vec<String>,
}

impl ChunkJob {
    pub fn command_line(&self) -> String {
        shell_join(&self.command)
    }
}

/// All chunk jobs of one dump, in chunk order, plus the script they were
/// serialized to.
///
/// Backends run each job's `command` directly; `script` is written for
/// inspection and manual reruns only.
#[derive(Debug, Clone)]
pub struct JobBatch {
    pub job_name: String,
    pub jobs: Vec<ChunkJob>,
    pub script: Utf8PathBuf,
}

impl JobBatch {
    pub fn output_dirs(&self) -> Vec<Utf8PathBuf> {
        self.jobs.iter().map(|job| job.output_dir.clone()).collect()
    }
}

pub fn dump_command(
    dump_tool: &Path,
    archive: &Utf8Path,
    range: SpotRange,
    output_dir: &Utf8Path,
    filter: OutputFilter,
) -> Vec<String> {
    let mut command = vec![
        dump_tool.to_string_lossy().to_string(),
        "--split-files".to_string(),
        "-O".to_string(),
        output_dir.to_string(),
        "-N".to_string(),
        range.start.to_string(),
        "-X".to_string(),
        range.end.to_string(),
    ];
    if filter.compressed {
        command.push("--gzip".to_string());
    }
    if filter.fasta_only {
        command.push("--fasta".to_string());
    }
    command.push(archive.to_string());
    command
}

/// Creates `chunks/<index>/` for every range and writes the job script, one
/// command line per chunk.
pub fn compile(
    area: &WorkingArea,
    job_name: &str,
    dump_tool: &Path,
    archive: &Utf8Path,
    ranges: &[SpotRange],
    filter: OutputFilter,
) -> Result<JobBatch, SraError> {
    let mut jobs = Vec::with_capacity(ranges.len());
    for (index, range) in ranges.iter().copied().enumerate() {
        let output_dir = area.chunk_dir(index);
        fs::create_dir_all(output_dir.as_std_path())
            .map_err(|err| SraError::Filesystem(format!("create {output_dir}: {err}")))?;
        let command = dump_command(dump_tool, archive, range, &output_dir, filter);
        jobs.push(ChunkJob {
            index,
            range,
            output_dir,
            command,
        });
    }

    let script = area.script_path();
    let mut file = fs::File::create(script.as_std_path())
        .map_err(|err| SraError::Filesystem(format!("create {script}: {err}")))?;
    for job in &jobs {
        writeln!(file, "{}", job.command_line())
            .map_err(|err| SraError::Filesystem(format!("write {script}: {err}")))?;
    }
    debug!(%script, jobs = jobs.len(), "job script written");

    Ok(JobBatch {
        job_name: job_name.to_string(),
        jobs,
        script,
    })
}

pub fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_quote(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let safe = arg
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || "@%+=:,./_-".contains(ch));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r#"'"'"'"#))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_only_when_needed() {
        assert_eq!(shell_quote("/opt/sra/bin/fastq-dump"), "/opt/sra/bin/fastq-dump");
        assert_eq!(shell_quote("my runs/a.sra"), "'my runs/a.sra'");
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn command_flags_follow_filter() {
        let range = SpotRange { start: 34, end: 66 };
        let command = dump_command(
            Path::new("fastq-dump"),
            Utf8Path::new("/data/SRR1.sra"),
            range,
            Utf8Path::new("/out/chunks/1"),
            OutputFilter::default(),
        );
        assert_eq!(
            shell_join(&command),
            "fastq-dump --split-files -O /out/chunks/1 -N 34 -X 66 --gzip /data/SRR1.sra"
        );

        let command = dump_command(
            Path::new("fastq-dump"),
            Utf8Path::new("/data/SRR1.sra"),
            range,
            Utf8Path::new("/out/chunks/1"),
            OutputFilter {
                compressed: false,
                fasta_only: true,
            },
        );
        assert_eq!(
            shell_join(&command),
            "fastq-dump --split-files -O /out/chunks/1 -N 34 -X 66 --fasta /data/SRR1.sra"
        );
    }
}
