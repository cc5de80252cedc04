use std::path::{Path, PathBuf};
use std::process::Command;

use camino::Utf8Path;
use serde::Serialize;
use tracing::debug;

use crate::error::SraError;

pub const STAT_TOOL: &str = "sra-stat";
pub const DUMP_TOOL: &str = "fastq-dump";

/// Resolved locations of the sratoolkit binaries a dump needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolPaths {
    pub stat: PathBuf,
    pub dump: PathBuf,
}

/// External sratoolkit binaries: preflight and spot-count probe.
pub trait SraToolkit: Send + Sync {
    fn preflight(&self) -> Result<ToolPaths, SraError>;
    fn count_spots(&self, archive: &Utf8Path) -> Result<u64, SraError>;
}

#[derive(Debug, Clone)]
pub struct SystemToolkit {
    stat: Option<PathBuf>,
    dump: Option<PathBuf>,
}

impl SystemToolkit {
    pub fn new() -> Self {
        Self {
            stat: find_executable(STAT_TOOL),
            dump: find_executable(DUMP_TOOL),
        }
    }

    fn require_stat(&self) -> Result<&PathBuf, SraError> {
        self.stat
            .as_ref()
            .ok_or_else(|| SraError::Preflight(format!("{STAT_TOOL} not found in $PATH")))
    }
}

impl Default for SystemToolkit {
    fn default() -> Self {
        Self::new()
    }
}

impl SraToolkit for SystemToolkit {
    fn preflight(&self) -> Result<ToolPaths, SraError> {
        let stat = self.require_stat()?.clone();
        let dump = self
            .dump
            .clone()
            .ok_or_else(|| SraError::Preflight(format!("{DUMP_TOOL} not found in $PATH")))?;
        for path in [&stat, &dump] {
            match tool_version(path, &["--version"]) {
                Some(version) => debug!(tool = %path.display(), %version, "tool ready"),
                None => {
                    let vdb_config = path
                        .parent()
                        .map(|dir| dir.join("vdb-config"))
                        .unwrap_or_else(|| PathBuf::from("vdb-config"));
                    return Err(SraError::Preflight(format!(
                        "sratoolkit installation has not been configured, please run '{} --interactive'",
                        vdb_config.display()
                    )));
                }
            }
        }
        Ok(ToolPaths { stat, dump })
    }

    fn count_spots(&self, archive: &Utf8Path) -> Result<u64, SraError> {
        let stat = self
            .stat
            .as_ref()
            .ok_or_else(|| SraError::Probe(format!("{STAT_TOOL} not found in $PATH")))?;
        let output = Command::new(stat)
            .args(["--meta", "--quick", archive.as_str()])
            .output()
            .map_err(|err| SraError::Probe(format!("{}: {err}", stat.display())))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("command failed: {}", stat.display())
            } else {
                stderr
            };
            return Err(SraError::Probe(message));
        }
        parse_spot_count(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Sums the spot column of `sra-stat --meta --quick` output.
///
/// Each non-empty line looks like `ACC|member|spots:bases:...|...`; a run
/// with several members reports one line per member.
pub fn parse_spot_count(output: &str) -> Result<u64, SraError> {
    let mut total = 0u64;
    let mut seen = false;
    for line in output.lines().filter(|line| !line.trim().is_empty()) {
        let field = line
            .split('|')
            .nth(2)
            .ok_or_else(|| SraError::Probe(format!("unexpected sra-stat line: {line}")))?;
        let spots = field
            .split(':')
            .next()
            .unwrap_or_default()
            .trim()
            .parse::<u64>()
            .map_err(|_| SraError::Probe(format!("unexpected sra-stat line: {line}")))?;
        total += spots;
        seen = true;
    }
    if !seen {
        return Err(SraError::Probe("sra-stat produced no output".to_string()));
    }
    Ok(total)
}

/// Looks next to the running binary first, then along `$PATH`.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    let adjacent = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    let path_dirs = std::env::var_os("PATH")
        .map(|value| std::env::split_paths(&value).collect::<Vec<_>>())
        .unwrap_or_default();
    adjacent
        .into_iter()
        .chain(path_dirs)
        .find_map(|dir| executable_in(&dir, name))
}

fn executable_in(dir: &Path, name: &str) -> Option<PathBuf> {
    let exe = dir.join(format!("{name}.exe"));
    if is_executable(&exe) {
        return Some(exe);
    }
    let plain = dir.join(name);
    is_executable(&plain).then_some(plain)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

pub fn tool_version(path: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new(path).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.is_empty() {
        None
    } else {
        Some(stdout)
    }
}
