use std::collections::BTreeSet;
use std::fs;
use std::io::{self, BufWriter, Write};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::domain::OutputFilter;
use crate::error::SraError;

/// Concatenates like-named chunk outputs into `outdir`, in the order the
/// chunk directories are given, keeping only artifacts `filter` accepts.
///
/// The artifact set is the union of file names over all chunk directories;
/// a chunk that lacks a given file simply contributes nothing to it.
pub fn merge(
    chunk_dirs: &[Utf8PathBuf],
    outdir: &Utf8Path,
    filter: OutputFilter,
) -> Result<Vec<Utf8PathBuf>, SraError> {
    merge_cancellable(chunk_dirs, outdir, filter, &CancelToken::new())
}

/// Same as [`merge`], but stops before the next artifact once `cancel` trips
/// and returns `Interrupted(outdir)`. Artifacts already written stay in place.
pub fn merge_cancellable(
    chunk_dirs: &[Utf8PathBuf],
    outdir: &Utf8Path,
    filter: OutputFilter,
    cancel: &CancelToken,
) -> Result<Vec<Utf8PathBuf>, SraError> {
    if chunk_dirs.is_empty() {
        return Ok(Vec::new());
    }
    info!(chunks = chunk_dirs.len(), "merge sra dumps file");
    fs::create_dir_all(outdir.as_std_path())
        .map_err(|err| SraError::Filesystem(format!("create {outdir}: {err}")))?;

    let mut produced = Vec::new();
    for name in artifact_names(chunk_dirs)? {
        if !filter.accepts(&name) {
            debug!(artifact = %name, "skipped by output filter");
            continue;
        }
        if cancel.is_cancelled() {
            warn!(merged = produced.len(), "merge interrupted");
            return Err(SraError::Interrupted(outdir.to_path_buf()));
        }
        let target = outdir.join(&name);
        concat_into(chunk_dirs, &name, &target)?;
        produced.push(target);
    }
    Ok(produced)
}

fn artifact_names(chunk_dirs: &[Utf8PathBuf]) -> Result<BTreeSet<String>, SraError> {
    let mut names = BTreeSet::new();
    for dir in chunk_dirs {
        let entries = match fs::read_dir(dir.as_std_path()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(%dir, "chunk directory missing");
                continue;
            }
            Err(err) => return Err(SraError::Filesystem(format!("read {dir}: {err}"))),
        };
        for entry in entries {
            let entry = entry.map_err(|err| SraError::Filesystem(err.to_string()))?;
            let is_file = entry
                .file_type()
                .map_err(|err| SraError::Filesystem(err.to_string()))?
                .is_file();
            if !is_file {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => {
                    names.insert(name);
                }
                Err(name) => warn!(?name, "skipping non UTF-8 artifact"),
            }
        }
    }
    Ok(names)
}

fn concat_into(chunk_dirs: &[Utf8PathBuf], name: &str, target: &Utf8Path) -> Result<(), SraError> {
    let file = fs::File::create(target.as_std_path())
        .map_err(|err| SraError::Filesystem(format!("create {target}: {err}")))?;
    let mut writer = BufWriter::new(file);
    for dir in chunk_dirs {
        let part = dir.join(name);
        if !part.as_std_path().is_file() {
            continue;
        }
        let mut reader = fs::File::open(part.as_std_path())
            .map_err(|err| SraError::Filesystem(format!("open {part}: {err}")))?;
        io::copy(&mut reader, &mut writer)
            .map_err(|err| SraError::Filesystem(format!("copy {part}: {err}")))?;
    }
    writer
        .flush()
        .map_err(|err| SraError::Filesystem(format!("write {target}: {err}")))?;
    Ok(())
}
