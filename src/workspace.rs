use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;
use tracing::{debug, warn};

use crate::error::SraError;

pub const SCRIPT_NAME: &str = "sra_dumps.sh";

/// Transient directory tree for one dump: `chunks/<index>/`, `logs/` and the
/// job script. Nothing removes it implicitly; the owner calls
/// [`WorkingArea::release`] on success or [`WorkingArea::retain`] on failure.
#[derive(Debug)]
pub struct WorkingArea {
    root: Utf8PathBuf,
}

impl WorkingArea {
    pub fn create_in(parent: &Utf8Path) -> Result<Self, SraError> {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| SraError::Filesystem(format!("create {parent}: {err}")))?;
        let temp = Builder::new()
            .prefix("srautils_")
            .tempdir_in(parent.as_std_path())
            .map_err(|err| SraError::Filesystem(err.to_string()))?;
        let root = Utf8PathBuf::from_path_buf(temp.keep())
            .map_err(|_| SraError::Filesystem("invalid working area path".to_string()))?;
        debug!(%root, "working area created");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn chunks_dir(&self) -> Utf8PathBuf {
        self.root.join("chunks")
    }

    pub fn chunk_dir(&self, index: usize) -> Utf8PathBuf {
        self.chunks_dir().join(index.to_string())
    }

    pub fn logs_dir(&self) -> Utf8PathBuf {
        self.root.join("logs")
    }

    pub fn script_path(&self) -> Utf8PathBuf {
        self.root.join(SCRIPT_NAME)
    }

    pub fn ensure_logs_dir(&self) -> Result<Utf8PathBuf, SraError> {
        let logs = self.logs_dir();
        fs::create_dir_all(logs.as_std_path())
            .map_err(|err| SraError::Filesystem(format!("create {logs}: {err}")))?;
        Ok(logs)
    }

    /// Deletes the whole tree.
    pub fn release(self) -> Result<(), SraError> {
        remove_tree(&self.root)
    }

    /// Leaves the tree on disk for inspection and hands back its path.
    pub fn retain(self) -> Utf8PathBuf {
        warn!(root = %self.root, "keeping working area");
        self.root
    }
}

/// Removes `path` recursively; a path that is already gone is not an error.
pub fn remove_tree(path: &Utf8Path) -> Result<(), SraError> {
    match fs::remove_dir_all(path.as_std_path()) {
        Ok(()) => {
            debug!(%path, "working area removed");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SraError::Filesystem(format!("remove {path}: {err}"))),
    }
}
