//! Cross-process advisory locks around driver and artifact builds.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Error, Result};

/// Exclusive lock on a lock file, released on drop.
pub(crate) struct BuildLock {
    file: File,
    path: PathBuf,
}

impl BuildLock {
    /// Block until the exclusive lock on `path` is held.
    pub(crate) fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::cache_path(path, e))?;

        FileExt::lock_exclusive(&file).map_err(|e| Error::cache_path(path, e))?;
        tracing::trace!("Acquired build lock {}", path.display());

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}
