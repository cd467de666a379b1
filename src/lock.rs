use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use log::debug;

use crate::error::{Result, StoreError};

/// RAII advisory lock over a `.lock` file inside a store directory.
///
/// Acquired on open, released on `Drop` (including on exceptional exit paths,
/// since the guard is simply dropped along with everything else owning it).
/// A second `DirLock::acquire` on the same directory fails with
/// `LockObtainFailed` rather than blocking.
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    pub fn acquire(directory: &Path) -> Result<Self> {
        let path = directory.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|_| {
            StoreError::LockObtainFailed(directory.display().to_string())
        })?;
        debug!("acquired directory lock at {}", path.display());
        Ok(DirLock { file, path })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!("failed to unlock {}: {}", self.path.display(), e);
        }
    }
}
