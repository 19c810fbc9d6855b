// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Preventing overlapping mirror runs. */

use {
    crate::error::{MirrorError, Result},
    fs2::FileExt,
    log::debug,
    std::{
        fs::{File, OpenOptions},
        path::{Path, PathBuf},
    },
};

/// Filename of the lock file within the run's working directory.
pub const LOCK_FILENAME: &str = "apt-mirror.lock";

/// An exclusive advisory lock held for the duration of a run.
///
/// The advisory lock is released when the guard is dropped. The lock file
/// itself is only removed by [RunLock::release()], so a run that fails leaves
/// it behind for inspection.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    file: File,
}

impl RunLock {
    /// Acquire the lock in `dir`, creating the directory if needed.
    ///
    /// Fails with [MirrorError::LockHeld] if another process holds it.
    pub fn acquire(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| MirrorError::IoPath(format!("{}", dir.display()), e))?;

        let path = dir.join(LOCK_FILENAME);

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| MirrorError::IoPath(format!("{}", path.display()), e))?;

        file.try_lock_exclusive()
            .map_err(|_| MirrorError::LockHeld(format!("{}", path.display())))?;

        debug!("acquired {}", path.display());

        Ok(Self { path, file })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock and remove the lock file.
    pub fn release(self) -> Result<()> {
        self.file
            .unlock()
            .map_err(|e| MirrorError::IoPath(format!("{}", self.path.display()), e))?;

        std::fs::remove_file(&self.path)
            .map_err(|e| MirrorError::IoPath(format!("{}", self.path.display()), e))
    }
}
