//! Resync epoch marker shared by every instance of one subscriber.
//!
//! The marker file holds the last epoch whose clear has been performed.
//! Advancing it is a compare-and-set under an exclusive file lock, so at most
//! one instance runs the clear for a given epoch, even across processes.

use crate::error::Result;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub struct EpochMarker {
    path: PathBuf,
}

impl EpochMarker {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Last epoch recorded, if any.
    pub fn current(&self) -> Result<Option<i64>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.path)?;
        FileExt::lock_shared(&file)?;
        let value = Self::read_epoch(&mut file);
        let _ = FileExt::unlock(&file);
        value
    }

    /// Run `on_advance` and record `epoch` if it is newer than the marker.
    ///
    /// Returns `false` without running `on_advance` when another instance
    /// already advanced to `epoch` (or beyond). If `on_advance` fails the
    /// marker is left unchanged.
    pub fn advance(&self, epoch: i64, on_advance: impl FnOnce() -> Result<()>) -> Result<bool> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        FileExt::lock_exclusive(&file)?;
        let result = Self::advance_locked(&mut file, epoch, on_advance);
        let _ = FileExt::unlock(&file);
        result
    }

    fn advance_locked(
        file: &mut File,
        epoch: i64,
        on_advance: impl FnOnce() -> Result<()>,
    ) -> Result<bool> {
        if let Some(current) = Self::read_epoch(file)? {
            if current >= epoch {
                return Ok(false);
            }
        }

        on_advance()?;

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(epoch.to_string().as_bytes())?;
        file.sync_all()?;
        Ok(true)
    }

    fn read_epoch(file: &mut File) -> Result<Option<i64>> {
        file.seek(SeekFrom::Start(0))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(contents.trim().parse::<i64>().ok())
    }
}
