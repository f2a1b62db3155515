//! Tracker checkpoint file: one JSON object of key -> insertion time.

use crate::error::{Result, SyncError};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// JSON checkpoint of one subscriber's tracker.
pub struct CheckpointFile {
    path: PathBuf,
}

impl CheckpointFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the checkpoint. A missing file is an empty map.
    pub fn load(&self) -> Result<HashMap<String, i64>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let bytes = fs::read(&self.path)?;
        if bytes.is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_slice(&bytes).map_err(|e| SyncError::CorruptCheckpoint {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Like `load`, but a corrupt file is moved aside and treated as missing.
    pub fn load_or_reset(&self) -> Result<HashMap<String, i64>> {
        match self.load() {
            Err(SyncError::CorruptCheckpoint { path, reason }) => {
                let aside = self.path.with_extension("corrupt");
                warn!(path = %path, reason = %reason, aside = %aside.display(), "Checkpoint unreadable, starting empty");
                fs::rename(&self.path, &aside)?;
                Ok(HashMap::new())
            }
            other => other,
        }
    }

    /// Write the snapshot to a temp file, then rename over the checkpoint.
    pub fn save(&self, entries: &HashMap<String, i64>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let ordered: BTreeMap<&str, i64> = entries.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        let encoded = serde_json::to_vec(&ordered)?;

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
