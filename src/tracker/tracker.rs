//! Last-applied insertion time per entity row.

use super::checkpoint::CheckpointFile;
use super::epoch::EpochMarker;
use crate::error::Result;
use crate::types::{Action, MessageKind, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Value recorded for a key whose entity has been deleted.
pub const DELETED: i64 = -1;

/// Where the resync epoch lives.
enum EpochGuard {
    File(EpochMarker),
    Memory(Mutex<Option<i64>>),
}

/// Detects stale and duplicate redeliveries by comparing insertion times.
///
/// Read and written by the delivery path and by the periodic flush; the map
/// sits behind a `RwLock` and flushes work on a cloned snapshot.
pub struct IdempotencyTracker {
    entries: RwLock<HashMap<String, i64>>,
    checkpoint: Option<CheckpointFile>,
    epoch: EpochGuard,
    dirty: AtomicBool,
}

impl IdempotencyTracker {
    /// Tracker with no checkpoint file (nothing survives a restart).
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            checkpoint: None,
            epoch: EpochGuard::Memory(Mutex::new(None)),
            dirty: AtomicBool::new(false),
        }
    }

    /// Open the tracker for `identity`, loading `{dir}/{identity}.json` if present.
    pub fn open(dir: impl AsRef<Path>, identity: &str) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let checkpoint = CheckpointFile::new(dir.join(format!("{identity}.json")));
        let entries = checkpoint.load_or_reset()?;
        info!(identity, entries = entries.len(), path = %checkpoint.path().display(), "Tracker checkpoint loaded");

        Ok(Self {
            entries: RwLock::new(entries),
            checkpoint: Some(checkpoint),
            epoch: EpochGuard::File(EpochMarker::new(dir.join(format!("{identity}.epoch")))),
            dirty: AtomicBool::new(false),
        })
    }

    /// `entityType[_kind]_entityId`; item rows carry no kind segment.
    pub fn key(entity_type: &str, kind: MessageKind, entity_id: &str) -> String {
        match kind {
            MessageKind::Item => format!("{entity_type}_{entity_id}"),
            other => format!("{entity_type}_{}_{entity_id}", other.as_str()),
        }
    }

    /// Record that a message for `key` staged at `insertion_time` arrived.
    pub fn record(&self, key: &str, insertion_time: Timestamp, action: Action) {
        let mut entries = self.entries.write();
        Self::record_locked(&mut entries, key, insertion_time, action);
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Whether a message should be applied.
    ///
    /// Creates and deletes are never suppressed. An update is applied only
    /// while the recorded time equals its own, i.e. nothing newer has won.
    pub fn is_valid(&self, key: &str, insertion_time: Timestamp, action: Action) -> bool {
        Self::is_valid_in(&self.entries.read(), key, insertion_time, action)
    }

    /// `record` then `is_valid`, under one lock.
    pub fn observe(&self, key: &str, insertion_time: Timestamp, action: Action) -> bool {
        let mut entries = self.entries.write();
        Self::record_locked(&mut entries, key, insertion_time, action);
        self.dirty.store(true, Ordering::SeqCst);
        Self::is_valid_in(&entries, key, insertion_time, action)
    }

    fn record_locked(
        entries: &mut HashMap<String, i64>,
        key: &str,
        insertion_time: Timestamp,
        action: Action,
    ) {
        let time = insertion_time.0;
        match (action, entries.get(key).copied()) {
            (Action::Delete, _) => {
                entries.insert(key.to_string(), DELETED);
            }
            (_, None) => {
                entries.insert(key.to_string(), time);
            }
            // A create (or bulk load) brings a deleted key back to life.
            (Action::Create | Action::InitialLoad, Some(current))
                if current == DELETED || time > current =>
            {
                entries.insert(key.to_string(), time);
            }
            (Action::Update, Some(current)) if current != DELETED && time > current => {
                entries.insert(key.to_string(), time);
            }
            _ => {}
        }
    }

    fn is_valid_in(
        entries: &HashMap<String, i64>,
        key: &str,
        insertion_time: Timestamp,
        action: Action,
    ) -> bool {
        match action {
            Action::Create | Action::Delete | Action::InitialLoad => true,
            Action::Update => entries
                .get(key)
                .map_or(true, |recorded| *recorded == insertion_time.0),
        }
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.entries.read().get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every key of `entity_type`. Returns the number removed.
    ///
    /// Keys of `other_types` whose names extend it (`Product_Variant` for
    /// `Product`) share the prefix and are kept.
    pub fn purge_type<'a>(&self, entity_type: &str, other_types: impl IntoIterator<Item = &'a str>) -> usize {
        let prefix = format!("{entity_type}_");
        let longer: Vec<String> = other_types
            .into_iter()
            .filter(|other| *other != entity_type && other.starts_with(&prefix))
            .map(|other| format!("{other}_"))
            .collect();

        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| {
            !key.starts_with(&prefix) || longer.iter().any(|other| key.starts_with(other.as_str()))
        });
        let removed = before - entries.len();
        if removed > 0 {
            self.dirty.store(true, Ordering::SeqCst);
        }
        removed
    }

    /// Discard the whole map for resync `epoch`.
    ///
    /// Only the first instance to reach a given epoch performs the clear (and
    /// persists the empty checkpoint); the call returns whether this one did.
    pub fn clear_for_epoch(&self, epoch: i64) -> Result<bool> {
        let clear = || -> Result<()> {
            self.entries.write().clear();
            if let Some(checkpoint) = &self.checkpoint {
                checkpoint.save(&HashMap::new())?;
            }
            self.dirty.store(false, Ordering::SeqCst);
            Ok(())
        };

        let cleared = match &self.epoch {
            EpochGuard::File(marker) => marker.advance(epoch, clear)?,
            EpochGuard::Memory(last) => {
                let mut last = last.lock();
                if last.is_some_and(|seen| seen >= epoch) {
                    false
                } else {
                    clear()?;
                    *last = Some(epoch);
                    true
                }
            }
        };

        if cleared {
            info!(epoch, "Tracker cleared for resync");
        } else {
            debug!(epoch, "Resync epoch already cleared");
        }
        Ok(cleared)
    }

    /// Replace the in-memory map with the checkpoint on disk.
    pub fn reload(&self) -> Result<()> {
        if let Some(checkpoint) = &self.checkpoint {
            let entries = checkpoint.load_or_reset()?;
            *self.entries.write() = entries;
            self.dirty.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Persist a snapshot of the map.
    pub fn flush(&self) -> Result<()> {
        if let Some(checkpoint) = &self.checkpoint {
            let snapshot = self.entries.read().clone();
            self.dirty.store(false, Ordering::SeqCst);
            checkpoint.save(&snapshot)?;
            debug!(entries = snapshot.len(), "Tracker checkpoint flushed");
        }
        Ok(())
    }

    /// Persist only if something changed since the last flush.
    pub fn flush_if_dirty(&self) -> Result<bool> {
        if self.checkpoint.is_some() && self.dirty.load(Ordering::SeqCst) {
            self.flush()?;
            return Ok(true);
        }
        Ok(false)
    }
}
