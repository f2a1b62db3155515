//! Which entity types each subscriber is responsible for.

use crate::error::Result;
use crate::types::EntityTypeRegistration;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Registration set, optionally persisted as a JSON array.
pub struct EntityTypeRegistry {
    path: Option<PathBuf>,
    entries: RwLock<Vec<EntityTypeRegistration>>,
}

impl EntityTypeRegistry {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Load `{dir}/{identity}.registrations.json`, or start empty.
    pub fn open(dir: impl AsRef<Path>, identity: &str) -> Result<Self> {
        let path = dir.as_ref().join(format!("{identity}.registrations.json"));
        let entries = if path.exists() {
            let bytes = fs::read(&path)?;
            if bytes.is_empty() {
                Vec::new()
            } else {
                serde_json::from_slice(&bytes)?
            }
        } else {
            Vec::new()
        };
        debug!(path = %path.display(), registrations = entries.len(), "Registry loaded");
        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
        })
    }

    /// Register `types` for `subscriber`. Returns the types that were new.
    pub fn register<I, S>(&self, subscriber: &str, types: I, is_custom: bool) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let added = {
            let mut entries = self.entries.write();
            let mut added = Vec::new();
            for entity_type in types {
                let entity_type = entity_type.into();
                let known = entries
                    .iter()
                    .any(|r| r.subscriber == subscriber && r.entity_type == entity_type);
                if !known {
                    entries.push(EntityTypeRegistration {
                        subscriber: subscriber.to_string(),
                        entity_type: entity_type.clone(),
                        is_custom,
                    });
                    added.push(entity_type);
                }
            }
            added
        };
        if !added.is_empty() {
            info!(subscriber, types = ?added, "Entity types registered");
            self.save()?;
        }
        Ok(added)
    }

    /// Drop `types` for `subscriber`. Returns the types that were registered.
    pub fn unregister<I, S>(&self, subscriber: &str, types: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let wanted: BTreeSet<String> = types.into_iter().map(Into::into).collect();
        let removed = {
            let mut entries = self.entries.write();
            let mut removed = Vec::new();
            entries.retain(|r| {
                let drop = r.subscriber == subscriber && wanted.contains(&r.entity_type);
                if drop {
                    removed.push(r.entity_type.clone());
                }
                !drop
            });
            removed
        };
        if !removed.is_empty() {
            info!(subscriber, types = ?removed, "Entity types unregistered");
            self.save()?;
        }
        Ok(removed)
    }

    pub fn types_for(&self, subscriber: &str) -> BTreeSet<String> {
        self.entries
            .read()
            .iter()
            .filter(|r| r.subscriber == subscriber)
            .map(|r| r.entity_type.clone())
            .collect()
    }

    pub fn handles(&self, subscriber: &str, entity_type: &str) -> bool {
        self.entries
            .read()
            .iter()
            .any(|r| r.subscriber == subscriber && r.entity_type == entity_type)
    }

    pub fn registrations(&self) -> Vec<EntityTypeRegistration> {
        self.entries.read().clone()
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let encoded = serde_json::to_vec_pretty(&*self.entries.read())?;
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_register_reports_only_new() {
        let registry = EntityTypeRegistry::in_memory();
        assert_eq!(
            registry.register("master", ["Product", "Asset"], false).unwrap(),
            vec!["Product", "Asset"]
        );
        assert_eq!(
            registry.register("master", ["Product", "Channel"], false).unwrap(),
            vec!["Channel"]
        );
        assert!(registry.handles("master", "Channel"));
        assert!(!registry.handles("search", "Channel"));
    }

    #[test]
    fn test_unregister_scoped_to_subscriber() {
        let registry = EntityTypeRegistry::in_memory();
        registry.register("master", ["Product"], false).unwrap();
        registry.register("erp", ["Product"], true).unwrap();

        assert_eq!(registry.unregister("master", ["Product", "Ghost"]).unwrap(), vec!["Product"]);
        assert!(registry.types_for("master").is_empty());
        assert!(registry.handles("erp", "Product"));
    }

    #[test]
    fn test_persisted_across_open() {
        let dir = TempDir::new().unwrap();
        {
            let registry = EntityTypeRegistry::open(dir.path(), "erp_pim").unwrap();
            registry.register("erp", ["Product", "Asset"], true).unwrap();
            registry.unregister("erp", ["Asset"]).unwrap();
        }
        let registry = EntityTypeRegistry::open(dir.path(), "erp_pim").unwrap();
        let registrations = registry.registrations();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].entity_type, "Product");
        assert!(registrations[0].is_custom);
    }
}
