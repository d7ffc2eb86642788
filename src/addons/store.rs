//! Persisted addon store.
//!
//! The engine reads the full addon set for an installation and writes the
//! full reconciled set back atomically per sync (write-then-rename), so a
//! cancelled or failed sync never leaves a half-written document behind.
//! One JSON document per installation, keyed by installation id.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::AddonError;
use super::types::Addon;

/// Store contract for persisted addon sets.
#[async_trait]
pub trait AddonStore: Send + Sync {
    /// Lists installation ids that have a persisted addon set.
    async fn list_installation_ids(&self) -> Result<Vec<String>, AddonError>;

    /// Returns the full addon set for an installation (empty if unknown).
    async fn get_addons(&self, installation_id: &str) -> Result<Vec<Addon>, AddonError>;

    /// Looks up one addon by id.
    async fn get_addon(
        &self,
        installation_id: &str,
        addon_id: &str,
    ) -> Result<Option<Addon>, AddonError>;

    /// Replaces the full addon set for an installation atomically.
    async fn replace_addons(
        &self,
        installation_id: &str,
        addons: &[Addon],
    ) -> Result<(), AddonError>;

    /// Inserts or updates a single addon record.
    async fn upsert_addon(&self, addon: &Addon) -> Result<(), AddonError>;

    /// Removes a single addon record.
    async fn remove_addon(&self, installation_id: &str, addon_id: &str)
    -> Result<(), AddonError>;

    /// Drops persisted sets whose installation is no longer known.
    ///
    /// Returns the number of pruned installations.
    async fn prune_installations(&self, known_ids: &[String]) -> Result<usize, AddonError>;

    /// Returns the installation ids that track any of the given provider ids.
    async fn installations_with_external_ids(
        &self,
        external_ids: &[String],
    ) -> Result<Vec<String>, AddonError>;
}

/// Replaces filename-hostile characters in an installation id.
fn sanitize_id(installation_id: &str) -> String {
    installation_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// JSON-file-backed addon store.
#[derive(Debug)]
pub struct JsonAddonStore {
    dir: PathBuf,
}

impl JsonAddonStore {
    /// Creates a store rooted at the given directory.
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn document_path(&self, installation_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_id(installation_id)))
    }

    async fn read_document(&self, installation_id: &str) -> Result<Vec<Addon>, AddonError> {
        let path = self.document_path(installation_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| AddonError::Store(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(AddonError::Io(e)),
        }
    }

    async fn write_document(
        &self,
        installation_id: &str,
        addons: &[Addon],
    ) -> Result<(), AddonError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.document_path(installation_id);
        let tmp = path.with_extension("json.tmp");
        let bytes =
            serde_json::to_vec_pretty(addons).map_err(|e| AddonError::Store(e.to_string()))?;

        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(
            "[STORE] Wrote {} addon(s) for installation '{}'",
            addons.len(),
            installation_id
        );
        Ok(())
    }
}

#[async_trait]
impl AddonStore for JsonAddonStore {
    async fn list_installation_ids(&self) -> Result<Vec<String>, AddonError> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(AddonError::Io(e)),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn get_addons(&self, installation_id: &str) -> Result<Vec<Addon>, AddonError> {
        self.read_document(installation_id).await
    }

    async fn get_addon(
        &self,
        installation_id: &str,
        addon_id: &str,
    ) -> Result<Option<Addon>, AddonError> {
        let addons = self.read_document(installation_id).await?;
        Ok(addons.into_iter().find(|a| a.id == addon_id))
    }

    async fn replace_addons(
        &self,
        installation_id: &str,
        addons: &[Addon],
    ) -> Result<(), AddonError> {
        self.write_document(installation_id, addons).await
    }

    async fn upsert_addon(&self, addon: &Addon) -> Result<(), AddonError> {
        let mut addons = self.read_document(&addon.installation_id).await?;
        match addons.iter_mut().find(|a| a.id == addon.id) {
            Some(existing) => *existing = addon.clone(),
            None => addons.push(addon.clone()),
        }
        self.write_document(&addon.installation_id, &addons).await
    }

    async fn remove_addon(
        &self,
        installation_id: &str,
        addon_id: &str,
    ) -> Result<(), AddonError> {
        let mut addons = self.read_document(installation_id).await?;
        addons.retain(|a| a.id != addon_id);
        self.write_document(installation_id, &addons).await
    }

    async fn prune_installations(&self, known_ids: &[String]) -> Result<usize, AddonError> {
        let known: Vec<String> = known_ids.iter().map(|id| sanitize_id(id)).collect();
        let mut pruned = 0;

        for id in self.list_installation_ids().await? {
            if known.contains(&id) {
                continue;
            }
            let path = self.dir.join(format!("{id}.json"));
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    warn!("[STORE] Pruned orphaned addon set '{}'", id);
                    pruned += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(AddonError::Io(e)),
            }
        }
        Ok(pruned)
    }

    async fn installations_with_external_ids(
        &self,
        external_ids: &[String],
    ) -> Result<Vec<String>, AddonError> {
        let mut affected = Vec::new();

        for installation_id in self.list_installation_ids().await? {
            let addons = self.read_document(&installation_id).await?;
            let tracked: HashMap<&str, ()> = addons
                .iter()
                .flat_map(|a| {
                    std::iter::once(a.external_id.as_str())
                        .chain(a.external_ids.iter().map(|e| e.id.as_str()))
                })
                .map(|id| (id, ()))
                .collect();

            if external_ids
                .iter()
                .any(|id| !id.is_empty() && tracked.contains_key(id.as_str()))
            {
                affected.push(installation_id);
            }
        }
        Ok(affected)
    }
}
