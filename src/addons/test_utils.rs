//! In-memory collaborators for exercising the sync engine without a network.
//!
//! Used by the integration tests in `tests/`; kept in the library so the
//! mocks stay next to the contracts they implement.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::AddonError;
use super::provider::{AddonProvider, AddonSearchResult, AddonSearchResultFile};
use super::scan::AddonScanner;
use super::store::AddonStore;
use super::types::{Addon, AddonFingerprint, ChannelType, ClientVariant, Installation};
use crate::net::NetError;

/// Builds an installation rooted in a temporary directory.
#[must_use]
pub fn make_installation(id: &str, root: &Path) -> Installation {
    Installation::new(
        id,
        "Test Installation",
        ClientVariant::Retail,
        root.to_path_buf(),
    )
}

/// Builds a tracked addon with matching folder and versions.
#[must_use]
pub fn make_addon(installation_id: &str, name: &str, installed: &str) -> Addon {
    let mut addon = Addon::new(
        installation_id,
        "scripted",
        &format!("ext-{name}"),
        name,
    );
    addon.installed_version = installed.to_string();
    addon.latest_version = installed.to_string();
    addon.folder_names = vec![name.to_string()];
    addon
}

/// Builds a one-file search result for a version.
#[must_use]
pub fn make_result(version: &str) -> AddonSearchResult {
    AddonSearchResult {
        provider_name: "scripted".to_string(),
        files: vec![AddonSearchResultFile {
            version: version.to_string(),
            download_url: format!("https://example.invalid/{version}.zip"),
            channel_type: ChannelType::Stable,
            ..AddonSearchResultFile::default()
        }],
        ..AddonSearchResult::default()
    }
}

/// Purely in-memory addon store.
#[derive(Default)]
pub struct MemoryAddonStore {
    sets: Mutex<HashMap<String, Vec<Addon>>>,
    /// Number of `replace_addons` calls, i.e. completed reconciliations.
    pub replace_calls: AtomicUsize,
}

impl MemoryAddonStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-seeded with one installation's addons.
    #[must_use]
    pub fn seeded(installation_id: &str, addons: Vec<Addon>) -> Self {
        let store = Self::new();
        {
            let mut sets = store.sets.lock().unwrap_or_else(PoisonError::into_inner);
            sets.insert(installation_id.to_string(), addons);
        }
        store
    }
}

#[async_trait]
impl AddonStore for MemoryAddonStore {
    async fn list_installation_ids(&self) -> Result<Vec<String>, AddonError> {
        let sets = self.sets.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = sets.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_addons(&self, installation_id: &str) -> Result<Vec<Addon>, AddonError> {
        let sets = self.sets.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(sets.get(installation_id).cloned().unwrap_or_default())
    }

    async fn get_addon(
        &self,
        installation_id: &str,
        addon_id: &str,
    ) -> Result<Option<Addon>, AddonError> {
        let sets = self.sets.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(sets
            .get(installation_id)
            .and_then(|addons| addons.iter().find(|a| a.id == addon_id).cloned()))
    }

    async fn replace_addons(
        &self,
        installation_id: &str,
        addons: &[Addon],
    ) -> Result<(), AddonError> {
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        let mut sets = self.sets.lock().unwrap_or_else(PoisonError::into_inner);
        sets.insert(installation_id.to_string(), addons.to_vec());
        Ok(())
    }

    async fn upsert_addon(&self, addon: &Addon) -> Result<(), AddonError> {
        let mut sets = self.sets.lock().unwrap_or_else(PoisonError::into_inner);
        let addons = sets.entry(addon.installation_id.clone()).or_default();
        match addons.iter_mut().find(|a| a.id == addon.id) {
            Some(existing) => *existing = addon.clone(),
            None => addons.push(addon.clone()),
        }
        Ok(())
    }

    async fn remove_addon(
        &self,
        installation_id: &str,
        addon_id: &str,
    ) -> Result<(), AddonError> {
        let mut sets = self.sets.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(addons) = sets.get_mut(installation_id) {
            addons.retain(|a| a.id != addon_id);
        }
        Ok(())
    }

    async fn prune_installations(&self, known_ids: &[String]) -> Result<usize, AddonError> {
        let mut sets = self.sets.lock().unwrap_or_else(PoisonError::into_inner);
        let before = sets.len();
        sets.retain(|id, _| known_ids.contains(id));
        Ok(before - sets.len())
    }

    async fn installations_with_external_ids(
        &self,
        external_ids: &[String],
    ) -> Result<Vec<String>, AddonError> {
        let sets = self.sets.lock().unwrap_or_else(PoisonError::into_inner);
        let mut affected: Vec<String> = sets
            .iter()
            .filter(|(_, addons)| {
                addons
                    .iter()
                    .any(|a| external_ids.iter().any(|id| a.has_external_id(id)))
            })
            .map(|(id, _)| id.clone())
            .collect();
        affected.sort();
        Ok(affected)
    }
}

/// Scanner returning a fixed fingerprint set.
pub struct StaticScanner {
    fingerprints: Mutex<Vec<AddonFingerprint>>,
    /// Number of scans performed.
    pub scan_calls: AtomicUsize,
}

impl StaticScanner {
    /// Creates a scanner that always reports the given fingerprints.
    #[must_use]
    pub fn new(fingerprints: Vec<AddonFingerprint>) -> Self {
        Self {
            fingerprints: Mutex::new(fingerprints),
            scan_calls: AtomicUsize::new(0),
        }
    }

    /// Replaces the reported fingerprints.
    pub fn set(&self, fingerprints: Vec<AddonFingerprint>) {
        let mut current = self
            .fingerprints
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *current = fingerprints;
    }
}

#[async_trait]
impl AddonScanner for StaticScanner {
    async fn scan(&self, _installation: &Installation) -> Result<Vec<AddonFingerprint>, AddonError> {
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        let fingerprints = self
            .fingerprints
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(fingerprints.clone())
    }
}

/// Scripted response for one addon's `get_latest` call.
#[derive(Debug, Clone)]
pub enum ScriptedFetch {
    /// Fresh metadata.
    Latest(AddonSearchResult),
    /// The 404 "no data" case.
    NoData,
    /// A server-fault failure.
    Fail(String),
    /// The provider's breaker is open.
    CircuitOpen,
}

/// Provider answering from a script of canned responses, keyed by external id.
pub struct ScriptedProvider {
    name: String,
    responses: Mutex<HashMap<String, ScriptedFetch>>,
    delay: Duration,
    /// Number of `get_latest` calls made.
    pub fetch_calls: AtomicUsize,
}

impl ScriptedProvider {
    /// Creates a provider named "scripted" with no responses (every fetch is
    /// a 404).
    #[must_use]
    pub fn new() -> Self {
        Self::named("scripted")
    }

    /// Creates a provider with a custom name.
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            responses: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
            fetch_calls: AtomicUsize::new(0),
        }
    }

    /// Adds an artificial delay to every fetch.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Scripts the response for an external id.
    pub fn respond(&self, external_id: &str, fetch: ScriptedFetch) {
        let mut responses = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        responses.insert(external_id.to_string(), fetch);
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AddonProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_latest(
        &self,
        _installation: &Installation,
        addon: &Addon,
    ) -> Result<Option<AddonSearchResult>, AddonError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = {
            let responses = self
                .responses
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            responses.get(&addon.external_id).cloned()
        };

        match scripted {
            Some(ScriptedFetch::Latest(result)) => Ok(Some(result)),
            Some(ScriptedFetch::NoData) | None => Ok(None),
            Some(ScriptedFetch::Fail(message)) => Err(AddonError::Provider(message)),
            Some(ScriptedFetch::CircuitOpen) => {
                Err(AddonError::Net(NetError::CircuitOpen(self.name.clone())))
            }
        }
    }

    async fn search(
        &self,
        _installation: &Installation,
        _term: &str,
    ) -> Result<Vec<AddonSearchResult>, AddonError> {
        Ok(Vec::new())
    }

    async fn get_changelog(
        &self,
        _installation: &Installation,
        _addon: &Addon,
    ) -> Result<Option<String>, AddonError> {
        Ok(None)
    }
}

/// Package fetcher writing a fixture zip instead of downloading.
pub struct FixtureFetcher {
    folders: Vec<String>,
    version: String,
    delay: Duration,
}

impl FixtureFetcher {
    /// Creates a fetcher producing the given folders.
    #[must_use]
    pub fn new(folders: &[&str], version: &str) -> Self {
        Self {
            folders: folders.iter().map(|f| (*f).to_string()).collect(),
            version: version.to_string(),
            delay: Duration::ZERO,
        }
    }

    /// Adds an artificial delay before the archive is written.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl super::lifecycle::PackageFetcher for FixtureFetcher {
    async fn fetch(&self, _addon: &Addon, dest: &Path) -> Result<(), AddonError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let file = std::fs::File::create(dest)?;
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();

        for folder in &self.folders {
            writer
                .add_directory(format!("{folder}/"), options)
                .map_err(|e| AddonError::Archive(e.to_string()))?;
            writer
                .start_file(format!("{folder}/{folder}.toc"), options)
                .map_err(|e| AddonError::Archive(e.to_string()))?;
            writer
                .write_all(format!("## Version: {}\n", self.version).as_bytes())
                .map_err(AddonError::Io)?;
        }
        writer
            .finish()
            .map_err(|e| AddonError::Archive(e.to_string()))?;
        Ok(())
    }
}

/// Package fetcher that always fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingFetcher;

#[async_trait]
impl super::lifecycle::PackageFetcher for FailingFetcher {
    async fn fetch(&self, addon: &Addon, _dest: &Path) -> Result<(), AddonError> {
        Err(AddonError::Provider(format!(
            "download failed for '{}'",
            addon.name
        )))
    }
}
