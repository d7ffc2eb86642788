//! Addon install/update/remove lifecycle machine.
//!
//! Drives one addon through Pending -> Downloading -> (BackingUp) ->
//! Installing -> Complete, with Error as the terminal failure state. Any
//! addon already in a non-terminal state rejects a second operation with
//! `OperationInProgress`; terminal states are re-entrant and restart from
//! Pending.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::AddonError;
use super::events::AddonEventBus;
use super::store::AddonStore;
use super::types::{Addon, AddonInstallState, AddonUpdateEvent, Installation, unix_now};
use crate::net::BreakerRegistry;

/// Whether an operation is a fresh install or an update of existing folders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationKind {
    Install,
    Update,
}

/// Fetches an addon archive to a staging path.
///
/// The HTTP implementation goes through the provider's breaker; tests swap
/// in fixture fetchers.
#[async_trait]
pub trait PackageFetcher: Send + Sync {
    /// Downloads the addon's archive to `dest`.
    async fn fetch(&self, addon: &Addon, dest: &Path) -> Result<(), AddonError>;
}

/// Downloads archives through the provider's registry-issued client.
pub struct HttpPackageFetcher {
    registry: Arc<BreakerRegistry>,
}

impl HttpPackageFetcher {
    /// Creates a fetcher over the breaker registry.
    #[must_use]
    pub fn new(registry: Arc<BreakerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl PackageFetcher for HttpPackageFetcher {
    async fn fetch(&self, addon: &Addon, dest: &Path) -> Result<(), AddonError> {
        let url = addon.download_url.as_deref().ok_or_else(|| {
            AddonError::Provider(format!("No download url for addon '{}'", addon.name))
        })?;

        let client = self.registry.client_for(&addon.provider_name);
        let bytes = client.get_bytes(url, None).await?;
        tokio::fs::write(dest, bytes).await?;
        Ok(())
    }
}

/// Ensures a dropped operation does not wedge the per-addon guard: if the
/// future is dropped mid-flight, the addon lands in the terminal Error state
/// and stays re-entrant.
struct OpGuard<'a> {
    states: &'a Mutex<HashMap<String, AddonInstallState>>,
    addon_id: String,
    armed: bool,
}

impl OpGuard<'_> {
    fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut states = self
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        states.insert(self.addon_id.clone(), AddonInstallState::Error);
    }
}

/// Lifecycle machine for addon install/update/remove operations.
pub struct AddonLifecycle {
    store: Arc<dyn AddonStore>,
    fetcher: Arc<dyn PackageFetcher>,
    events: AddonEventBus,
    staging_dir: PathBuf,
    backup_dir: PathBuf,
    states: Mutex<HashMap<String, AddonInstallState>>,
}

impl AddonLifecycle {
    /// Creates a lifecycle machine.
    ///
    /// `work_dir` holds staged downloads and pre-update backups.
    #[must_use]
    pub fn new(
        store: Arc<dyn AddonStore>,
        fetcher: Arc<dyn PackageFetcher>,
        events: AddonEventBus,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            fetcher,
            events,
            staging_dir: work_dir.join("downloads"),
            backup_dir: work_dir.join("backups"),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the last known install state for an addon.
    #[must_use]
    pub fn install_state(&self, addon_id: &str) -> AddonInstallState {
        self.lock_states()
            .get(addon_id)
            .copied()
            .unwrap_or(AddonInstallState::Unknown)
    }

    /// Installs an addon from its provider's latest file.
    pub async fn install(
        &self,
        installation: &Installation,
        addon_id: &str,
    ) -> Result<Addon, AddonError> {
        self.run(installation, addon_id, OperationKind::Install)
            .await
    }

    /// Updates an installed addon, backing up its existing folders first.
    pub async fn update(
        &self,
        installation: &Installation,
        addon_id: &str,
    ) -> Result<Addon, AddonError> {
        self.run(installation, addon_id, OperationKind::Update).await
    }

    /// Removes an addon's folders and its store record.
    pub async fn remove(
        &self,
        installation: &Installation,
        addon_id: &str,
    ) -> Result<(), AddonError> {
        let addon = self
            .store
            .get_addon(&installation.id, addon_id)
            .await?
            .ok_or_else(|| AddonError::NotFound(addon_id.to_string()))?;

        let guard = self.claim(addon_id)?;
        info!("[LIFECYCLE] Removing '{}'", addon.name);

        let result = self.remove_steps(installation, &addon).await;
        guard.defuse();
        match result {
            Ok(()) => {
                self.transition(&addon, AddonInstallState::Unknown, 0);
                Ok(())
            }
            Err(e) => {
                warn!("[LIFECYCLE] Remove failed for '{}': {}", addon.name, e);
                self.transition(&addon, AddonInstallState::Error, 0);
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        installation: &Installation,
        addon_id: &str,
        kind: OperationKind,
    ) -> Result<Addon, AddonError> {
        let addon = self
            .store
            .get_addon(&installation.id, addon_id)
            .await?
            .ok_or_else(|| AddonError::NotFound(addon_id.to_string()))?;

        // An addon flagged by reconciliation needs the user to resolve the
        // divergence before install/update may touch its files.
        if addon.warning_type.is_some() {
            return Err(AddonError::ReconciliationConflict(addon_id.to_string()));
        }

        let guard = self.claim(addon_id)?;
        info!(
            "[LIFECYCLE] {} '{}' ({} -> {})",
            if kind == OperationKind::Install { "Installing" } else { "Updating" },
            addon.name,
            addon.installed_version,
            addon.latest_version
        );

        let result = self.run_steps(installation, &addon, kind).await;
        guard.defuse();
        match result {
            Ok(installed) => {
                self.transition(&installed, AddonInstallState::Complete, 100);
                Ok(installed)
            }
            Err(e) => {
                warn!("[LIFECYCLE] {} failed for '{}': {}", kind_label(kind), addon.name, e);
                self.transition(&addon, AddonInstallState::Error, 0);
                Err(e)
            }
        }
    }

    async fn run_steps(
        &self,
        installation: &Installation,
        addon: &Addon,
        kind: OperationKind,
    ) -> Result<Addon, AddonError> {
        let mut addon = addon.clone();
        self.transition(&addon, AddonInstallState::Pending, 0);

        // Downloading
        self.transition(&addon, AddonInstallState::Downloading, 25);
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let archive_path = self.staging_dir.join(format!("{}.zip", addon.id));
        self.fetcher.fetch(&addon, &archive_path).await?;

        // BackingUp, only when updating over existing local files
        let addons_dir = installation.addons_dir();
        let existing: Vec<String> = {
            let mut present = Vec::new();
            for folder in addon.known_folders() {
                if addons_dir.join(&folder).is_dir() {
                    present.push(folder);
                }
            }
            present
        };

        if kind == OperationKind::Update && !existing.is_empty() {
            self.transition(&addon, AddonInstallState::BackingUp, 50);
            self.backup_folders(&addons_dir, &addon, &existing).await?;
        } else {
            // A fresh install over leftover folders replaces them outright.
            for folder in &existing {
                tokio::fs::remove_dir_all(addons_dir.join(folder)).await?;
            }
        }

        // Installing
        self.transition(&addon, AddonInstallState::Installing, 75);
        tokio::fs::create_dir_all(&addons_dir).await?;
        let folders = extract_archive(&archive_path, &addons_dir).await?;
        let _ = tokio::fs::remove_file(&archive_path).await;

        if !folders.is_empty() {
            addon.folder_names = folders;
        }
        if !addon.latest_version.is_empty() {
            addon.installed_version = addon.latest_version.clone();
        }
        addon.installed_at = unix_now();
        addon.warning_type = None;

        self.store.upsert_addon(&addon).await?;
        Ok(addon)
    }

    async fn remove_steps(
        &self,
        installation: &Installation,
        addon: &Addon,
    ) -> Result<(), AddonError> {
        let addons_dir = installation.addons_dir();
        for folder in addon.known_folders() {
            match tokio::fs::remove_dir_all(addons_dir.join(&folder)).await {
                Ok(()) => debug!("[LIFECYCLE] Removed folder '{}'", folder),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(AddonError::Io(e)),
            }
        }
        self.store.remove_addon(&installation.id, &addon.id).await
    }

    /// Moves existing folders aside before an update replaces them.
    async fn backup_folders(
        &self,
        addons_dir: &Path,
        addon: &Addon,
        folders: &[String],
    ) -> Result<(), AddonError> {
        let backup_root = self.backup_dir.join(format!("{}-{}", addon.id, unix_now()));
        tokio::fs::create_dir_all(&backup_root).await?;

        for folder in folders {
            let src = addons_dir.join(folder);
            let dst = backup_root.join(folder);
            tokio::fs::rename(&src, &dst).await?;
            debug!("[LIFECYCLE] Backed up '{}' to '{}'", folder, dst.display());
        }
        Ok(())
    }

    /// Rejects a second operation on an addon in a non-terminal state.
    fn claim(&self, addon_id: &str) -> Result<OpGuard<'_>, AddonError> {
        let mut states = self.lock_states();
        if let Some(state) = states.get(addon_id) {
            if !state.is_terminal() && *state != AddonInstallState::Unknown {
                return Err(AddonError::OperationInProgress(addon_id.to_string()));
            }
        }
        states.insert(addon_id.to_string(), AddonInstallState::Pending);
        Ok(OpGuard {
            states: &self.states,
            addon_id: addon_id.to_string(),
            armed: true,
        })
    }

    fn transition(&self, addon: &Addon, state: AddonInstallState, progress: u8) {
        {
            let mut states = self.lock_states();
            states.insert(addon.id.clone(), state);
        }
        debug!(
            "[LIFECYCLE] {} -> {} ({}%)",
            addon.name, state, progress
        );
        self.events.emit(AddonUpdateEvent {
            addon: addon.clone(),
            install_state: state,
            progress,
        });
    }

    fn lock_states(&self) -> MutexGuard<'_, HashMap<String, AddonInstallState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn kind_label(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Install => "Install",
        OperationKind::Update => "Update",
    }
}

/// Extracts a zip archive into the addons directory, returning the top-level
/// folder names it created.
async fn extract_archive(archive: &Path, dest: &Path) -> Result<Vec<String>, AddonError> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_archive_blocking(&archive, &dest))
        .await
        .map_err(|e| AddonError::Io(io::Error::other(e)))?
}

fn extract_archive_blocking(archive: &Path, dest: &Path) -> Result<Vec<String>, AddonError> {
    use std::collections::BTreeSet;
    use std::fs::{self, File};

    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| AddonError::Archive(format!("Failed to open archive: {e}")))?;

    fs::create_dir_all(dest)?;
    let mut folders = BTreeSet::new();

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| AddonError::Archive(format!("Failed to read archive entry: {e}")))?;

        // enclosed_name rejects entries that would escape the destination.
        let Some(relative) = entry.enclosed_name() else {
            warn!("[LIFECYCLE] Skipping unsafe archive entry '{}'", entry.name());
            continue;
        };

        if let Some(first) = relative.components().next() {
            if entry.is_dir() || relative.components().count() > 1 {
                folders.insert(first.as_os_str().to_string_lossy().into_owned());
            }
        }

        let outpath = dest.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&outpath)?;
            io::copy(&mut entry, &mut outfile)?;
        }
    }

    Ok(folders.into_iter().collect())
}
