//! Per-installation sync orchestrator.
//!
//! A sync lists the on-disk addon folders, fans out provider fetches for
//! every tracked addon with bounded concurrency, waits for all of them
//! (fan-out/fan-in barrier), reconciles the results into a new canonical
//! addon set, persists it atomically, and emits one event per changed addon.
//!
//! Syncs for the same installation never overlap: a request arriving while
//! one is in flight is coalesced into a no-op result. Cancelling a sync
//! aborts the in-flight fetches and leaves the persisted set untouched.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::AddonError;
use super::events::AddonEventBus;
use super::provider::{AddonSearchResult, ProviderRegistry};
use super::scan::AddonScanner;
use super::store::AddonStore;
use super::types::{
    Addon, AddonFingerprint, AddonInstallState, AddonUpdateEvent, AddonWarningType, Installation,
    SyncResult,
};

/// Default bound on concurrent provider fetches within one sync.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 4;

/// Options for one sync call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Re-derive the on-disk fingerprint set instead of reusing the last scan.
    pub rescan: bool,
}

/// Outcome of one provider fetch inside the fan-out.
enum FetchOutcome {
    /// The addon was not fetched (ignored, unmatched, or provider disabled).
    Skipped,
    /// The provider had no data for the addon (404).
    NoData,
    /// Fresh metadata.
    Fresh(AddonSearchResult),
    /// The fetch failed.
    Failed(AddonError),
}

/// What reconciliation produced for one installation.
struct ReconcileOutcome {
    addons: Vec<Addon>,
    events: Vec<AddonUpdateEvent>,
    added: usize,
    updated: usize,
    removed: usize,
    errored: usize,
}

/// Removes the installation id from the in-flight set on drop, so a failed
/// or cancelled sync never wedges the coalescing guard.
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut set = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        set.remove(&self.id);
    }
}

/// Orchestrates reconciliation for game installations.
pub struct SyncOrchestrator {
    store: Arc<dyn AddonStore>,
    scanner: Arc<dyn AddonScanner>,
    providers: Arc<ProviderRegistry>,
    events: AddonEventBus,
    fetch_concurrency: usize,
    in_flight: Mutex<HashSet<String>>,
    last_scan: Mutex<HashMap<String, Vec<AddonFingerprint>>>,
}

impl SyncOrchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(
        store: Arc<dyn AddonStore>,
        scanner: Arc<dyn AddonScanner>,
        providers: Arc<ProviderRegistry>,
        events: AddonEventBus,
    ) -> Self {
        Self {
            store,
            scanner,
            providers,
            events,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            in_flight: Mutex::new(HashSet::new()),
            last_scan: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides the fetch concurrency bound.
    #[must_use]
    pub fn with_fetch_concurrency(mut self, concurrency: usize) -> Self {
        self.fetch_concurrency = concurrency.max(1);
        self
    }

    /// Returns the event bus this orchestrator emits on.
    #[must_use]
    pub fn events(&self) -> &AddonEventBus {
        &self.events
    }

    /// Synchronizes one installation.
    ///
    /// Returns a coalesced no-op result when a sync for the same installation
    /// is already in flight. Cancelling through the token aborts in-flight
    /// provider calls and returns `AddonError::SyncCancelled` with the
    /// persisted set unchanged.
    pub async fn sync(
        &self,
        installation: &Installation,
        options: SyncOptions,
        cancel: &CancellationToken,
    ) -> Result<SyncResult, AddonError> {
        let Some(_guard) = self.try_begin(&installation.id) else {
            debug!(
                "[SYNC] Sync for '{}' already in flight, coalescing",
                installation.id
            );
            return Ok(SyncResult::coalesced(&installation.id));
        };

        info!(
            "[SYNC] Syncing installation '{}' (rescan={})",
            installation.id, options.rescan
        );

        let fingerprints = self.fingerprints(installation, options.rescan).await?;
        if cancel.is_cancelled() {
            return Err(AddonError::SyncCancelled);
        }

        let stored = self.store.get_addons(&installation.id).await?;
        let fetched = self.fetch_latest_all(installation, &stored, cancel).await?;

        let outcome = reconcile(installation, stored, &fingerprints, &fetched);
        if cancel.is_cancelled() {
            return Err(AddonError::SyncCancelled);
        }

        // Persist the new canonical set, then notify.
        self.store
            .replace_addons(&installation.id, &outcome.addons)
            .await?;
        for event in outcome.events {
            self.events.emit(event);
        }

        let result = SyncResult {
            installation_id: installation.id.clone(),
            coalesced: false,
            added: outcome.added,
            updated: outcome.updated,
            removed: outcome.removed,
            errored: outcome.errored,
        };
        info!("[SYNC] Finished '{}': {}", installation.id, result);
        Ok(result)
    }

    /// Synchronizes several installations concurrently.
    ///
    /// Results are keyed by installation id; completion order is not the
    /// input order.
    pub async fn sync_all(
        self: Arc<Self>,
        installations: &[Installation],
        options: SyncOptions,
        cancel: &CancellationToken,
    ) -> Vec<(String, Result<SyncResult, AddonError>)> {
        let mut join_set = JoinSet::new();
        for installation in installations {
            let this = Arc::clone(&self);
            let installation = installation.clone();
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let result = this.sync(&installation, options, &cancel).await;
                (installation.id, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(entry) => results.push(entry),
                Err(e) => warn!("[SYNC] Sync task failed: {}", e),
            }
        }
        results
    }

    /// Lists addons eligible for an automatic update after a sync.
    pub async fn auto_update_candidates(
        &self,
        installation: &Installation,
    ) -> Result<Vec<Addon>, AddonError> {
        let addons = self.store.get_addons(&installation.id).await?;
        Ok(addons
            .into_iter()
            .filter(|a| {
                a.auto_update_enabled
                    && !a.is_ignored
                    && a.warning_type.is_none()
                    && a.is_update_available()
            })
            .collect())
    }

    /// Drops persisted addon sets whose installation is no longer known.
    pub async fn prune_orphans(&self, known: &[Installation]) -> Result<usize, AddonError> {
        let ids: Vec<String> = known.iter().map(|i| i.id.clone()).collect();
        self.store.prune_installations(&ids).await
    }

    /// Claims the per-installation sync slot, or reports it taken.
    fn try_begin(&self, installation_id: &str) -> Option<InFlightGuard<'_>> {
        let mut set = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if set.contains(installation_id) {
            return None;
        }
        set.insert(installation_id.to_string());
        Some(InFlightGuard {
            in_flight: &self.in_flight,
            id: installation_id.to_string(),
        })
    }

    /// Returns the fingerprint set, scanning when asked to or when no scan
    /// has happened yet.
    async fn fingerprints(
        &self,
        installation: &Installation,
        rescan: bool,
    ) -> Result<Vec<AddonFingerprint>, AddonError> {
        if !rescan {
            let cached = {
                let scans = self
                    .last_scan
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                scans.get(&installation.id).cloned()
            };
            if let Some(fingerprints) = cached {
                return Ok(fingerprints);
            }
        }

        let fingerprints = self.scanner.scan(installation).await?;
        let mut scans = self
            .last_scan
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        scans.insert(installation.id.clone(), fingerprints.clone());
        Ok(fingerprints)
    }

    /// Fans out provider fetches for every tracked addon and collects all
    /// outcomes before returning (the reconciliation barrier).
    async fn fetch_latest_all(
        &self,
        installation: &Installation,
        stored: &[Addon],
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, FetchOutcome>, AddonError> {
        let semaphore = Arc::new(Semaphore::new(self.fetch_concurrency));
        let mut join_set = JoinSet::new();
        let mut outcomes = HashMap::new();

        for addon in stored {
            if addon.is_ignored || addon.provider_name.is_empty() {
                outcomes.insert(addon.id.clone(), FetchOutcome::Skipped);
                continue;
            }
            let Some(provider) = self.providers.get_enabled(&addon.provider_name) else {
                debug!(
                    "[SYNC] Provider '{}' disabled, skipping '{}'",
                    addon.provider_name, addon.name
                );
                outcomes.insert(addon.id.clone(), FetchOutcome::Skipped);
                continue;
            };

            let semaphore = Arc::clone(&semaphore);
            let installation = installation.clone();
            let addon = addon.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = provider.get_latest(&installation, &addon).await;
                (addon.id, result)
            });
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    join_set.abort_all();
                    debug!("[SYNC] Cancelled, aborted in-flight fetches");
                    return Err(AddonError::SyncCancelled);
                }
                next = join_set.join_next() => match next {
                    Some(Ok((addon_id, result))) => {
                        let outcome = match result {
                            Ok(Some(fresh)) => FetchOutcome::Fresh(fresh),
                            Ok(None) => FetchOutcome::NoData,
                            Err(e) => FetchOutcome::Failed(e),
                        };
                        outcomes.insert(addon_id, outcome);
                    }
                    Some(Err(e)) => warn!("[SYNC] Fetch task failed: {}", e),
                    None => break,
                },
            }
        }
        Ok(outcomes)
    }
}

/// Merges stored state, on-disk fingerprints and fetched metadata into the
/// new canonical addon set.
fn reconcile(
    installation: &Installation,
    stored: Vec<Addon>,
    fingerprints: &[AddonFingerprint],
    fetched: &HashMap<String, FetchOutcome>,
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome {
        addons: Vec::new(),
        events: Vec::new(),
        added: 0,
        updated: 0,
        removed: 0,
        errored: 0,
    };

    let on_disk: HashMap<&str, &AddonFingerprint> = fingerprints
        .iter()
        .map(|f| (f.folder_name.as_str(), f))
        .collect();
    let mut claimed: HashSet<String> = HashSet::new();

    for mut addon in stored {
        // Records pointing at a different installation are stale; drop them.
        if addon.installation_id != installation.id {
            outcome.removed += 1;
            continue;
        }

        let folders = addon.known_folders();
        let present: Vec<&String> = folders
            .iter()
            .filter(|f| on_disk.contains_key(f.as_str()))
            .collect();
        for folder in &folders {
            claimed.insert(folder.clone());
        }

        if present.is_empty() {
            // Gone from disk: remove from the tracked set.
            outcome.removed += 1;
            outcome.events.push(AddonUpdateEvent {
                addon: addon.clone(),
                install_state: AddonInstallState::Unknown,
                progress: 0,
            });
            continue;
        }

        let mut changed = false;

        if present.len() < folders.len() && addon.warning_type.is_none() {
            addon.warning_type = Some(AddonWarningType::MissingOnDisk);
            changed = true;
        }

        // The on-disk version marker is ground truth for what is installed.
        if let Some(disk_version) = present
            .iter()
            .find_map(|f| on_disk[f.as_str()].version.clone())
        {
            if disk_version != addon.installed_version {
                addon.installed_version = disk_version;
                changed = true;
            }
        }

        match fetched.get(&addon.id) {
            Some(FetchOutcome::Fresh(result)) => match result.latest_file(addon.channel_type) {
                Some(file) => {
                    if file.version != addon.latest_version {
                        addon.latest_version = file.version.clone();
                        addon.download_url = Some(file.download_url.clone());
                        addon.released_at = file.release_date.or(result.released_at);
                        if !file.dependencies.is_empty() {
                            addon.dependencies = file.dependencies.clone();
                        }
                        changed = true;
                    }
                    if addon.warning_type == Some(AddonWarningType::NoProviderFiles) {
                        addon.warning_type = None;
                        changed = true;
                    }
                }
                None => {
                    if addon.warning_type != Some(AddonWarningType::NoProviderFiles) {
                        addon.warning_type = Some(AddonWarningType::NoProviderFiles);
                        changed = true;
                    }
                }
            },
            // 404: the addon keeps its prior version, no error flag.
            Some(FetchOutcome::NoData) => {}
            Some(FetchOutcome::Failed(err)) => {
                outcome.errored += 1;
                if err.is_circuit_open() {
                    // Provider outage: keep the prior record quiet rather
                    // than flapping user-visible state.
                    debug!(
                        "[SYNC] Breaker open for '{}', keeping prior state of '{}'",
                        addon.provider_name, addon.name
                    );
                } else {
                    warn!("[SYNC] Fetch failed for '{}': {}", addon.name, err);
                    outcome.events.push(AddonUpdateEvent {
                        addon: addon.clone(),
                        install_state: AddonInstallState::Error,
                        progress: 0,
                    });
                }
            }
            Some(FetchOutcome::Skipped) | None => {}
        }

        if changed {
            outcome.updated += 1;
            outcome.events.push(AddonUpdateEvent {
                addon: addon.clone(),
                install_state: AddonInstallState::Complete,
                progress: 100,
            });
        }
        outcome.addons.push(addon);
    }

    // Folders on disk that no stored addon claims are newly discovered;
    // they become pending install candidates, never auto-installed.
    for fingerprint in fingerprints {
        if claimed.contains(&fingerprint.folder_name) {
            continue;
        }
        let addon = Addon::from_fingerprint(installation, fingerprint);
        outcome.added += 1;
        outcome.events.push(AddonUpdateEvent {
            addon: addon.clone(),
            install_state: AddonInstallState::Pending,
            progress: 0,
        });
        outcome.addons.push(addon);
    }

    outcome
}
