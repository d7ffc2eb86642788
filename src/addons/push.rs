//! Debounced refresh on pushed "addon updated" events.
//!
//! The push transport (external, already authenticated and deduplicated)
//! delivers batches of provider addon ids. Bursts are coalesced over a quiet
//! window, the batch is filtered down to ids actually tracked locally, and a
//! targeted sync runs for the affected installations only. Unknown ids
//! trigger no network activity at all.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::AddonStore;
use super::sync::{SyncOptions, SyncOrchestrator};
use super::types::Installation;

/// Default quiet window for coalescing push bursts.
pub const DEFAULT_PUSH_DEBOUNCE_MS: u64 = 5_000;

struct PushInner {
    orchestrator: Arc<SyncOrchestrator>,
    store: Arc<dyn AddonStore>,
    installations: RwLock<Vec<Installation>>,
    window: Duration,
    pending: Mutex<HashSet<String>>,
    generation: AtomicU64,
    superseded: Notify,
}

impl PushInner {
    /// Drains the accumulated batch and refreshes affected installations.
    async fn flush(&self) {
        let batch: Vec<String> = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.drain().collect()
        };
        if batch.is_empty() {
            return;
        }

        let affected = match self.store.installations_with_external_ids(&batch).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("[PUSH] Failed to match pushed ids against store: {}", e);
                return;
            }
        };
        if affected.is_empty() {
            debug!(
                "[PUSH] None of {} pushed id(s) are tracked locally, skipping refresh",
                batch.len()
            );
            return;
        }

        let installations: Vec<Installation> = {
            let known = self
                .installations
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            known
                .iter()
                .filter(|i| affected.contains(&i.id))
                .cloned()
                .collect()
        };

        for installation in installations {
            let cancel = CancellationToken::new();
            match self
                .orchestrator
                .sync(&installation, SyncOptions::default(), &cancel)
                .await
            {
                Ok(result) => info!("[PUSH] Refreshed '{}': {}", installation.id, result),
                Err(e) => warn!("[PUSH] Refresh failed for '{}': {}", installation.id, e),
            }
        }
    }
}

/// Coordinates pushed update notifications into targeted syncs.
#[derive(Clone)]
pub struct PushRefreshCoordinator {
    inner: Arc<PushInner>,
}

impl PushRefreshCoordinator {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        store: Arc<dyn AddonStore>,
        installations: Vec<Installation>,
        window: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PushInner {
                orchestrator,
                store,
                installations: RwLock::new(installations),
                window,
                pending: Mutex::new(HashSet::new()),
                generation: AtomicU64::new(0),
                superseded: Notify::new(),
            }),
        }
    }

    /// Replaces the set of known installations.
    pub fn set_installations(&self, installations: Vec<Installation>) {
        let mut known = self
            .inner
            .installations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *known = installations;
    }

    /// Number of pushed ids waiting for the quiet window to elapse.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Handles one inbound push batch.
    ///
    /// Non-blocking: the batch is accumulated and a debounce timer (re)starts.
    /// Must be called from within a tokio runtime.
    pub fn on_push_event(&self, addon_ids: &[String]) {
        if addon_ids.is_empty() {
            return;
        }

        {
            let mut pending = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for id in addon_ids {
                pending.insert(id.clone());
            }
        }

        // Each burst supersedes the previous timer; only the newest
        // generation flushes after a full quiet window.
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.superseded.notify_waiters();
        debug!(
            "[PUSH] Received {} pushed id(s), waiting {:?} quiet window",
            addon_ids.len(),
            self.inner.window
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(inner.window) => {
                    if inner.generation.load(Ordering::SeqCst) == generation {
                        inner.flush().await;
                    }
                }
                () = inner.superseded.notified() => {
                    // A newer burst restarted the window.
                }
            }
        });
    }
}
