//! Addon synchronization and update engine.
//!
//! Tracks the addons of every configured game installation, reconciles them
//! against content-provider metadata, drives installs/updates through a
//! lifecycle state machine, and reacts to pushed update notifications.
//!
//! - **types**: data model (installations, addons, states, events)
//! - **store**: persisted addon set, one document per installation
//! - **scan**: on-disk addon fingerprints (ground truth for "is installed")
//! - **provider**: content-provider gateway contract and registry
//! - **sync**: per-installation reconciliation orchestrator
//! - **lifecycle**: install/update/remove state machine
//! - **push**: debounced refresh on pushed "addon updated" events

pub mod events;
pub mod lifecycle;
pub mod provider;
pub mod providers;
pub mod push;
pub mod scan;
pub mod store;
pub mod sync;
pub mod test_utils;
pub mod types;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::net::NetError;

pub use events::AddonEventBus;
pub use lifecycle::{AddonLifecycle, HttpPackageFetcher, PackageFetcher};
pub use provider::{AddonProvider, AddonSearchResult, AddonSearchResultFile, ProviderRegistry};
pub use push::PushRefreshCoordinator;
pub use scan::{AddonScanner, DirScanner};
pub use store::{AddonStore, JsonAddonStore};
pub use sync::{SyncOptions, SyncOrchestrator};
pub use types::{
    Addon, AddonFingerprint, AddonInstallState, AddonUpdateEvent, AddonWarningType, ChannelType,
    ClientVariant, ExternalId, Installation, SyncResult,
};

/// Addon engine error types.
#[derive(Debug, Error)]
pub enum AddonError {
    /// Network-layer failure, including circuit-open and timeout.
    #[error("Network error: {0}")]
    Net(#[from] NetError),

    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A lifecycle operation is already running for this addon.
    #[error("Operation already in progress for addon '{0}'")]
    OperationInProgress(String),

    /// Local and provider state diverged irreconcilably.
    #[error("Local and provider state conflict for addon '{0}'")]
    ReconciliationConflict(String),

    /// The sync was cancelled; no state was persisted.
    #[error("Sync cancelled")]
    SyncCancelled,

    /// Persisted store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Provider-specific failure.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Archive could not be read or extracted.
    #[error("Archive error: {0}")]
    Archive(String),

    /// Addon id not present in the store.
    #[error("Addon not found: {0}")]
    NotFound(String),
}

impl AddonError {
    /// Returns true when the failure is the provider's breaker being open.
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, AddonError::Net(NetError::CircuitOpen(_)))
    }
}

/// Returns the path to the addonsync data directory.
#[must_use]
pub fn addonsync_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".addonsync"))
}

/// Returns the path to the persisted addon store directory.
#[must_use]
pub fn store_dir() -> Option<PathBuf> {
    addonsync_dir().map(|d| d.join("store"))
}

/// Returns the path to the download/backup working directory.
#[must_use]
pub fn work_dir() -> Option<PathBuf> {
    addonsync_dir().map(|d| d.join("cache"))
}

/// Ensures all engine directories exist.
pub fn ensure_directories() -> io::Result<()> {
    if let Some(store) = store_dir() {
        std::fs::create_dir_all(&store)?;
    }
    if let Some(work) = work_dir() {
        std::fs::create_dir_all(&work)?;
    }
    Ok(())
}
