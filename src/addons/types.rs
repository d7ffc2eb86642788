//! Addon type definitions.
//!
//! Core data structures shared by the store, the sync orchestrator, the
//! lifecycle machine and the push coordinator.

use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Returns the current Unix timestamp in seconds.
#[must_use]
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Game client variant an installation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientVariant {
    /// Current mainline client.
    Retail,
    /// Classic progression client.
    Classic,
    /// Classic era (non-progressing) client.
    ClassicEra,
    /// Public test realm client.
    Ptr,
    /// Beta client.
    Beta,
}

impl fmt::Display for ClientVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientVariant::Retail => write!(f, "retail"),
            ClientVariant::Classic => write!(f, "classic"),
            ClientVariant::ClassicEra => write!(f, "classic_era"),
            ClientVariant::Ptr => write!(f, "ptr"),
            ClientVariant::Beta => write!(f, "beta"),
        }
    }
}

/// One discovered game installation that can host addons.
///
/// Immutable once discovered; the set of installations comes from the
/// configuration file (discovery itself is an external concern).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installation {
    /// Stable installation id.
    pub id: String,
    /// Human-readable label.
    pub label: String,
    /// Client variant.
    pub client_variant: ClientVariant,
    /// Filesystem root of the installation.
    pub root_dir: PathBuf,
}

impl Installation {
    /// Creates a new installation.
    #[must_use]
    pub fn new(id: &str, label: &str, client_variant: ClientVariant, root_dir: PathBuf) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            client_variant,
            root_dir,
        }
    }

    /// Returns the directory scanned for installed addons.
    #[must_use]
    pub fn addons_dir(&self) -> PathBuf {
        self.root_dir.join("Interface").join("AddOns")
    }
}

/// Release channel of an addon file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    /// Stable releases.
    #[default]
    Stable,
    /// Beta releases.
    Beta,
    /// Alpha releases.
    Alpha,
}

/// Install/update progress stage of a single addon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddonInstallState {
    /// No operation known for this addon.
    Unknown,
    /// Queued for install/update.
    Pending,
    /// Archive download in progress.
    Downloading,
    /// Existing folders being backed up before replacement.
    BackingUp,
    /// Archive extraction in progress.
    Installing,
    /// Operation finished successfully.
    Complete,
    /// Operation failed.
    Error,
}

impl AddonInstallState {
    /// Returns true for states no further transition leaves automatically.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, AddonInstallState::Complete | AddonInstallState::Error)
    }
}

impl fmt::Display for AddonInstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddonInstallState::Unknown => write!(f, "unknown"),
            AddonInstallState::Pending => write!(f, "pending"),
            AddonInstallState::Downloading => write!(f, "downloading"),
            AddonInstallState::BackingUp => write!(f, "backing up"),
            AddonInstallState::Installing => write!(f, "installing"),
            AddonInstallState::Complete => write!(f, "complete"),
            AddonInstallState::Error => write!(f, "error"),
        }
    }
}

/// Warning set when local and provider state diverge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddonWarningType {
    /// Some of the addon's folders are missing from disk.
    MissingOnDisk,
    /// The provider reported no usable file for this addon.
    NoProviderFiles,
}

/// Cross-provider identity link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalId {
    /// Provider that owns the id.
    pub provider_name: String,
    /// The provider's own id for the addon.
    pub id: String,
}

/// One tracked addon, owned by exactly one installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Addon {
    /// Stable addon id (stable across syncs).
    pub id: String,
    /// Owning installation id.
    pub installation_id: String,
    /// Provider that serves this addon; empty for unmatched on-disk folders.
    #[serde(default)]
    pub provider_name: String,
    /// The provider's own id for the addon.
    #[serde(default)]
    pub external_id: String,
    /// Display name.
    pub name: String,
    /// Author, as reported by the provider.
    #[serde(default)]
    pub author: String,
    /// Version currently on disk.
    #[serde(default)]
    pub installed_version: String,
    /// Newest version the provider reported.
    #[serde(default)]
    pub latest_version: String,
    /// Unix timestamp of the last completed install.
    #[serde(default)]
    pub installed_at: u64,
    /// Unix timestamp the latest version was released.
    #[serde(default)]
    pub released_at: Option<u64>,
    /// Release channel tracked for this addon.
    #[serde(default)]
    pub channel_type: ChannelType,
    /// Ignored addons are skipped during sync.
    #[serde(default)]
    pub is_ignored: bool,
    /// Whether updates are applied automatically after a sync.
    #[serde(default)]
    pub auto_update_enabled: bool,
    /// Whether auto-updates raise a notification.
    #[serde(default)]
    pub auto_update_notifications_enabled: bool,
    /// Set when local state is inconsistent with the provider.
    #[serde(default)]
    pub warning_type: Option<AddonWarningType>,
    /// Download URL of the latest file.
    #[serde(default)]
    pub download_url: Option<String>,
    /// Ids of addons this addon depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Cross-provider identity links.
    #[serde(default)]
    pub external_ids: Vec<ExternalId>,
    /// On-disk folders owned by this addon.
    #[serde(default)]
    pub folder_names: Vec<String>,
}

impl Addon {
    /// Creates a new addon record for an installation.
    #[must_use]
    pub fn new(installation_id: &str, provider_name: &str, external_id: &str, name: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            installation_id: installation_id.to_string(),
            provider_name: provider_name.to_string(),
            external_id: external_id.to_string(),
            name: name.to_string(),
            author: String::new(),
            installed_version: String::new(),
            latest_version: String::new(),
            installed_at: unix_now(),
            released_at: None,
            channel_type: ChannelType::Stable,
            is_ignored: false,
            auto_update_enabled: false,
            auto_update_notifications_enabled: false,
            warning_type: None,
            download_url: None,
            dependencies: Vec::new(),
            external_ids: Vec::new(),
            folder_names: Vec::new(),
        }
    }

    /// Creates an addon record for a folder discovered on disk that no
    /// stored addon claims. The record has no provider until the user links
    /// one through an explicit install.
    #[must_use]
    pub fn from_fingerprint(installation: &Installation, fingerprint: &AddonFingerprint) -> Self {
        let mut addon = Self::new(&installation.id, "", "", &fingerprint.folder_name);
        addon.installed_version = fingerprint.version.clone().unwrap_or_default();
        addon.folder_names = vec![fingerprint.folder_name.clone()];
        addon
    }

    /// Returns true when the provider reported a version differing from the
    /// one on disk.
    #[must_use]
    pub fn is_update_available(&self) -> bool {
        !self.latest_version.is_empty() && self.latest_version != self.installed_version
    }

    /// Returns true if any of the given provider ids identifies this addon.
    #[must_use]
    pub fn has_external_id(&self, id: &str) -> bool {
        self.external_id == id || self.external_ids.iter().any(|e| e.id == id)
    }

    /// Returns the folders this addon occupies on disk, falling back to the
    /// addon name for records that have never been installed.
    #[must_use]
    pub fn known_folders(&self) -> Vec<String> {
        if self.folder_names.is_empty() {
            vec![self.name.clone()]
        } else {
            self.folder_names.clone()
        }
    }
}

/// On-disk fingerprint of one addon folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonFingerprint {
    /// Folder name under the installation's addons directory.
    pub folder_name: String,
    /// Version marker read from the folder's metadata file, if any.
    pub version: Option<String>,
}

impl AddonFingerprint {
    /// Creates a fingerprint.
    #[must_use]
    pub fn new(folder_name: &str, version: Option<&str>) -> Self {
        Self {
            folder_name: folder_name.to_string(),
            version: version.map(str::to_string),
        }
    }
}

/// Event emitted on every addon state change.
#[derive(Debug, Clone)]
pub struct AddonUpdateEvent {
    /// Snapshot of the addon at the time of the transition.
    pub addon: Addon,
    /// The install state entered.
    pub install_state: AddonInstallState,
    /// Progress percentage for the overall operation.
    pub progress: u8,
}

/// Per-installation sync outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResult {
    /// Installation this result belongs to.
    pub installation_id: String,
    /// True when another sync was already in flight and this call was a no-op.
    pub coalesced: bool,
    /// Newly discovered addons.
    pub added: usize,
    /// Addons whose record changed.
    pub updated: usize,
    /// Addons removed because their folders left the disk.
    pub removed: usize,
    /// Addons whose provider fetch failed.
    pub errored: usize,
}

impl SyncResult {
    /// Creates an empty result for an installation.
    #[must_use]
    pub fn new(installation_id: &str) -> Self {
        Self {
            installation_id: installation_id.to_string(),
            ..Self::default()
        }
    }

    /// Creates the no-op result returned to coalesced callers.
    #[must_use]
    pub fn coalesced(installation_id: &str) -> Self {
        Self {
            installation_id: installation_id.to_string(),
            coalesced: true,
            ..Self::default()
        }
    }

    /// Total number of addons the sync changed.
    #[must_use]
    pub fn changed(&self) -> usize {
        self.added + self.updated + self.removed
    }
}

impl fmt::Display for SyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.coalesced {
            write!(f, "coalesced (sync already in flight)")
        } else {
            write!(
                f,
                "{} added, {} updated, {} removed, {} errored",
                self.added, self.updated, self.removed, self.errored
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addons_dir() {
        let installation = Installation::new(
            "retail",
            "Retail",
            ClientVariant::Retail,
            PathBuf::from("/games/wow"),
        );
        assert_eq!(
            installation.addons_dir(),
            PathBuf::from("/games/wow/Interface/AddOns")
        );
    }

    #[test]
    fn test_addon_new_has_unique_id() {
        let a = Addon::new("retail", "github", "owner/repo", "Bagger");
        let b = Addon::new("retail", "github", "owner/repo", "Bagger");
        assert_ne!(a.id, b.id);
        assert_eq!(a.name, "Bagger");
        assert!(a.installed_at > 0);
    }

    #[test]
    fn test_update_available() {
        let mut addon = Addon::new("retail", "github", "owner/repo", "Bagger");
        assert!(!addon.is_update_available());

        addon.installed_version = "1.0".to_string();
        addon.latest_version = "1.0".to_string();
        assert!(!addon.is_update_available());

        addon.latest_version = "2.0".to_string();
        assert!(addon.is_update_available());
    }

    #[test]
    fn test_has_external_id() {
        let mut addon = Addon::new("retail", "github", "owner/repo", "Bagger");
        addon.external_ids.push(ExternalId {
            provider_name: "curse".to_string(),
            id: "12345".to_string(),
        });

        assert!(addon.has_external_id("owner/repo"));
        assert!(addon.has_external_id("12345"));
        assert!(!addon.has_external_id("99999"));
    }

    #[test]
    fn test_from_fingerprint() {
        let installation = Installation::new(
            "retail",
            "Retail",
            ClientVariant::Retail,
            PathBuf::from("/games/wow"),
        );
        let fingerprint = AddonFingerprint::new("Bagger", Some("1.2"));
        let addon = Addon::from_fingerprint(&installation, &fingerprint);

        assert_eq!(addon.installation_id, "retail");
        assert_eq!(addon.installed_version, "1.2");
        assert_eq!(addon.folder_names, vec!["Bagger".to_string()]);
        assert!(addon.provider_name.is_empty());
    }

    #[test]
    fn test_known_folders_fallback() {
        let addon = Addon::new("retail", "github", "owner/repo", "Bagger");
        assert_eq!(addon.known_folders(), vec!["Bagger".to_string()]);
    }

    #[test]
    fn test_terminal_states() {
        assert!(AddonInstallState::Complete.is_terminal());
        assert!(AddonInstallState::Error.is_terminal());
        assert!(!AddonInstallState::Downloading.is_terminal());
        assert!(!AddonInstallState::Pending.is_terminal());
    }

    #[test]
    fn test_sync_result_display() {
        let mut result = SyncResult::new("retail");
        result.added = 1;
        result.updated = 2;
        assert_eq!(
            result.to_string(),
            "1 added, 2 updated, 0 removed, 0 errored"
        );
        assert_eq!(result.changed(), 3);

        let coalesced = SyncResult::coalesced("retail");
        assert!(coalesced.to_string().contains("coalesced"));
    }
}
