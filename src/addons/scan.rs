//! On-disk addon scanning.
//!
//! Produces the fingerprint set the orchestrator treats as ground truth for
//! "is installed": one fingerprint per folder under the installation's
//! addons directory, with the version marker read from the folder's `.toc`
//! metadata file when present.

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use super::AddonError;
use super::types::{AddonFingerprint, Installation};

/// Scanner contract; the default implementation walks the filesystem.
#[async_trait]
pub trait AddonScanner: Send + Sync {
    /// Returns the on-disk fingerprints for an installation.
    async fn scan(&self, installation: &Installation) -> Result<Vec<AddonFingerprint>, AddonError>;
}

/// Extracts the `## Version:` marker from `.toc` file contents.
///
/// Markers are `## Key: Value` lines; the key comparison is
/// case-insensitive and an empty value counts as absent.
#[must_use]
pub fn parse_version_marker(contents: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("##")?;
        let (key, value) = rest.split_once(':')?;
        if !key.trim().eq_ignore_ascii_case("version") {
            return None;
        }
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Reads the version marker for one addon folder.
///
/// Prefers `<Folder>/<Folder>.toc`, falling back to the first `.toc` file
/// found in the folder.
async fn read_folder_version(folder: &Path) -> Option<String> {
    let folder_name = folder.file_name()?.to_str()?.to_string();
    let preferred = folder.join(format!("{folder_name}.toc"));

    if let Ok(contents) = tokio::fs::read_to_string(&preferred).await {
        if let Some(version) = parse_version_marker(&contents) {
            return Some(version);
        }
    }

    let mut entries = tokio::fs::read_dir(folder).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("toc") {
            continue;
        }
        if let Ok(contents) = tokio::fs::read_to_string(&path).await {
            if let Some(version) = parse_version_marker(&contents) {
                return Some(version);
            }
        }
    }
    None
}

/// Filesystem scanner over the installation's addons directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirScanner;

impl DirScanner {
    /// Creates a new scanner.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AddonScanner for DirScanner {
    async fn scan(&self, installation: &Installation) -> Result<Vec<AddonFingerprint>, AddonError> {
        let addons_dir = installation.addons_dir();
        let mut fingerprints = Vec::new();

        let mut entries = match tokio::fs::read_dir(&addons_dir).await {
            Ok(entries) => entries,
            // A fresh installation has no addons directory yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(fingerprints),
            Err(e) => return Err(AddonError::Io(e)),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(folder_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            let version = read_folder_version(&path).await;
            fingerprints.push(AddonFingerprint {
                folder_name: folder_name.to_string(),
                version,
            });
        }

        fingerprints.sort_by(|a, b| a.folder_name.cmp(&b.folder_name));
        debug!(
            "[SCAN] Found {} addon folder(s) in '{}'",
            fingerprints.len(),
            addons_dir.display()
        );
        Ok(fingerprints)
    }
}
