//! Content-provider gateway contract.
//!
//! Every provider adapter normalizes its HTTP API into [`AddonSearchResult`]
//! values and goes through its own client/breaker pair, so one provider's
//! outage never blocks the others. The [`ProviderRegistry`] owns the
//! adapters and the per-provider enabled flags from configuration.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::AddonError;
use super::types::{Addon, ChannelType, Installation};

/// Normalized addon metadata returned by a provider.
#[derive(Debug, Clone, Default)]
pub struct AddonSearchResult {
    /// Provider that produced the result.
    pub provider_name: String,
    /// The provider's own id for the addon.
    pub external_id: String,
    /// Display name.
    pub name: String,
    /// Author.
    pub author: String,
    /// Provider page for the addon.
    pub external_url: String,
    /// Short description.
    pub summary: Option<String>,
    /// Thumbnail image URL.
    pub thumbnail_url: Option<String>,
    /// Total downloads, if the provider reports it.
    pub download_count: Option<u64>,
    /// Unix timestamp of the latest release.
    pub released_at: Option<u64>,
    /// Changelog of the latest release.
    pub changelog: Option<String>,
    /// Downloadable files, newest first.
    pub files: Vec<AddonSearchResultFile>,
}

impl AddonSearchResult {
    /// Returns the newest file on the requested channel, falling back to the
    /// newest file of any channel.
    #[must_use]
    pub fn latest_file(&self, channel: ChannelType) -> Option<&AddonSearchResultFile> {
        self.files
            .iter()
            .find(|f| f.channel_type == channel)
            .or_else(|| self.files.first())
    }
}

/// One downloadable file of an addon.
#[derive(Debug, Clone, Default)]
pub struct AddonSearchResultFile {
    /// File version string.
    pub version: String,
    /// Archive download URL.
    pub download_url: String,
    /// Unix timestamp of the release.
    pub release_date: Option<u64>,
    /// Release channel.
    pub channel_type: ChannelType,
    /// Game versions the file supports.
    pub game_versions: Vec<String>,
    /// Addon ids this file depends on.
    pub dependencies: Vec<String>,
}

/// Gateway contract implemented per content provider.
#[async_trait]
pub trait AddonProvider: Send + Sync {
    /// Provider name, also the breaker key.
    fn name(&self) -> &str;

    /// Fetches the latest metadata for a tracked addon.
    ///
    /// Returns `Ok(None)` when the provider has no data for the addon (the
    /// HTTP 404 case); that is not an error and must not flag the addon.
    async fn get_latest(
        &self,
        installation: &Installation,
        addon: &Addon,
    ) -> Result<Option<AddonSearchResult>, AddonError>;

    /// Searches the provider's catalog.
    async fn search(
        &self,
        installation: &Installation,
        term: &str,
    ) -> Result<Vec<AddonSearchResult>, AddonError>;

    /// Fetches the changelog for a tracked addon, if the provider has one.
    async fn get_changelog(
        &self,
        installation: &Installation,
        addon: &Addon,
    ) -> Result<Option<String>, AddonError>;
}

/// Registry of provider adapters and their enabled flags.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn AddonProvider>>,
    enabled: HashMap<String, bool>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider adapter. Providers are enabled unless
    /// configuration disables them.
    pub fn register(&mut self, provider: Arc<dyn AddonProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Sets the enabled flag for a provider.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) {
        self.enabled.insert(name.to_string(), enabled);
    }

    /// Applies per-provider enabled flags from configuration.
    pub fn apply_flags(&mut self, flags: &HashMap<String, bool>) {
        for (name, enabled) in flags {
            self.enabled.insert(name.clone(), *enabled);
        }
    }

    /// Returns true if the provider is registered and not disabled.
    #[must_use]
    pub fn is_enabled(&self, name: &str) -> bool {
        self.providers.contains_key(name) && *self.enabled.get(name).unwrap_or(&true)
    }

    /// Returns the provider if it is registered and enabled.
    #[must_use]
    pub fn get_enabled(&self, name: &str) -> Option<Arc<dyn AddonProvider>> {
        if !self.is_enabled(name) {
            return None;
        }
        self.providers.get(name).map(Arc::clone)
    }

    /// Returns all enabled providers.
    #[must_use]
    pub fn enabled_providers(&self) -> Vec<Arc<dyn AddonProvider>> {
        let mut providers: Vec<_> = self
            .providers
            .iter()
            .filter(|(name, _)| self.is_enabled(name))
            .map(|(_, p)| Arc::clone(p))
            .collect();
        providers.sort_by(|a, b| a.name().cmp(b.name()));
        providers
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    struct NullProvider {
        name: String,
    }

    #[async_trait]
    impl AddonProvider for NullProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn get_latest(
            &self,
            _installation: &Installation,
            _addon: &Addon,
        ) -> Result<Option<AddonSearchResult>, AddonError> {
            Ok(None)
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

    fn registry_with(names: &[&str]) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        for name in names {
            registry.register(Arc::new(NullProvider {
                name: (*name).to_string(),
            }));
        }
        registry
    }

    #[test]
    fn test_unknown_provider_is_disabled() {
        let registry = registry_with(&["github"]);
        assert!(!registry.is_enabled("curse"));
        assert!(registry.get_enabled("curse").is_none());
    }

    #[test]
    fn test_registered_provider_enabled_by_default() {
        let registry = registry_with(&["github"]);
        assert!(registry.is_enabled("github"));
        assert!(registry.get_enabled("github").is_some());
    }

    #[test]
    fn test_disable_via_flags() {
        let mut registry = registry_with(&["github", "tukui"]);
        let mut flags = HashMap::new();
        flags.insert("github".to_string(), false);
        registry.apply_flags(&flags);

        assert!(!registry.is_enabled("github"));
        assert!(registry.is_enabled("tukui"));
        assert_eq!(registry.enabled_providers().len(), 1);
    }

    #[test]
    fn test_latest_file_channel_preference() {
        let result = AddonSearchResult {
            files: vec![
                AddonSearchResultFile {
                    version: "2.0-beta".to_string(),
                    channel_type: ChannelType::Beta,
                    ..AddonSearchResultFile::default()
                },
                AddonSearchResultFile {
                    version: "1.9".to_string(),
                    channel_type: ChannelType::Stable,
                    ..AddonSearchResultFile::default()
                },
            ],
            ..AddonSearchResult::default()
        };

        assert_eq!(result.latest_file(ChannelType::Stable).unwrap().version, "1.9");
        assert_eq!(
            result.latest_file(ChannelType::Beta).unwrap().version,
            "2.0-beta"
        );
        // Unrepresented channel falls back to the newest file.
        assert_eq!(
            result.latest_file(ChannelType::Alpha).unwrap().version,
            "2.0-beta"
        );
    }
}
