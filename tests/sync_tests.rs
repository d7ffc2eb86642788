//! Integration tests for the sync orchestrator.
//!
//! Exercise reconciliation through the public API with in-memory
//! collaborators: scripted providers, a static scanner and memory/JSON
//! stores.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use addonsync::addons::test_utils::{
    MemoryAddonStore, ScriptedFetch, ScriptedProvider, StaticScanner, make_addon,
    make_installation, make_result,
};
use addonsync::addons::types::AddonFingerprint;
use addonsync::addons::{
    AddonError, AddonEventBus, AddonInstallState, AddonStore, JsonAddonStore, ProviderRegistry,
    SyncOptions, SyncOrchestrator,
};

struct Harness {
    installation: addonsync::addons::Installation,
    provider: Arc<ScriptedProvider>,
    store: Arc<MemoryAddonStore>,
    scanner: Arc<StaticScanner>,
    orchestrator: Arc<SyncOrchestrator>,
    _root: tempfile::TempDir,
}

fn harness(addons: Vec<addonsync::addons::Addon>, folders: &[&str]) -> Harness {
    harness_with_provider(addons, folders, ScriptedProvider::new())
}

fn harness_with_provider(
    addons: Vec<addonsync::addons::Addon>,
    folders: &[&str],
    provider: ScriptedProvider,
) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let installation = make_installation("retail", root.path());

    let provider = Arc::new(provider);
    let store = Arc::new(MemoryAddonStore::seeded(&installation.id, addons));
    let scanner = Arc::new(StaticScanner::new(
        folders
            .iter()
            .map(|f| AddonFingerprint::new(f, None))
            .collect(),
    ));

    let mut providers = ProviderRegistry::new();
    providers.register(provider.clone());

    let orchestrator = Arc::new(SyncOrchestrator::new(
        store.clone(),
        scanner.clone(),
        Arc::new(providers),
        AddonEventBus::new(),
    ));

    Harness {
        installation,
        provider,
        store,
        scanner,
        orchestrator,
        _root: root,
    }
}

#[tokio::test]
async fn test_update_available_flags_only_changed_addon() {
    let a = make_addon("retail", "AddonA", "1.0");
    let b = make_addon("retail", "AddonB", "1.0");
    let b_ext = b.external_id.clone();
    let b_id = b.id.clone();

    let h = harness(vec![a.clone(), b], &["AddonA", "AddonB"]);
    h.provider.respond(&a.external_id, ScriptedFetch::Latest(make_result("1.0")));
    h.provider.respond(&b_ext, ScriptedFetch::Latest(make_result("2.0")));

    let mut events = h.orchestrator.events().subscribe();
    let cancel = CancellationToken::new();
    let result = h
        .orchestrator
        .sync(&h.installation, SyncOptions::default(), &cancel)
        .await
        .unwrap();

    assert_eq!(result.updated, 1);
    assert_eq!(result.added, 0);
    assert_eq!(result.removed, 0);
    assert_eq!(result.errored, 0);

    // Exactly one event, for B, now flagged update-available.
    let event = events.try_recv().unwrap();
    assert_eq!(event.addon.id, b_id);
    assert!(event.addon.is_update_available());
    assert!(events.try_recv().is_err());

    let stored = h.store.get_addons("retail").await.unwrap();
    let stored_b = stored.iter().find(|x| x.id == b_id).unwrap();
    assert_eq!(stored_b.latest_version, "2.0");
    assert_eq!(stored_b.installed_version, "1.0");
}

#[tokio::test]
async fn test_404_leaves_addon_untouched() {
    let c = make_addon("retail", "AddonC", "1.0");
    let c_id = c.id.clone();

    let h = harness(vec![c], &["AddonC"]);
    // No scripted response: the provider reports no data (the 404 case).

    let cancel = CancellationToken::new();
    let result = h
        .orchestrator
        .sync(&h.installation, SyncOptions::default(), &cancel)
        .await
        .unwrap();

    assert_eq!(result.errored, 0);
    assert_eq!(result.updated, 0);

    let stored = h.store.get_addons("retail").await.unwrap();
    let stored_c = stored.iter().find(|x| x.id == c_id).unwrap();
    assert_eq!(stored_c.latest_version, "1.0");
    assert!(stored_c.warning_type.is_none());
}

#[tokio::test]
async fn test_provider_failure_is_contained_per_addon() {
    let ok = make_addon("retail", "GoodAddon", "1.0");
    let bad = make_addon("retail", "BadAddon", "1.0");
    let ok_ext = ok.external_id.clone();
    let bad_ext = bad.external_id.clone();
    let ok_id = ok.id.clone();

    let h = harness(vec![ok, bad], &["GoodAddon", "BadAddon"]);
    h.provider.respond(&ok_ext, ScriptedFetch::Latest(make_result("3.0")));
    h.provider
        .respond(&bad_ext, ScriptedFetch::Fail("boom".to_string()));

    let cancel = CancellationToken::new();
    let result = h
        .orchestrator
        .sync(&h.installation, SyncOptions::default(), &cancel)
        .await
        .unwrap();

    // One addon failed, but the sync as a whole succeeded and the other
    // addon still got its update.
    assert_eq!(result.errored, 1);
    assert_eq!(result.updated, 1);

    let stored = h.store.get_addons("retail").await.unwrap();
    assert_eq!(
        stored.iter().find(|x| x.id == ok_id).unwrap().latest_version,
        "3.0"
    );
}

#[tokio::test]
async fn test_breaker_open_preserves_prior_state() {
    let addon = make_addon("retail", "QuietAddon", "1.0");
    let ext = addon.external_id.clone();
    let id = addon.id.clone();

    let h = harness(vec![addon], &["QuietAddon"]);
    h.provider.respond(&ext, ScriptedFetch::CircuitOpen);

    let mut events = h.orchestrator.events().subscribe();
    let cancel = CancellationToken::new();
    let result = h
        .orchestrator
        .sync(&h.installation, SyncOptions::default(), &cancel)
        .await
        .unwrap();

    // Counted in the aggregate, but no user-visible error state.
    assert_eq!(result.errored, 1);
    assert!(events.try_recv().is_err());

    let stored = h.store.get_addons("retail").await.unwrap();
    let quiet = stored.iter().find(|x| x.id == id).unwrap();
    assert_eq!(quiet.installed_version, "1.0");
    assert!(quiet.warning_type.is_none());
}

#[tokio::test]
async fn test_new_folder_becomes_pending_candidate() {
    let h = harness(Vec::new(), &["FreshFolder"]);

    let mut events = h.orchestrator.events().subscribe();
    let cancel = CancellationToken::new();
    let result = h
        .orchestrator
        .sync(&h.installation, SyncOptions::default(), &cancel)
        .await
        .unwrap();

    assert_eq!(result.added, 1);
    let event = events.try_recv().unwrap();
    assert_eq!(event.install_state, AddonInstallState::Pending);

    // Discovered, but never auto-installed: no provider calls happened.
    assert_eq!(h.provider.fetch_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_orphaned_folder_removed_from_set() {
    let gone = make_addon("retail", "GoneAddon", "1.0");
    let h = harness(vec![gone], &[]);

    let cancel = CancellationToken::new();
    let result = h
        .orchestrator
        .sync(&h.installation, SyncOptions::default(), &cancel)
        .await
        .unwrap();

    assert_eq!(result.removed, 1);
    assert!(h.store.get_addons("retail").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_disabled_provider_is_skipped_entirely() {
    let addon = make_addon("retail", "AddonA", "1.0");
    let ext = addon.external_id.clone();

    let root = tempfile::tempdir().unwrap();
    let installation = make_installation("retail", root.path());
    let provider = Arc::new(ScriptedProvider::new());
    provider.respond(&ext, ScriptedFetch::Latest(make_result("2.0")));

    let store = Arc::new(MemoryAddonStore::seeded("retail", vec![addon]));
    let scanner = Arc::new(StaticScanner::new(vec![AddonFingerprint::new(
        "AddonA", None,
    )]));

    let mut providers = ProviderRegistry::new();
    providers.register(provider.clone());
    providers.set_enabled("scripted", false);

    let orchestrator = Arc::new(SyncOrchestrator::new(
        store.clone(),
        scanner,
        Arc::new(providers),
        AddonEventBus::new(),
    ));

    let cancel = CancellationToken::new();
    let result = orchestrator
        .sync(&installation, SyncOptions::default(), &cancel)
        .await
        .unwrap();

    assert_eq!(provider.fetch_calls.load(Ordering::SeqCst), 0);
    assert_eq!(result.updated, 0);
    assert_eq!(result.errored, 0);
}

#[tokio::test]
async fn test_concurrent_syncs_coalesce() {
    let addon = make_addon("retail", "SlowAddon", "1.0");
    let ext = addon.external_id.clone();

    let provider = ScriptedProvider::new().with_delay(Duration::from_millis(200));
    let h = harness_with_provider(vec![addon], &["SlowAddon"], provider);
    h.provider.respond(&ext, ScriptedFetch::Latest(make_result("2.0")));

    let cancel = CancellationToken::new();
    let first = {
        let orchestrator = Arc::clone(&h.orchestrator);
        let installation = h.installation.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            orchestrator
                .sync(&installation, SyncOptions::default(), &cancel)
                .await
        })
    };

    // Give the first sync time to claim the slot and start fetching.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = h
        .orchestrator
        .sync(&h.installation, SyncOptions::default(), &cancel)
        .await
        .unwrap();
    assert!(second.coalesced);
    assert_eq!(second.changed(), 0);

    let first = first.await.unwrap().unwrap();
    assert!(!first.coalesced);
    assert_eq!(first.updated, 1);

    // Exactly one reconciliation hit the store and the provider.
    assert_eq!(h.provider.fetch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.replace_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_sync_leaves_persisted_bytes_unchanged() {
    let addon = make_addon("retail", "SlowAddon", "1.0");
    let ext = addon.external_id.clone();

    let root = tempfile::tempdir().unwrap();
    let installation = make_installation("retail", root.path());

    // Real JSON store so we can compare raw document bytes.
    let store_dir = root.path().join("store");
    let store = Arc::new(JsonAddonStore::new(store_dir.clone()));
    store.replace_addons("retail", &[addon]).await.unwrap();
    let before = std::fs::read(store_dir.join("retail.json")).unwrap();

    let provider = Arc::new(ScriptedProvider::new().with_delay(Duration::from_millis(500)));
    provider.respond(&ext, ScriptedFetch::Latest(make_result("9.9")));

    let mut providers = ProviderRegistry::new();
    providers.register(provider.clone());

    let scanner = Arc::new(StaticScanner::new(vec![AddonFingerprint::new(
        "SlowAddon",
        None,
    )]));
    let orchestrator = Arc::new(SyncOrchestrator::new(
        store.clone(),
        scanner,
        Arc::new(providers),
        AddonEventBus::new(),
    ));

    let cancel = CancellationToken::new();
    let task = {
        let orchestrator = Arc::clone(&orchestrator);
        let installation = installation.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            orchestrator
                .sync(&installation, SyncOptions::default(), &cancel)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(AddonError::SyncCancelled)));

    let after = std::fs::read(store_dir.join("retail.json")).unwrap();
    assert_eq!(before, after, "cancelled sync must not persist anything");

    // The guard was released: a fresh sync succeeds afterwards.
    let fresh = CancellationToken::new();
    let result = orchestrator
        .sync(&installation, SyncOptions::default(), &fresh)
        .await
        .unwrap();
    assert!(!result.coalesced);
    assert_eq!(result.updated, 1);
}

#[tokio::test]
async fn test_rescan_option_controls_scanner_calls() {
    let h = harness(Vec::new(), &["AddonA"]);
    let cancel = CancellationToken::new();

    let _ = h
        .orchestrator
        .sync(&h.installation, SyncOptions::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(h.scanner.scan_calls.load(Ordering::SeqCst), 1);

    // Without rescan, the cached fingerprint set is reused.
    let _ = h
        .orchestrator
        .sync(&h.installation, SyncOptions::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(h.scanner.scan_calls.load(Ordering::SeqCst), 1);

    let _ = h
        .orchestrator
        .sync(&h.installation, SyncOptions { rescan: true }, &cancel)
        .await
        .unwrap();
    assert_eq!(h.scanner.scan_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_auto_update_candidates_filtering() {
    let mut eligible = make_addon("retail", "AutoAddon", "1.0");
    eligible.auto_update_enabled = true;
    eligible.latest_version = "2.0".to_string();

    let mut ignored = make_addon("retail", "IgnoredAddon", "1.0");
    ignored.auto_update_enabled = true;
    ignored.latest_version = "2.0".to_string();
    ignored.is_ignored = true;

    let mut current = make_addon("retail", "CurrentAddon", "1.0");
    current.auto_update_enabled = true;

    let h = harness(vec![eligible.clone(), ignored, current], &[]);

    let candidates = h
        .orchestrator
        .auto_update_candidates(&h.installation)
        .await
        .unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].id, eligible.id);
}
