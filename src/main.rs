//! Addonsync - Main entry point.
//!
//! Keeps configured game installations' add-ons in sync with their content
//! providers.
//!
//! Usage: addonsync [OPTIONS]
//!
//! Options:
//!   --version, -v     Show version
//!   --config <path>   Use an explicit config file
//!   --rescan          Re-derive the on-disk addon set before reconciling
//!   --search <term>   Search enabled providers instead of syncing
//!   --no-auto-update  Skip applying auto-update candidates after the sync

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use addonsync::VERSION;
use addonsync::addons::providers::GithubAddonProvider;
use addonsync::addons::{
    self, AddonEventBus, AddonLifecycle, DirScanner, HttpPackageFetcher, JsonAddonStore,
    ProviderRegistry, SyncOptions, SyncOrchestrator,
};
use addonsync::config::Config;
use addonsync::logging::{self, LogConfig};
use addonsync::net::BreakerRegistry;

/// Parsed command-line options.
struct CliOptions {
    config_path: Option<PathBuf>,
    rescan: bool,
    search: Option<String>,
    auto_update: bool,
}

/// Parses arguments by hand; anything unknown prints usage and exits.
fn parse_args(args: &[String]) -> Result<Option<CliOptions>, String> {
    let mut options = CliOptions {
        config_path: None,
        rescan: false,
        search: None,
        auto_update: true,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--version" | "-v" => return Ok(None),
            "--rescan" => options.rescan = true,
            "--no-auto-update" => options.auto_update = false,
            "--config" => {
                i += 1;
                let value = args.get(i).ok_or("--config requires a path")?;
                options.config_path = Some(PathBuf::from(value));
            }
            "--search" => {
                i += 1;
                let value = args.get(i).ok_or("--search requires a term")?;
                options.search = Some(value.clone());
            }
            other => return Err(format!("Unknown option: {other}")),
        }
        i += 1;
    }

    Ok(Some(options))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let options = match parse_args(&args) {
        Ok(Some(options)) => options,
        Ok(None) => {
            println!("addonsync v{}", VERSION);
            return ExitCode::SUCCESS;
        }
        Err(message) => {
            eprintln!("{message}");
            eprintln!("Usage: addonsync [--version] [--config <path>] [--rescan] [--search <term>] [--no-auto-update]");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = match logging::init(&LogConfig::default()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    match run(options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("addonsync failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(options: CliOptions) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = options
        .config_path
        .or_else(Config::default_path)
        .ok_or("Could not determine the config file path")?;
    let config = Config::load_or_default(&config_path);
    info!("Loaded configuration from '{}'", config_path.display());

    addons::ensure_directories()?;
    let store_dir = addons::store_dir().ok_or("Could not determine the store directory")?;
    let work_dir = addons::work_dir().ok_or("Could not determine the cache directory")?;

    // Wire the engine: one breaker per provider, explicit construction.
    let breakers = Arc::new(BreakerRegistry::new(config.net_settings()));
    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(GithubAddonProvider::new(
        breakers.client_for(addonsync::addons::providers::github::PROVIDER_NAME),
    )));
    providers.apply_flags(&config.providers);
    let providers = Arc::new(providers);

    let store: Arc<dyn addons::AddonStore> = Arc::new(JsonAddonStore::new(store_dir));
    let events = AddonEventBus::new();
    let orchestrator = Arc::new(SyncOrchestrator::new(
        Arc::clone(&store),
        Arc::new(DirScanner::new()),
        Arc::clone(&providers),
        events.clone(),
    ));
    let lifecycle = AddonLifecycle::new(
        Arc::clone(&store),
        Arc::new(HttpPackageFetcher::new(Arc::clone(&breakers))),
        events.clone(),
        work_dir,
    );

    // Log breaker trips and addon transitions in the background; the
    // presentation layer would subscribe the same way.
    let mut breaker_events = breakers.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = breaker_events.recv().await {
            info!("Provider '{}' circuit breaker {}", event.name, event.state);
        }
    });
    let mut addon_events = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = addon_events.recv().await {
            info!(
                "{}: {} ({}%)",
                event.addon.name, event.install_state, event.progress
            );
        }
    });

    if config.installations.is_empty() {
        println!("No installations configured; add [[installation]] entries to");
        println!("  {}", config_path.display());
        return Ok(());
    }

    if let Some(term) = options.search {
        return search(&config, &providers, &term).await;
    }

    // Drop persisted sets for installations no longer configured.
    let pruned = orchestrator.prune_orphans(&config.installations).await?;
    if pruned > 0 {
        info!("Pruned {} orphaned installation set(s)", pruned);
    }

    let cancel = CancellationToken::new();
    let sync_options = SyncOptions {
        rescan: options.rescan,
    };
    let results = Arc::clone(&orchestrator)
        .sync_all(&config.installations, sync_options, &cancel)
        .await;

    let mut failures = 0;
    for (installation_id, result) in &results {
        let label = config
            .installations
            .iter()
            .find(|i| &i.id == installation_id)
            .map_or(installation_id.as_str(), |i| i.label.as_str());
        match result {
            Ok(result) => println!("{}: {}", label, result),
            Err(e) => {
                failures += 1;
                eprintln!("{}: sync failed: {}", label, e);
            }
        }
    }

    if options.auto_update {
        for installation in &config.installations {
            let candidates = orchestrator.auto_update_candidates(installation).await?;
            for addon in candidates {
                match lifecycle.update(installation, &addon.id).await {
                    Ok(updated) => println!(
                        "{}: updated '{}' to {}",
                        installation.label, updated.name, updated.installed_version
                    ),
                    Err(e) => {
                        warn!("Auto-update failed for '{}': {}", addon.name, e);
                        eprintln!("{}: failed to update '{}': {}", installation.label, addon.name, e);
                    }
                }
            }
        }
    }

    if failures > 0 {
        Err(format!("{failures} installation(s) failed to sync").into())
    } else {
        Ok(())
    }
}

async fn search(
    config: &Config,
    providers: &Arc<ProviderRegistry>,
    term: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    // Search is scoped to the first installation's client variant.
    let Some(installation) = config.installations.first() else {
        return Err("No installations configured".into());
    };

    for provider in providers.enabled_providers() {
        match provider.search(installation, term).await {
            Ok(results) => {
                println!("{} ({} result(s)):", provider.name(), results.len());
                for result in results {
                    let summary = result.summary.unwrap_or_default();
                    println!("  {:30} {}", result.external_id, summary);
                }
            }
            Err(e) => eprintln!("{}: search failed: {}", provider.name(), e),
        }
    }
    Ok(())
}
