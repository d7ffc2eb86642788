//! Addonsync
//!
//! Keeps a user's collection of third-party game add-ons, spread across
//! multiple game installations, synchronized with their latest versions from
//! independent content providers.
//!
//! # Architecture
//!
//! - **Net Module**: per-provider circuit breaker and resilient HTTP client
//! - **Addons Module**: data model, persisted store, on-disk scanner,
//!   provider gateways, sync orchestrator, lifecycle machine and push
//!   refresh coordinator
//! - **Config Module**: TOML configuration (installations, providers, tuning)
//! - **Logging Module**: file logging with retention cleanup
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use addonsync::addons::{AddonEventBus, DirScanner, JsonAddonStore, ProviderRegistry};
//! use addonsync::addons::SyncOrchestrator;
//!
//! let store = Arc::new(JsonAddonStore::new("/tmp/store".into()));
//! let scanner = Arc::new(DirScanner::new());
//! let providers = Arc::new(ProviderRegistry::new());
//! let orchestrator =
//!     SyncOrchestrator::new(store, scanner, providers, AddonEventBus::new());
//! // Drive orchestrator.sync(..) from an async runtime...
//! # let _ = orchestrator;
//! ```

// Clippy configuration - allow common patterns
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::similar_names)]

pub mod addons;
pub mod config;
pub mod logging;
pub mod net;

// Re-export main types
pub use addons::{
    Addon, AddonError, AddonEventBus, AddonInstallState, AddonLifecycle, AddonProvider,
    AddonScanner, AddonStore, AddonUpdateEvent, DirScanner, HttpPackageFetcher, Installation,
    JsonAddonStore, ProviderRegistry, PushRefreshCoordinator, SyncOptions, SyncOrchestrator,
    SyncResult,
};
pub use config::Config;
pub use net::{BreakerRegistry, NetError, NetSettings};

/// Current version of addonsync.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
