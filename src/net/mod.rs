//! Network layer for provider communication.
//!
//! Every content provider gets its own [`ResilientHttpClient`] guarded by its
//! own [`CircuitBreaker`], so one provider's outage never blocks the others.
//! The [`BreakerRegistry`] owns the provider-name -> client map and fans
//! breaker state changes out to observers.

pub mod breaker;
pub mod client;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

pub use breaker::{CircuitBreaker, TripPredicate, default_trip_predicate};
pub use client::ResilientHttpClient;

/// Default hard timeout for a single HTTP call.
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;

/// Capacity of the breaker state-change broadcast channel.
const BREAKER_EVENT_CAPACITY: usize = 64;

/// Network error types.
#[derive(Debug, Error)]
pub enum NetError {
    /// Connection-level failure (DNS, refused, reset, TLS).
    #[error("Network error: {0}")]
    Request(String),

    /// Response carried a non-success HTTP status.
    #[error("HTTP status {code}")]
    Status {
        /// The HTTP status code.
        code: u16,
    },

    /// The call exceeded its hard timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The circuit breaker is open; no network access was attempted.
    #[error("Circuit breaker '{0}' is open")]
    CircuitOpen(String),

    /// The response body could not be read or decoded.
    #[error("Body error: {0}")]
    Body(String),
}

impl From<reqwest::Error> for NetError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            NetError::Body(err.to_string())
        } else if let Some(status) = err.status() {
            NetError::Status {
                code: status.as_u16(),
            }
        } else {
            NetError::Request(err.to_string())
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls fail fast without network access.
    Open,
    /// A single probe call is allowed through.
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker state-change notification.
#[derive(Debug, Clone)]
pub struct BreakerEvent {
    /// Breaker name (the provider name).
    pub name: String,
    /// New state.
    pub state: BreakerState,
}

/// Settings shared by all registry-issued clients.
#[derive(Debug, Clone)]
pub struct NetSettings {
    /// Default hard timeout per HTTP call.
    pub http_timeout: Duration,
    /// Cooldown before an open breaker allows a probe.
    pub reset_timeout: Duration,
    /// Consecutive trip-worthy failures that open a breaker.
    pub failure_threshold: u32,
}

impl Default for NetSettings {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_millis(DEFAULT_HTTP_TIMEOUT_MS),
            reset_timeout: Duration::from_millis(breaker::DEFAULT_RESET_TIMEOUT_MS),
            failure_threshold: breaker::DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

/// Registry mapping provider names to their HTTP client + breaker pair.
///
/// Clients are created lazily on first use and reused afterwards, so a
/// provider keeps its breaker state for the lifetime of the process.
pub struct BreakerRegistry {
    settings: NetSettings,
    clients: Mutex<HashMap<String, Arc<ResilientHttpClient>>>,
    events_tx: broadcast::Sender<BreakerEvent>,
}

impl BreakerRegistry {
    /// Creates a new registry with the given settings.
    #[must_use]
    pub fn new(settings: NetSettings) -> Self {
        let (events_tx, _) = broadcast::channel(BREAKER_EVENT_CAPACITY);
        Self {
            settings,
            clients: Mutex::new(HashMap::new()),
            events_tx,
        }
    }

    /// Returns the client for a provider, creating it on first use.
    ///
    /// The client uses the default trip predicate (client/server faults trip,
    /// 404 and timeouts do not).
    pub fn client_for(&self, name: &str) -> Arc<ResilientHttpClient> {
        self.client_with_predicate(name, Box::new(default_trip_predicate))
    }

    /// Returns the client for a provider, creating it with a gateway-supplied
    /// trip predicate on first use.
    pub fn client_with_predicate(
        &self,
        name: &str,
        predicate: Box<TripPredicate>,
    ) -> Arc<ResilientHttpClient> {
        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(client) = clients.get(name) {
            return Arc::clone(client);
        }

        debug!("[NET] Creating client for provider '{}'", name);
        let breaker = CircuitBreaker::with_predicate(
            name,
            self.settings.failure_threshold,
            self.settings.reset_timeout,
            predicate,
        )
        .with_events(self.events_tx.clone());

        let client = Arc::new(ResilientHttpClient::new(breaker, self.settings.http_timeout));
        clients.insert(name.to_string(), Arc::clone(&client));
        client
    }

    /// Subscribes to breaker state-change events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events_tx.subscribe()
    }

    /// Returns the current breaker state for a provider, if it has a client.
    #[must_use]
    pub fn breaker_state(&self, name: &str) -> Option<BreakerState> {
        let clients = self
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        clients.get(name).map(|c| c.breaker().state())
    }
}
