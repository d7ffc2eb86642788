//! Circuit breaker guarding one upstream dependency.
//!
//! Consecutive trip-worthy failures open the breaker; while open, calls fail
//! fast with `NetError::CircuitOpen` and no network access is attempted.
//! After the reset timeout a single probe call runs half-open: success closes
//! the breaker and clears the failure count, failure re-opens it and restarts
//! the timer.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{BreakerEvent, BreakerState, NetError};

/// Default number of consecutive failures that opens the breaker.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Default reset timeout before a half-open probe is allowed.
pub const DEFAULT_RESET_TIMEOUT_MS: u64 = 60_000;

/// Predicate deciding whether an error counts toward tripping the breaker.
pub type TripPredicate = dyn Fn(&NetError) -> bool + Send + Sync;

/// Default trip policy.
///
/// Client/server fault statuses and connection-level failures trip the
/// breaker. A 404 just means "no data" and is exempt, and timeouts are
/// treated as transient rather than trip-worthy.
#[must_use]
pub fn default_trip_predicate(err: &NetError) -> bool {
    match err {
        NetError::Status { code } => *code != 404 && (400..=599).contains(code),
        NetError::Request(_) => true,
        NetError::Timeout(_) | NetError::CircuitOpen(_) | NetError::Body(_) => false,
    }
}

/// Mutable breaker state, guarded by one mutex.
#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// How a permitted call entered the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    /// Normal closed-state call.
    Normal,
    /// The single half-open probe.
    Probe,
}

/// Circuit breaker wrapping calls to a single upstream dependency.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    trip_predicate: Box<TripPredicate>,
    inner: Mutex<BreakerInner>,
    events: Option<broadcast::Sender<BreakerEvent>>,
}

impl CircuitBreaker {
    /// Creates a breaker with the default trip predicate.
    #[must_use]
    pub fn new(name: &str, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self::with_predicate(
            name,
            failure_threshold,
            reset_timeout,
            Box::new(default_trip_predicate),
        )
    }

    /// Creates a breaker with a caller-supplied trip predicate.
    #[must_use]
    pub fn with_predicate(
        name: &str,
        failure_threshold: u32,
        reset_timeout: Duration,
        trip_predicate: Box<TripPredicate>,
    ) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            trip_predicate,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            events: None,
        }
    }

    /// Attaches a state-change event channel.
    #[must_use]
    pub fn with_events(mut self, events: broadcast::Sender<BreakerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Returns the breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current state.
    ///
    /// An open breaker whose reset timeout has elapsed still reports `Open`
    /// until the next call converts it into the half-open probe.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.lock_inner().state
    }

    /// Returns the current consecutive-failure count.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.lock_inner().consecutive_failures
    }

    /// Executes an action through the breaker.
    ///
    /// While open, returns `NetError::CircuitOpen` immediately without
    /// polling the action; no timeout wait is incurred.
    pub async fn execute<T, F>(&self, action: F) -> Result<T, NetError>
    where
        F: Future<Output = Result<T, NetError>>,
    {
        let kind = self.begin_call()?;
        let result = action.await;

        match &result {
            Ok(_) => self.record_success(kind),
            Err(err) => {
                if (self.trip_predicate)(err) {
                    self.record_failure(kind);
                } else {
                    // An ignorable error still proves the upstream answered.
                    self.record_success(kind);
                }
            }
        }

        result
    }

    /// Admits or rejects a call based on the current state.
    fn begin_call(&self) -> Result<CallKind, NetError> {
        let mut inner = self.lock_inner();
        match inner.state {
            BreakerState::Closed => Ok(CallKind::Normal),
            BreakerState::Open => {
                let expired = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.reset_timeout);
                if expired {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    debug!("[BREAKER] {} allowing half-open probe", self.name);
                    Ok(CallKind::Probe)
                } else {
                    Err(NetError::CircuitOpen(self.name.clone()))
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(NetError::CircuitOpen(self.name.clone()))
                } else {
                    inner.probe_in_flight = true;
                    Ok(CallKind::Probe)
                }
            }
        }
    }

    fn record_success(&self, kind: CallKind) {
        let mut inner = self.lock_inner();
        inner.consecutive_failures = 0;
        let was_tripped = inner.state != BreakerState::Closed;
        if kind == CallKind::Probe || was_tripped {
            inner.state = BreakerState::Closed;
            inner.probe_in_flight = false;
            inner.opened_at = None;
            drop(inner);
            if was_tripped {
                info!("[BREAKER] {} closed", self.name);
                self.emit(BreakerState::Closed);
            }
        }
    }

    fn record_failure(&self, kind: CallKind) {
        let mut inner = self.lock_inner();
        match (kind, inner.state) {
            (CallKind::Probe, _) | (_, BreakerState::HalfOpen | BreakerState::Open) => {
                // Probe failed: re-open and restart the cooldown timer.
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                drop(inner);
                warn!("[BREAKER] {} re-opened after failed probe", self.name);
                self.emit(BreakerState::Open);
            }
            (CallKind::Normal, BreakerState::Closed) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    let failures = inner.consecutive_failures;
                    drop(inner);
                    warn!(
                        "[BREAKER] {} opened after {} consecutive failures",
                        self.name, failures
                    );
                    self.emit(BreakerState::Open);
                }
            }
        }
    }

    fn emit(&self, state: BreakerState) {
        if let Some(tx) = &self.events {
            let _ = tx.send(BreakerEvent {
                name: self.name.clone(),
                state,
            });
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
