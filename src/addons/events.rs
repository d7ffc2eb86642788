//! Event channel between the engine and presentation collaborators.
//!
//! Every lifecycle transition and every sync-driven addon change goes through
//! one broadcast bus. Consumers subscribe; slow consumers lose old events
//! rather than blocking the engine.

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use super::types::AddonUpdateEvent;

/// Capacity of the addon event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast bus for addon update events.
#[derive(Debug, Clone)]
pub struct AddonEventBus {
    tx: broadcast::Sender<AddonUpdateEvent>,
}

impl Default for AddonEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl AddonEventBus {
    /// Creates a new event bus.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Emits an event to all subscribers.
    ///
    /// Emitting without subscribers is fine; the event is dropped.
    pub fn emit(&self, event: AddonUpdateEvent) {
        debug!(
            "[EVENT] {} -> {} ({}%)",
            event.addon.name, event.install_state, event.progress
        );
        let _ = self.tx.send(event);
    }

    /// Subscribes to future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AddonUpdateEvent> {
        self.tx.subscribe()
    }

    /// Subscribes as a stream, for presentation layers that compose streams.
    #[must_use]
    pub fn stream(&self) -> BroadcastStream<AddonUpdateEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }
}
