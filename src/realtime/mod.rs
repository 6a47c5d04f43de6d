//! Per-session publish/subscribe
//!
//! Each combat session gets its own broadcast channel, created on first
//! use. Delivery is fire-and-forget: a subscriber that falls more than the
//! buffer size behind sees `RecvError::Lagged` and must re-fetch the session.

use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

use crate::combat::CombatEvent;

/// Default number of events buffered per session
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Publishing failed
#[derive(Debug, Error)]
#[error("publish failed: {0}")]
pub struct PublishError(pub String);

/// Publish/subscribe keyed by session id
pub trait EventChannel: Send + Sync {
    /// Deliver to current subscribers of the event's session
    fn publish(&self, event: CombatEvent) -> Result<(), PublishError>;

    fn subscribe(&self, session_id: &str) -> broadcast::Receiver<CombatEvent>;

    /// Forget the session's channel if nobody is listening any more
    fn release(&self, session_id: &str);
}

/// In-process channel built on `tokio::sync::broadcast`
pub struct BroadcastChannel {
    capacity: usize,
    channels: RwLock<HashMap<String, broadcast::Sender<CombatEvent>>>,
}

impl BroadcastChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Sessions with a live channel
    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.channels
            .read()
            .get(session_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for BroadcastChannel {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

impl EventChannel for BroadcastChannel {
    fn publish(&self, event: CombatEvent) -> Result<(), PublishError> {
        let session_id = event.session_id().to_string();
        let name = event.name();

        let mut channels = self.channels.write();
        let Some(tx) = channels.get(&session_id) else {
            trace!(session = %session_id, event = name, "No subscribers");
            return Ok(());
        };
        if tx.send(event).is_err() {
            // everyone left; drop the channel until someone subscribes again
            channels.remove(&session_id);
            trace!(session = %session_id, event = name, "Dropped idle channel");
        }
        Ok(())
    }

    fn subscribe(&self, session_id: &str) -> broadcast::Receiver<CombatEvent> {
        if let Some(tx) = self.channels.read().get(session_id) {
            return tx.subscribe();
        }
        let mut channels = self.channels.write();
        // sweep channels whose subscribers went away without a later publish
        channels.retain(|id, tx| id == session_id || tx.receiver_count() > 0);
        channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    fn release(&self, session_id: &str) {
        let mut channels = self.channels.write();
        if channels
            .get(session_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            channels.remove(session_id);
            trace!(session = %session_id, "Released idle channel");
        }
    }
}
