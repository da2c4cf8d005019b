//! Event bus for publication progress
//!
//! Built on `tokio::sync::broadcast`: emitting never blocks, events are
//! dropped when nobody listens, and a lagging subscriber misses the oldest
//! events rather than slowing the worker down.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{ItemId, Phase, PlatformKind, PublicationStatus};

pub type EventReceiver = broadcast::Receiver<Event>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    /// `capacity` is the per-subscriber buffer before old events are dropped
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // Err only means there are no receivers
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A dispatch pass started for an item
    DispatchStarted {
        item_id: ItemId,
        platforms: Vec<PlatformKind>,
    },

    /// One adapter call finished and its outcome was merged
    PlatformAttempted {
        item_id: ItemId,
        platform: PlatformKind,
        status: PublicationStatus,
        attempt: u32,
        error: Option<String>,
    },

    /// A merge changed the item's aggregate phase
    PhaseChanged {
        item_id: ItemId,
        from: Phase,
        to: Phase,
    },

    /// A report was not applied (duplicate, or would downgrade a success)
    ReportIgnored {
        item_id: ItemId,
        platform: PlatformKind,
        reason: String,
    },

    /// A dispatch pass stopped early because the store was unreachable
    DispatchAborted { item_id: ItemId, reason: String },
}
