//! The cross-tab bus: one broadcast topic per subscription key, carrying the leader's change
//! events and control signals to every other tab.
//!
//! Messages travel as JSON text. A message is either a control message
//! (`{"control":"leader_left"}`) or a change event, recognised by its `eventType` field.
//! Anything else is dropped by the receiver.

use crate::event::{ChangeEvent, EventKind};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Raw messages received on a topic, in arrival order.
pub type BusStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Control signals exchanged between tabs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    /// The leader released its lease; followers should try to take over.
    LeaderLeft,
}

/// A message on the cross-tab bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BusMessage {
    /// A control message.
    Control {
        /// The signal carried.
        control: ControlSignal,
    },
    /// A change event relayed verbatim by the leader.
    Event(ChangeEvent),
}

impl BusMessage {
    /// The `leader_left` control message.
    pub fn leader_left() -> Self {
        BusMessage::Control {
            control: ControlSignal::LeaderLeft,
        }
    }

    /// Parses a raw message. Returns `None` for anything that is neither a control message nor
    /// an event.
    pub fn parse(raw: &str) -> Option<Self> {
        match serde_json::from_str(raw) {
            Ok(BusMessage::Event(event)) if event.kind == EventKind::Any => {
                log::debug!("Dropping bus event without a concrete kind: '{}'", raw);
                None
            }
            Ok(message) => Some(message),
            Err(e) => {
                log::debug!("Dropping malformed bus message '{}': {}", raw, e);
                None
            }
        }
    }

    /// Encodes the message as JSON text.
    pub fn to_wire(&self) -> Result<String, BusError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Encodes `event` exactly as `BusMessage::Event(event)` would be, without cloning it.
    pub fn event_wire(event: &ChangeEvent) -> Result<String, BusError> {
        Ok(serde_json::to_string(event)?)
    }
}

/// Errors raised by bus implementations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The channel has been closed.
    #[error("broadcast channel closed")]
    Closed,
    /// The broadcast primitive is not available.
    #[error("broadcast unavailable: {0}")]
    Unavailable(String),
    /// The message could not be encoded.
    #[error("failed to encode bus message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The sending half of a topic subscription.
pub trait BroadcastChannel: Send + Sync {
    /// Posts `message` to every other endpoint open on the same topic. Fire-and-forget; the
    /// poster never receives its own message.
    fn post(&self, message: &str) -> Result<(), BusError>;
    /// Closes the endpoint. Its message stream ends and further posts fail.
    fn close(&self);
}

/// An open endpoint on a topic.
pub struct BusEndpoint {
    /// Used to post to the topic.
    pub channel: Box<dyn BroadcastChannel>,
    /// Messages posted by other endpoints on the topic.
    pub messages: BusStream,
}

impl std::fmt::Debug for BusEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusEndpoint").finish()
    }
}

/// An origin-scoped broadcast primitive addressed by topic name.
pub trait CrossTabBus: Send + Sync {
    /// Opens an endpoint on `topic`.
    fn open(&self, topic: &str) -> Result<BusEndpoint, BusError>;
}
