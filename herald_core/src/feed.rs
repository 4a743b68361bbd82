//! The boundary to the backend change-feed service.

use crate::event::{ChangeEvent, EventKind};
use async_trait::async_trait;
use futures_core::Stream;
use std::pin::Pin;

/// A live connection to the change-feed. Dropping the stream closes the connection.
pub type ChangeStream = Pin<Box<dyn Stream<Item = ChangeEvent> + Send>>;

/// What the leader asks the backend for when it opens a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    /// The logical channel name the subscription was registered under.
    pub channel_name: String,
    /// The table to watch. `None` watches every table of the schema.
    pub table: Option<String>,
    /// The database schema.
    pub schema: String,
    /// The kind of change requested from the backend.
    pub event_kind: EventKind,
    /// The encoded server-side filter, `None` for a global subscription.
    pub server_filter: Option<String>,
}

/// Errors raised while opening a change-feed connection.
#[derive(Debug, thiserror::Error)]
pub enum ChangeFeedError {
    /// The connection could not be established.
    #[error("failed to connect to change-feed: {0}")]
    Connect(String),
    /// The backend refused the subscription.
    #[error("subscription rejected: {0}")]
    Rejected(String),
}

/// The backend change-feed: accepts a subscription and delivers change events over a persistent
/// connection.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Opens a connection delivering the events selected by `request`.
    async fn subscribe(&self, request: SubscriptionRequest) -> Result<ChangeStream, ChangeFeedError>;
}
