use async_trait::async_trait;
use herald_core::prelude::*;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Debug)]
struct Connection {
    request: SubscriptionRequest,
    filter: Option<Filter>,
    sender: mpsc::UnboundedSender<ChangeEvent>,
}

impl Connection {
    /// Server-side selection: schema, table, kind and the decoded row filter.
    fn selects(&self, event: &ChangeEvent) -> bool {
        let schema_matches = event
            .schema
            .as_ref()
            .is_none_or(|schema| *schema == self.request.schema);
        let table_matches = match (&self.request.table, &event.table) {
            (Some(wanted), Some(table)) => wanted == table,
            _ => true,
        };
        schema_matches
            && table_matches
            && self.request.event_kind.accepts(event.kind)
            && self
                .filter
                .as_ref()
                .is_none_or(|filter| filter.matches(event.relevant_row()))
    }
}

#[derive(Debug, Default)]
struct FeedData {
    connections: Vec<Connection>,
    requests: Vec<SubscriptionRequest>,
    refusals: usize,
    opened: usize,
}

/// A scriptable in-memory change-feed.
///
/// Each subscription becomes a connection; [`emit`](Self::emit) plays a database change and
/// delivers it to every open connection whose subscription selects it. Events without a table
/// or schema reach every connection regardless of its table or schema. Clones share the same
/// connections.
#[derive(Clone, Debug, Default)]
pub struct InMemoryChangeFeed(Arc<Mutex<FeedData>>);

impl InMemoryChangeFeed {
    /// Creates a feed with no connections.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemoryChangeFeed");
        Self::default()
    }

    fn data(&self) -> MutexGuard<'_, FeedData> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers `event` to every open connection that selects it. Returns the number of
    /// connections reached.
    pub fn emit(&self, event: ChangeEvent) -> usize {
        let mut data = self.data();
        data.connections.retain(|c| !c.sender.is_closed());
        let reached = data
            .connections
            .iter()
            .filter(|c| c.selects(&event))
            .filter(|c| c.sender.send(event.clone()).is_ok())
            .count();
        log::debug!("Emitted {} event to {} connections", event.kind, reached);
        reached
    }

    /// Refuses the next `count` subscriptions with a connection error.
    pub fn fail_next(&self, count: usize) {
        self.data().refusals += count;
    }

    /// Ends every open connection, as when the backend drops its sockets.
    pub fn disconnect_all(&self) {
        let dropped = std::mem::take(&mut self.data().connections);
        log::debug!("Disconnecting {} connections", dropped.len());
    }

    /// Number of connections whose stream is still held by a subscriber.
    pub fn active_connections(&self) -> usize {
        self.data()
            .connections
            .iter()
            .filter(|c| !c.sender.is_closed())
            .count()
    }

    /// Every subscription received so far, including refused ones, in order.
    pub fn requests(&self) -> Vec<SubscriptionRequest> {
        self.data().requests.clone()
    }

    /// Number of connections successfully opened so far.
    pub fn connections_opened(&self) -> usize {
        self.data().opened
    }
}

#[async_trait]
impl ChangeFeed for InMemoryChangeFeed {
    async fn subscribe(&self, request: SubscriptionRequest) -> Result<ChangeStream, ChangeFeedError> {
        let mut data = self.data();
        data.requests.push(request.clone());
        if data.refusals > 0 {
            data.refusals -= 1;
            log::debug!("Refusing subscription to '{}'", request.channel_name);
            return Err(ChangeFeedError::Connect("connection refused".to_string()));
        }
        let filter = match request.server_filter.as_deref() {
            Some(encoded) => Some(
                Filter::parse_server_filter(encoded)
                    .map_err(|e| ChangeFeedError::Rejected(e.to_string()))?,
            ),
            None => None,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        log::debug!(
            "Opened connection for '{}' (table: {:?}, filter: {:?})",
            request.channel_name,
            request.table,
            request.server_filter
        );
        data.connections.push(Connection {
            request,
            filter,
            sender,
        });
        data.opened += 1;
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }
}
