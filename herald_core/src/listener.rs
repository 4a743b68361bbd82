//! Listener registrations and the client-side dispatch predicate.

use crate::event::{ChangeEvent, EventKind};
use crate::filter::Filter;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use uuid::Uuid;

/// Errors returned by change handlers. They are logged and never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Reacts to change events delivered to a listener.
pub trait ChangeHandler: Send + Sync {
    /// Handles one event. Errors are logged by the dispatcher and do not affect other listeners.
    fn on_change(&self, event: &ChangeEvent) -> Result<(), HandlerError>;
}

impl<F> ChangeHandler for F
where
    F: Fn(&ChangeEvent) -> Result<(), HandlerError> + Send + Sync,
{
    fn on_change(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        self(event)
    }
}

/// Opaque identifier of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything needed to register a listener.
///
/// ```ignore
/// let request = ListenerRequest::new("report-items", |event: &ChangeEvent| {
///     println!("{:?}", event.kind);
///     Ok(())
/// })
/// .table("report_items")
/// .filter(Filter::new().eq("report_id", "R1"));
/// ```
#[derive(Clone)]
pub struct ListenerRequest {
    /// Logical channel name; the first half of the subscription key.
    pub channel_name: String,
    /// The table to watch.
    pub table: Option<String>,
    /// The schema of the table. Defaults to the configured schema.
    pub schema: Option<String>,
    /// Which kinds of change to deliver.
    pub event_kind: EventKind,
    /// Row filter, applied both server-side and to each event before delivery.
    pub filter: Option<Filter>,
    /// Must be true for a registration without a filter to open a backend connection.
    pub allow_global: bool,
    /// The callback.
    pub handler: Arc<dyn ChangeHandler>,
}

impl std::fmt::Debug for ListenerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRequest")
            .field("channel_name", &self.channel_name)
            .field("table", &self.table)
            .field("schema", &self.schema)
            .field("event_kind", &self.event_kind)
            .field("filter", &self.filter)
            .field("allow_global", &self.allow_global)
            .finish()
    }
}

impl ListenerRequest {
    /// Creates a request for every kind of change on `channel_name`, with no filter.
    pub fn new<F>(channel_name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&ChangeEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self::with_handler(channel_name, Arc::new(handler))
    }

    /// Creates a request around an existing handler.
    pub fn with_handler(channel_name: impl Into<String>, handler: Arc<dyn ChangeHandler>) -> Self {
        Self {
            channel_name: channel_name.into(),
            table: None,
            schema: None,
            event_kind: EventKind::Any,
            filter: None,
            allow_global: false,
            handler,
        }
    }

    /// Sets the table.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Sets the schema.
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Restricts delivery to one kind of change.
    pub fn event_kind(mut self, kind: EventKind) -> Self {
        self.event_kind = kind;
        self
    }

    /// Sets the row filter.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Allows a filterless registration to open a global subscription.
    pub fn allow_global(mut self, allow: bool) -> Self {
        self.allow_global = allow;
        self
    }

    /// Returns true if this registration is allowed to open a backend connection.
    pub fn may_connect(&self) -> bool {
        self.allow_global || self.filter.as_ref().is_some_and(|f| !f.is_empty())
    }
}

/// A listener owned by a channel record.
#[derive(Clone)]
pub(crate) struct Listener {
    pub id: ListenerId,
    pub event_kind: EventKind,
    pub filter: Option<Filter>,
    pub may_connect: bool,
    pub handler: Arc<dyn ChangeHandler>,
}

impl Listener {
    pub fn from_request(request: &ListenerRequest) -> Self {
        Self {
            id: ListenerId::new(),
            event_kind: request.event_kind,
            filter: request.filter.clone(),
            may_connect: request.may_connect(),
            handler: request.handler.clone(),
        }
    }

    /// The dispatch predicate: the kind must be accepted and every filter clause must hold for
    /// the event's relevant row.
    pub fn wants(&self, event: &ChangeEvent) -> bool {
        self.event_kind.accepts(event.kind)
            && self
                .filter
                .as_ref()
                .is_none_or(|filter| filter.matches(event.relevant_row()))
    }

    /// Invokes the handler, containing errors and panics.
    pub fn deliver(&self, event: &ChangeEvent) {
        match catch_unwind(AssertUnwindSafe(|| self.handler.on_change(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::error!("Listener {} failed to handle {} event: {}", self.id, event.kind, e);
            }
            Err(_) => {
                log::error!("Listener {} panicked while handling {} event", self.id, event.kind);
            }
        }
    }
}
