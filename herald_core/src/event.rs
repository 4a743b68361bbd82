//! Row-level change events as delivered by the backend change-feed and replayed over the
//! cross-tab bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A row as carried by a change event: column name to JSON value.
pub type Row = Map<String, Value>;

/// The kind of change a listener is interested in, or that an event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EventKind {
    /// A row was inserted.
    #[serde(rename = "INSERT")]
    Insert,
    /// A row was updated.
    #[serde(rename = "UPDATE")]
    Update,
    /// A row was deleted.
    #[serde(rename = "DELETE")]
    Delete,
    /// Any of the above.
    #[default]
    #[serde(rename = "*")]
    Any,
}

impl EventKind {
    /// Returns true if a listener registered for `self` wants an event of kind `event`.
    pub fn accepts(self, event: EventKind) -> bool {
        self == EventKind::Any || self == event
    }

    /// The wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Insert => "INSERT",
            EventKind::Update => "UPDATE",
            EventKind::Delete => "DELETE",
            EventKind::Any => "*",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single row-level change.
///
/// Events are never mutated after receipt; every listener receives the same borrowed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// What happened to the row.
    #[serde(rename = "eventType")]
    pub kind: EventKind,

    /// The row after the change. `None` for deletes.
    #[serde(default)]
    pub new: Option<Row>,

    /// The row before the change, when the backend provides it.
    #[serde(default)]
    pub old: Option<Row>,

    /// The table the row belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,

    /// The schema of the table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// When the backend committed the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    /// Creates an insert event for `row`.
    pub fn insert(row: Row) -> Self {
        Self::with_rows(EventKind::Insert, Some(row), None)
    }

    /// Creates an update event.
    pub fn update(new: Row, old: Option<Row>) -> Self {
        Self::with_rows(EventKind::Update, Some(new), old)
    }

    /// Creates a delete event for `old`.
    pub fn delete(old: Row) -> Self {
        Self::with_rows(EventKind::Delete, None, Some(old))
    }

    fn with_rows(kind: EventKind, new: Option<Row>, old: Option<Row>) -> Self {
        Self {
            kind,
            new,
            old,
            table: None,
            schema: None,
            commit_timestamp: None,
        }
    }

    /// Sets the table this event belongs to.
    pub fn on_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// The row listener filters are evaluated against: `old` for deletes, `new` otherwise.
    pub fn relevant_row(&self) -> Option<&Row> {
        match self.kind {
            EventKind::Delete => self.old.as_ref(),
            _ => self.new.as_ref(),
        }
    }
}
