//! Change-event and stream-filter types.
//!
//! A change event is the unit of the server-pushed change stream: one
//! row-level mutation, scoped to an entity class and a scope key. Events are
//! ephemeral — they are delivered once per registered handler and never
//! persisted client-side.

use serde::{Deserialize, Serialize};

use crate::ids::UserId;
use crate::Error;

/// Entity classes carried on change streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// Review-thread comments on a content item.
    Comment,
    /// In-app notifications for a recipient.
    Notification,
    /// Content versions moving through the review workflow.
    ContentVersion,
}

impl EntityKind {
    /// Stable wire name for this entity class.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Comment => "comment",
            EntityKind::Notification => "notification",
            EntityKind::ContentVersion => "content_version",
        }
    }

    /// Parse a wire name back into an entity kind.
    pub fn parse(name: &str) -> Result<Self, Error> {
        match name {
            "comment" => Ok(EntityKind::Comment),
            "notification" => Ok(EntityKind::Notification),
            "content_version" => Ok(EntityKind::ContentVersion),
            other => Err(Error::UnknownEntity(other.to_string())),
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of row-level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOp {
    /// A new row was inserted.
    Insert,
    /// An existing row was updated.
    Update,
    /// A row was deleted.
    Delete,
}

/// A single change pushed by the backend stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The entity class that changed.
    pub entity: EntityKind,
    /// The scope value this event was filtered on (e.g. a content item id).
    pub scope_key: String,
    /// Type of change.
    pub op: ChangeOp,
    /// Row payload after the change (before-state for deletes).
    pub payload: serde_json::Value,
    /// The user whose action produced this change.
    pub origin_actor: UserId,
    /// Server timestamp in microseconds since epoch.
    pub timestamp_micros: u64,
}

impl ChangeEvent {
    /// Create a new change event stamped with the current time.
    pub fn new(
        entity: EntityKind,
        scope_key: impl Into<String>,
        op: ChangeOp,
        payload: serde_json::Value,
        origin_actor: UserId,
    ) -> Self {
        Self {
            entity,
            scope_key: scope_key.into(),
            op,
            payload,
            origin_actor,
            timestamp_micros: crate::time::now_micros(),
        }
    }

    /// Interpret the payload as a typed row.
    pub fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::InvalidPayload(e.to_string()))
    }
}

/// Equality predicate narrowing a change stream to one scope.
///
/// A subscription request carries exactly one filter: a scope column, the
/// value it must equal, and the set of change operations wanted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamFilter {
    /// Column the equality predicate applies to.
    pub column: String,
    /// Value the column must equal.
    pub value: String,
    /// Change operations to deliver. Empty means all.
    pub ops: Vec<ChangeOp>,
}

impl StreamFilter {
    /// Create a filter matching all change operations.
    pub fn equals(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
            ops: Vec::new(),
        }
    }

    /// Restrict the filter to specific change operations.
    pub fn with_ops(mut self, ops: Vec<ChangeOp>) -> Self {
        self.ops = ops;
        self
    }

    /// Whether this filter accepts the given operation.
    pub fn accepts(&self, op: ChangeOp) -> bool {
        self.ops.is_empty() || self.ops.contains(&op)
    }

    /// Whether an event matches this filter's scope predicate.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.accepts(event.op) && event.scope_key == self.value
    }
}
