//! In-app notification records.

use serde::{Deserialize, Serialize};

use crate::ids::{NotificationId, UserId};

/// Classes of notification the platform fans out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    /// A version the recipient owns or submitted was approved.
    VersionApproved,
    /// A reviewer requested changes on a version the recipient owns.
    ChangesRequested,
    /// A new version was submitted for the recipient to review.
    VersionSubmitted,
}

impl NotificationKind {
    /// Stable wire name for this notification class.
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::VersionApproved => "version_approved",
            NotificationKind::ChangesRequested => "changes_requested",
            NotificationKind::VersionSubmitted => "version_submitted",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification row.
///
/// Created by the fan-out, mutated only to flip `read`, never deleted by the
/// client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Unique notification identifier.
    pub id: NotificationId,
    /// The user this notification is for.
    pub recipient: UserId,
    /// Notification class.
    pub kind: NotificationKind,
    /// Short headline.
    pub title: String,
    /// Longer body text.
    pub body: String,
    /// Structured payload for the renderer (item ids, deep links).
    pub metadata: serde_json::Value,
    /// Whether the recipient has seen this notification.
    pub read: bool,
    /// Creation timestamp in microseconds since epoch.
    pub created_at_micros: u64,
    /// Deduplication key for the (kind, source action, recipient) triple.
    pub idempotency_key: String,
}

impl Notification {
    /// Create an unread notification stamped with the current time.
    pub fn new(
        id: NotificationId,
        recipient: UserId,
        kind: NotificationKind,
        title: impl Into<String>,
        body: impl Into<String>,
        metadata: serde_json::Value,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            id,
            recipient,
            kind,
            title: title.into(),
            body: body.into(),
            metadata,
            read: false,
            created_at_micros: crate::time::now_micros(),
            idempotency_key: idempotency_key.into(),
        }
    }
}
