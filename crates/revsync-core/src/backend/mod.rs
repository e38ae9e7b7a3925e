//! Backend interfaces the engine drives.
//!
//! The engine never talks to a concrete transport or store directly; it
//! consumes these traits. [`memory::MemoryBackend`] implements all three for
//! tests and embedders.

mod memory;

pub use memory::MemoryBackend;

use async_trait::async_trait;
use revsync_proto::{
    ApprovalAction, ChangeEvent, ContentItem, ContentItemId, ContentVersion, EntityKind,
    Notification, NotificationId, NotificationKind, StreamFilter, UserId, VersionId, VersionStatus,
};
use tokio::sync::mpsc;

use crate::error::Error;

/// Receiving half of one live change stream.
///
/// The stream ends (yields `None`) when the connection drops; the channel
/// layer treats that as a disconnect and re-dials.
pub type EventReceiver = mpsc::Receiver<ChangeEvent>;

/// A transport that can open filtered server-side change streams.
#[async_trait]
pub trait ChangeStreamTransport: Send + Sync {
    /// Open one filtered stream. Performs the handshake; the caller bounds
    /// it with a timeout. Each call returns a fresh stream.
    async fn connect(
        &self,
        entity: EntityKind,
        filter: &StreamFilter,
    ) -> Result<EventReceiver, Error>;
}

/// Persistence for content versions and review decisions.
#[async_trait]
pub trait ReviewStore: Send + Sync {
    /// Load a content item.
    async fn content_item(&self, id: ContentItemId) -> Result<ContentItem, Error>;

    /// Load a version.
    async fn version(&self, id: VersionId) -> Result<ContentVersion, Error>;

    /// Atomically move a version from `expected` to `next`.
    ///
    /// Fails with [`Error::Conflict`] when the current status is not
    /// `expected`. `actor` becomes the origin of the emitted change event.
    async fn transition(
        &self,
        version_id: VersionId,
        expected: VersionStatus,
        next: VersionStatus,
        actor: &UserId,
    ) -> Result<ContentVersion, Error>;

    /// Atomically apply a review decision: compare-and-transition the
    /// version out of `Submitted` and append the write-once audit record.
    /// Either both happen or neither does.
    async fn record_decision(&self, action: &ApprovalAction) -> Result<ContentVersion, Error>;

    /// Create a fresh draft version for an item, linking `superseded_by` on
    /// the predecessor when one exists.
    async fn create_draft(
        &self,
        content_item_id: ContentItemId,
        author: &UserId,
    ) -> Result<ContentVersion, Error>;

    /// The newest version of an item, when any exists.
    async fn latest_version(
        &self,
        content_item_id: ContentItemId,
    ) -> Result<Option<ContentVersion>, Error>;

    /// All recorded decisions for an item, oldest first.
    async fn decisions(&self, content_item_id: ContentItemId) -> Result<Vec<ApprovalAction>, Error>;
}

/// A notification to be created, before the store assigns its id.
#[derive(Debug, Clone)]
pub struct NotificationDraft {
    /// The user to notify.
    pub recipient: UserId,
    /// Notification class.
    pub kind: NotificationKind,
    /// Short headline.
    pub title: String,
    /// Longer body text.
    pub body: String,
    /// Structured payload for the renderer.
    pub metadata: serde_json::Value,
    /// Deduplication key for the (kind, source action, recipient) triple.
    pub idempotency_key: String,
}

/// Persistence for notifications and read-state tracking.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert a notification unless its idempotency key already exists.
    /// Returns `None` for a duplicate. `origin` becomes the origin of the
    /// emitted change event.
    async fn insert_unique(
        &self,
        draft: NotificationDraft,
        origin: &UserId,
    ) -> Result<Option<Notification>, Error>;

    /// A recipient's notifications, newest first, up to `limit`.
    async fn list(&self, recipient: &UserId, limit: usize) -> Result<Vec<Notification>, Error>;

    /// Count of the recipient's unread notifications.
    async fn unread_count(&self, recipient: &UserId) -> Result<usize, Error>;

    /// Mark one notification read. Returns the updated record.
    async fn mark_read(&self, id: NotificationId) -> Result<Notification, Error>;

    /// Mark all of a recipient's notifications read. Returns how many
    /// flipped.
    async fn mark_all_read(&self, recipient: &UserId) -> Result<usize, Error>;
}
