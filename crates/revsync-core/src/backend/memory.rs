//! In-memory backend.
//!
//! Implements all three backend traits over mutex-guarded maps with a
//! per-(entity, scope) event hub, so the whole engine can run against it in
//! tests and embedded deployments. Every mutation it applies is published as
//! a change event to the matching streams, the same shape a remote backend
//! would push.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use revsync_proto::{
    ApprovalAction, ChangeEvent, ChangeOp, ContentItem, ContentItemId, ContentVersion, EntityKind,
    Notification, NotificationId, StreamFilter, UserId, VersionId, VersionStatus,
};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ChangeStreamTransport, EventReceiver, NotificationDraft, NotificationStore, ReviewStore};
use crate::error::Error;

/// Buffer size for streams handed out by [`MemoryBackend::connect`].
const STREAM_BUFFER: usize = 64;

type StreamKey = (EntityKind, String);

/// Fans published events out to every live stream for a (entity, scope) key.
struct EventHub {
    senders: Mutex<HashMap<StreamKey, Vec<mpsc::Sender<ChangeEvent>>>>,
}

impl EventHub {
    fn new() -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, key: StreamKey, sender: mpsc::Sender<ChangeEvent>) {
        self.senders.lock().entry(key).or_default().push(sender);
    }

    fn publish(&self, event: ChangeEvent) {
        let key = (event.entity, event.scope_key.clone());
        let mut senders = self.senders.lock();
        let Some(list) = senders.get_mut(&key) else {
            return;
        };
        list.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(entity = %event.entity, scope = %event.scope_key, "stream buffer full, dropping event");
                true
            }
        });
        if list.is_empty() {
            senders.remove(&key);
        }
    }

    /// Drop every stream for a key, simulating a server-side disconnect.
    fn disconnect(&self, key: &StreamKey) {
        self.senders.lock().remove(key);
    }

    fn disconnect_all(&self) {
        self.senders.lock().clear();
    }

    fn live_stream_count(&self, key: &StreamKey) -> usize {
        self.senders
            .lock()
            .get(key)
            .map(|list| list.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[derive(Default)]
struct MemState {
    items: HashMap<ContentItemId, ContentItem>,
    versions: HashMap<VersionId, ContentVersion>,
    // Version ids per item, creation order.
    history: HashMap<ContentItemId, Vec<VersionId>>,
    decisions: Vec<ApprovalAction>,
    notifications: Vec<Notification>,
    idempotency_keys: HashSet<String>,
}

/// In-memory backend implementing transport, review store, and notification
/// store.
pub struct MemoryBackend {
    state: Mutex<MemState>,
    hub: EventHub,
    next_item_id: AtomicU64,
    next_version_id: AtomicU64,
    next_notification_id: AtomicU64,
    // Number of upcoming connect() calls to reject, for reconnect tests.
    connect_failures: AtomicUsize,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState::default()),
            hub: EventHub::new(),
            next_item_id: AtomicU64::new(1),
            next_version_id: AtomicU64::new(1),
            next_notification_id: AtomicU64::new(1),
            connect_failures: AtomicUsize::new(0),
        }
    }

    /// Create a content item owned by `owner`.
    pub fn create_item(&self, owner: UserId, title: impl Into<String>) -> ContentItem {
        let id = ContentItemId(self.next_item_id.fetch_add(1, Ordering::SeqCst));
        let item = ContentItem::new(id, owner, title);
        self.state.lock().items.insert(id, item.clone());
        item
    }

    /// Publish a comment on an item's review thread.
    ///
    /// Comments live outside the engine's stores; only their change events
    /// matter for synchronization.
    pub fn publish_comment(&self, item: ContentItemId, author: &UserId, body: impl Into<String>) {
        let event = ChangeEvent::new(
            EntityKind::Comment,
            item.0.to_string(),
            ChangeOp::Insert,
            json!({ "content_item_id": item.0, "author": author.as_str(), "body": body.into() }),
            author.clone(),
        );
        self.hub.publish(event);
    }

    /// Reject the next `n` stream connects, to exercise backoff paths.
    pub fn fail_next_connects(&self, n: usize) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Drop every live stream for one (entity, scope), simulating an
    /// unexpected disconnect.
    pub fn disconnect_streams(&self, entity: EntityKind, scope_key: &str) {
        self.hub.disconnect(&(entity, scope_key.to_string()));
    }

    /// Drop every live stream.
    pub fn disconnect_all_streams(&self) {
        self.hub.disconnect_all();
    }

    /// Number of live streams for one (entity, scope).
    pub fn live_stream_count(&self, entity: EntityKind, scope_key: &str) -> usize {
        self.hub.live_stream_count(&(entity, scope_key.to_string()))
    }

    fn publish_version_event(&self, version: &ContentVersion, op: ChangeOp, actor: &UserId) {
        let payload = serde_json::to_value(version).unwrap_or(serde_json::Value::Null);
        self.hub.publish(ChangeEvent::new(
            EntityKind::ContentVersion,
            version.content_item_id.0.to_string(),
            op,
            payload,
            actor.clone(),
        ));
    }

    fn publish_notification_event(&self, notification: &Notification, op: ChangeOp, origin: &UserId) {
        let payload = serde_json::to_value(notification).unwrap_or(serde_json::Value::Null);
        self.hub.publish(ChangeEvent::new(
            EntityKind::Notification,
            notification.recipient.as_str().to_string(),
            op,
            payload,
            origin.clone(),
        ));
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeStreamTransport for MemoryBackend {
    async fn connect(
        &self,
        entity: EntityKind,
        filter: &StreamFilter,
    ) -> Result<EventReceiver, Error> {
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Connection("simulated connect failure".into()));
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.hub.register((entity, filter.value.clone()), tx);
        debug!(entity = %entity, scope = %filter.value, "stream connected");
        Ok(rx)
    }
}

#[async_trait]
impl ReviewStore for MemoryBackend {
    async fn content_item(&self, id: ContentItemId) -> Result<ContentItem, Error> {
        self.state
            .lock()
            .items
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn version(&self, id: VersionId) -> Result<ContentVersion, Error> {
        self.state
            .lock()
            .versions
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn transition(
        &self,
        version_id: VersionId,
        expected: VersionStatus,
        next: VersionStatus,
        actor: &UserId,
    ) -> Result<ContentVersion, Error> {
        let updated = {
            let mut state = self.state.lock();
            let version = state
                .versions
                .get_mut(&version_id)
                .ok_or_else(|| Error::NotFound(version_id.to_string()))?;
            if version.status != expected {
                return Err(Error::Conflict {
                    version_id,
                    status: version.status,
                });
            }
            if !expected.can_transition_to(next) {
                return Err(Error::Validation(format!(
                    "illegal transition {expected} -> {next}"
                )));
            }
            version.status = next;
            version.clone()
        };
        self.publish_version_event(&updated, ChangeOp::Update, actor);
        Ok(updated)
    }

    async fn record_decision(&self, action: &ApprovalAction) -> Result<ContentVersion, Error> {
        let updated = {
            let mut state = self.state.lock();
            let version = state
                .versions
                .get_mut(&action.version_id)
                .ok_or_else(|| Error::NotFound(action.version_id.to_string()))?;
            if version.content_item_id != action.content_item_id {
                return Err(Error::Validation(format!(
                    "version {} does not belong to {}",
                    action.version_id, action.content_item_id
                )));
            }
            if version.status != VersionStatus::Submitted {
                return Err(Error::Conflict {
                    version_id: action.version_id,
                    status: version.status,
                });
            }
            version.status = action.decision.resulting_status();
            let updated = version.clone();
            state.decisions.push(action.clone());
            updated
        };
        self.publish_version_event(&updated, ChangeOp::Update, &action.actor);
        Ok(updated)
    }

    async fn create_draft(
        &self,
        content_item_id: ContentItemId,
        author: &UserId,
    ) -> Result<ContentVersion, Error> {
        let id = VersionId(self.next_version_id.fetch_add(1, Ordering::SeqCst));
        let draft = {
            let mut state = self.state.lock();
            if !state.items.contains_key(&content_item_id) {
                return Err(Error::NotFound(content_item_id.to_string()));
            }
            let draft = ContentVersion::draft(id, content_item_id, author.clone());
            if let Some(prev_id) = state
                .history
                .get(&content_item_id)
                .and_then(|ids| ids.last().copied())
            {
                if let Some(prev) = state.versions.get_mut(&prev_id) {
                    prev.superseded_by = Some(id);
                }
            }
            state.versions.insert(id, draft.clone());
            state.history.entry(content_item_id).or_default().push(id);
            draft
        };
        self.publish_version_event(&draft, ChangeOp::Insert, author);
        Ok(draft)
    }

    async fn latest_version(
        &self,
        content_item_id: ContentItemId,
    ) -> Result<Option<ContentVersion>, Error> {
        let state = self.state.lock();
        Ok(state
            .history
            .get(&content_item_id)
            .and_then(|ids| ids.last())
            .and_then(|id| state.versions.get(id))
            .cloned())
    }

    async fn decisions(&self, content_item_id: ContentItemId) -> Result<Vec<ApprovalAction>, Error> {
        Ok(self
            .state
            .lock()
            .decisions
            .iter()
            .filter(|a| a.content_item_id == content_item_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl NotificationStore for MemoryBackend {
    async fn insert_unique(
        &self,
        draft: NotificationDraft,
        origin: &UserId,
    ) -> Result<Option<Notification>, Error> {
        let created = {
            let mut state = self.state.lock();
            if state.idempotency_keys.contains(&draft.idempotency_key) {
                debug!(key = %draft.idempotency_key, "duplicate notification suppressed");
                return Ok(None);
            }
            state.idempotency_keys.insert(draft.idempotency_key.clone());
            let id = NotificationId(self.next_notification_id.fetch_add(1, Ordering::SeqCst));
            let notification = Notification::new(
                id,
                draft.recipient,
                draft.kind,
                draft.title,
                draft.body,
                draft.metadata,
                draft.idempotency_key,
            );
            state.notifications.push(notification.clone());
            notification
        };
        self.publish_notification_event(&created, ChangeOp::Insert, origin);
        Ok(Some(created))
    }

    async fn list(&self, recipient: &UserId, limit: usize) -> Result<Vec<Notification>, Error> {
        Ok(self
            .state
            .lock()
            .notifications
            .iter()
            .rev()
            .filter(|n| &n.recipient == recipient)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn unread_count(&self, recipient: &UserId) -> Result<usize, Error> {
        Ok(self
            .state
            .lock()
            .notifications
            .iter()
            .filter(|n| &n.recipient == recipient && !n.read)
            .count())
    }

    async fn mark_read(&self, id: NotificationId) -> Result<Notification, Error> {
        let updated = {
            let mut state = self.state.lock();
            let notification = state
                .notifications
                .iter_mut()
                .find(|n| n.id == id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            notification.read = true;
            notification.clone()
        };
        let recipient = updated.recipient.clone();
        self.publish_notification_event(&updated, ChangeOp::Update, &recipient);
        Ok(updated)
    }

    async fn mark_all_read(&self, recipient: &UserId) -> Result<usize, Error> {
        let flipped: Vec<Notification> = {
            let mut state = self.state.lock();
            state
                .notifications
                .iter_mut()
                .filter(|n| &n.recipient == recipient && !n.read)
                .map(|n| {
                    n.read = true;
                    n.clone()
                })
                .collect()
        };
        for notification in &flipped {
            self.publish_notification_event(notification, ChangeOp::Update, recipient);
        }
        Ok(flipped.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn submitted_version(
        backend: &MemoryBackend,
        owner: &UserId,
    ) -> (ContentItem, ContentVersion) {
        let item = backend.create_item(owner.clone(), "Q3 campaign copy");
        let draft = backend.create_draft(item.id, owner).await.unwrap();
        let version = backend
            .transition(draft.id, VersionStatus::Draft, VersionStatus::Submitted, owner)
            .await
            .unwrap();
        (item, version)
    }

    #[tokio::test]
    async fn test_record_decision_requires_submitted() {
        let backend = MemoryBackend::new();
        let owner = UserId::new("owner");
        let (item, version) = submitted_version(&backend, &owner).await;

        let action = ApprovalAction::new(
            item.id,
            version.id,
            UserId::new("reviewer"),
            revsync_proto::ReviewDecision::Approve,
            None,
        );
        let updated = backend.record_decision(&action).await.unwrap();
        assert_eq!(updated.status, VersionStatus::Approved);

        // Second decision on the same version conflicts.
        let err = backend.record_decision(&action).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_create_draft_links_superseded_by() {
        let backend = MemoryBackend::new();
        let owner = UserId::new("owner");
        let item = backend.create_item(owner.clone(), "doc");

        let v1 = backend.create_draft(item.id, &owner).await.unwrap();
        let v2 = backend.create_draft(item.id, &owner).await.unwrap();
        let v1_reloaded = backend.version(v1.id).await.unwrap();
        assert_eq!(v1_reloaded.superseded_by, Some(v2.id));
        assert_eq!(v2.superseded_by, None);
    }

    #[tokio::test]
    async fn test_mutations_reach_connected_streams() {
        let backend = MemoryBackend::new();
        let owner = UserId::new("owner");
        let item = backend.create_item(owner.clone(), "doc");

        let filter = StreamFilter::equals("content_item_id", item.id.0.to_string());
        let mut rx = backend
            .connect(EntityKind::ContentVersion, &filter)
            .await
            .unwrap();

        backend.create_draft(item.id, &owner).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.entity, EntityKind::ContentVersion);
        assert_eq!(event.op, ChangeOp::Insert);
        assert_eq!(event.origin_actor, owner);
    }

    #[tokio::test]
    async fn test_disconnect_ends_streams() {
        let backend = MemoryBackend::new();
        let filter = StreamFilter::equals("recipient_id", "u1");
        let mut rx = backend
            .connect(EntityKind::Notification, &filter)
            .await
            .unwrap();

        assert_eq!(backend.live_stream_count(EntityKind::Notification, "u1"), 1);
        backend.disconnect_streams(EntityKind::Notification, "u1");
        assert!(rx.recv().await.is_none());
        assert_eq!(backend.live_stream_count(EntityKind::Notification, "u1"), 0);
    }

    #[tokio::test]
    async fn test_fail_next_connects() {
        let backend = MemoryBackend::new();
        backend.fail_next_connects(1);
        let filter = StreamFilter::equals("recipient_id", "u1");

        let err = backend
            .connect(EntityKind::Notification, &filter)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(backend
            .connect(EntityKind::Notification, &filter)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_idempotent_notification_insert() {
        let backend = MemoryBackend::new();
        let origin = UserId::new("reviewer");
        let draft = NotificationDraft {
            recipient: UserId::new("owner"),
            kind: revsync_proto::NotificationKind::VersionApproved,
            title: "Approved".into(),
            body: "v1 approved".into(),
            metadata: json!({}),
            idempotency_key: "k1".into(),
        };

        let first = backend.insert_unique(draft.clone(), &origin).await.unwrap();
        assert!(first.is_some());
        let second = backend.insert_unique(draft, &origin).await.unwrap();
        assert!(second.is_none());
        assert_eq!(backend.unread_count(&UserId::new("owner")).await.unwrap(), 1);
    }
}
