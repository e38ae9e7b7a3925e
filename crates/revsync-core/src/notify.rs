//! Notification fan-out and read tracking.
//!
//! Creates one notification per affected recipient, deduplicated by an
//! idempotency key over (kind, content item, version, recipient): a repeated
//! call for the same logical event creates nothing. Delivery failures are
//! swallowed here — logged, never propagated into the workflow transition
//! that triggered them. Read-state mutations invalidate the recipient's
//! unread-count and notification-list cache entries.

use std::sync::Arc;

use revsync_proto::{
    ContentItemId, Notification, NotificationId, NotificationKind, UserId, VersionId,
};
use tracing::{debug, warn};

use crate::backend::{NotificationDraft, NotificationStore};
use crate::cache::{CacheKey, QueryCache};
use crate::error::Error;

/// The source action a fan-out call originates from.
#[derive(Debug, Clone, Copy)]
pub struct FanoutSource {
    /// Notification class to create.
    pub kind: NotificationKind,
    /// Content item the source action applies to.
    pub content_item_id: ContentItemId,
    /// Version the source action applies to.
    pub version_id: VersionId,
}

/// Deduplication key for one (source action, recipient) pair.
pub fn idempotency_key(source: &FanoutSource, recipient: &UserId) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source.kind.as_str().as_bytes());
    hasher.update(&source.content_item_id.0.to_le_bytes());
    hasher.update(&source.version_id.0.to_le_bytes());
    hasher.update(recipient.as_str().as_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

/// Notification fan-out and read tracker.
pub struct NotificationFanout {
    store: Arc<dyn NotificationStore>,
    cache: Arc<QueryCache>,
}

impl NotificationFanout {
    /// Create a fan-out writing through `store` and invalidating `cache`.
    pub fn new(store: Arc<dyn NotificationStore>, cache: Arc<QueryCache>) -> Self {
        Self { store, cache }
    }

    /// Create one notification per recipient for a source action.
    ///
    /// Recipients are deduplicated; recipients already notified for this
    /// source action (idempotency-key match) are skipped. Store failures are
    /// logged per recipient and swallowed — the returned list holds only
    /// what was actually created.
    pub async fn notify(
        &self,
        recipients: &[UserId],
        source: FanoutSource,
        title: &str,
        body: &str,
        metadata: serde_json::Value,
        origin: &UserId,
    ) -> Vec<Notification> {
        let mut seen: Vec<&UserId> = Vec::with_capacity(recipients.len());
        let mut created = Vec::new();
        for recipient in recipients {
            if seen.contains(&recipient) {
                continue;
            }
            seen.push(recipient);

            match self
                .deliver_one(recipient, &source, title, body, metadata.clone(), origin)
                .await
            {
                Ok(Some(notification)) => {
                    self.invalidate_recipient(recipient);
                    created.push(notification);
                }
                Ok(None) => {
                    debug!(
                        recipient = %recipient,
                        kind = %source.kind,
                        "duplicate notification suppressed"
                    );
                }
                Err(e) => {
                    warn!(
                        recipient = %recipient,
                        kind = %source.kind,
                        error = %e,
                        "notification delivery failed"
                    );
                }
            }
        }
        created
    }

    async fn deliver_one(
        &self,
        recipient: &UserId,
        source: &FanoutSource,
        title: &str,
        body: &str,
        metadata: serde_json::Value,
        origin: &UserId,
    ) -> Result<Option<Notification>, Error> {
        let draft = NotificationDraft {
            recipient: recipient.clone(),
            kind: source.kind,
            title: title.to_string(),
            body: body.to_string(),
            metadata,
            idempotency_key: idempotency_key(source, recipient),
        };
        self.store
            .insert_unique(draft, origin)
            .await
            .map_err(|e| Error::NotificationDelivery(e.to_string()))
    }

    fn invalidate_recipient(&self, recipient: &UserId) {
        self.cache
            .invalidate(&CacheKey::UnreadCount(recipient.clone()));
        self.cache
            .invalidate(&CacheKey::NotificationList(recipient.clone()));
    }

    /// Mark one notification read and invalidate the recipient's cache
    /// entries.
    pub async fn mark_read(&self, id: NotificationId) -> Result<Notification, Error> {
        let updated = self.store.mark_read(id).await?;
        self.invalidate_recipient(&updated.recipient);
        Ok(updated)
    }

    /// Mark all of a recipient's notifications read.
    pub async fn mark_all_read(&self, recipient: &UserId) -> Result<usize, Error> {
        let flipped = self.store.mark_all_read(recipient).await?;
        self.invalidate_recipient(recipient);
        Ok(flipped)
    }

    /// Unread count, always derived from backing records.
    pub async fn unread_count(&self, recipient: &UserId) -> Result<usize, Error> {
        self.store.unread_count(recipient).await
    }

    /// A recipient's notifications, newest first.
    pub async fn list(
        &self,
        recipient: &UserId,
        limit: usize,
    ) -> Result<Vec<Notification>, Error> {
        self.store.list(recipient, limit).await
    }

    /// Refetch the unread count into the cache; used as the refetch path
    /// for observed unread-count entries.
    pub async fn refresh_unread_count(&self, recipient: &UserId) -> Result<usize, Error> {
        let count = self.store.unread_count(recipient).await?;
        self.cache.set(
            CacheKey::UnreadCount(recipient.clone()),
            serde_json::json!(count),
        );
        Ok(count)
    }

    /// Refetch the notification list into the cache.
    pub async fn refresh_list(
        &self,
        recipient: &UserId,
        limit: usize,
    ) -> Result<Vec<Notification>, Error> {
        let list = self.store.list(recipient, limit).await?;
        let value = serde_json::to_value(&list)
            .map_err(|e| revsync_proto::Error::InvalidPayload(e.to_string()))?;
        self.cache
            .set(CacheKey::NotificationList(recipient.clone()), value);
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::cache::Lookup;
    use crate::config::SyncConfig;
    use serde_json::json;

    fn setup() -> (Arc<MemoryBackend>, Arc<QueryCache>, NotificationFanout) {
        let backend = Arc::new(MemoryBackend::new());
        let cache = Arc::new(QueryCache::new(SyncConfig::new().cache_ttls));
        let fanout = NotificationFanout::new(backend.clone(), cache.clone());
        (backend, cache, fanout)
    }

    fn source() -> FanoutSource {
        FanoutSource {
            kind: NotificationKind::VersionApproved,
            content_item_id: ContentItemId(1),
            version_id: VersionId(1),
        }
    }

    #[test]
    fn test_idempotency_key_varies_per_recipient_and_action() {
        let a = idempotency_key(&source(), &UserId::new("u1"));
        let b = idempotency_key(&source(), &UserId::new("u2"));
        assert_ne!(a, b);

        let other_version = FanoutSource {
            version_id: VersionId(2),
            ..source()
        };
        let c = idempotency_key(&other_version, &UserId::new("u1"));
        assert_ne!(a, c);

        // Same inputs, same key.
        assert_eq!(a, idempotency_key(&source(), &UserId::new("u1")));
    }

    #[tokio::test]
    async fn test_notify_dedups_recipients_and_repeat_calls() {
        let (_backend, _cache, fanout) = setup();
        let owner = UserId::new("owner");
        let reviewer = UserId::new("reviewer");

        let recipients = vec![owner.clone(), owner.clone()];
        let created = fanout
            .notify(&recipients, source(), "Approved", "v1 approved", json!({}), &reviewer)
            .await;
        assert_eq!(created.len(), 1);

        // The same logical event again creates nothing.
        let repeat = fanout
            .notify(&recipients, source(), "Approved", "v1 approved", json!({}), &reviewer)
            .await;
        assert!(repeat.is_empty());
        assert_eq!(fanout.unread_count(&owner).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mark_all_read_zeroes_unread_count() {
        let (_backend, cache, fanout) = setup();
        let owner = UserId::new("owner");
        let reviewer = UserId::new("reviewer");

        for version in [1u64, 2, 3] {
            let src = FanoutSource {
                version_id: VersionId(version),
                ..source()
            };
            fanout
                .notify(&[owner.clone()], src, "Approved", "approved", json!({}), &reviewer)
                .await;
        }
        assert_eq!(fanout.unread_count(&owner).await.unwrap(), 3);

        cache.set(CacheKey::UnreadCount(owner.clone()), json!(3));
        let flipped = fanout.mark_all_read(&owner).await.unwrap();
        assert_eq!(flipped, 3);
        assert_eq!(fanout.unread_count(&owner).await.unwrap(), 0);
        assert!(matches!(
            cache.get(&CacheKey::UnreadCount(owner.clone())),
            Lookup::Stale(_)
        ));

        let all = fanout.list(&owner, 10).await.unwrap();
        assert!(all.iter().all(|n| n.read));
    }

    #[tokio::test]
    async fn test_mark_read_invalidates_recipient_caches() {
        let (_backend, cache, fanout) = setup();
        let owner = UserId::new("owner");
        let reviewer = UserId::new("reviewer");

        let created = fanout
            .notify(&[owner.clone()], source(), "Approved", "approved", json!({}), &reviewer)
            .await;
        cache.set(CacheKey::NotificationList(owner.clone()), json!([]));

        let updated = fanout.mark_read(created[0].id).await.unwrap();
        assert!(updated.read);
        assert!(matches!(
            cache.get(&CacheKey::NotificationList(owner.clone())),
            Lookup::Stale(_)
        ));
    }

    #[tokio::test]
    async fn test_refresh_helpers_populate_cache() {
        let (_backend, cache, fanout) = setup();
        let owner = UserId::new("owner");
        let reviewer = UserId::new("reviewer");

        fanout
            .notify(&[owner.clone()], source(), "Approved", "approved", json!({}), &reviewer)
            .await;

        let count = fanout.refresh_unread_count(&owner).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            cache.get(&CacheKey::UnreadCount(owner.clone())),
            Lookup::Hit(json!(1))
        );

        let list = fanout.refresh_list(&owner, 10).await.unwrap();
        assert_eq!(list.len(), 1);
        assert!(matches!(
            cache.get(&CacheKey::NotificationList(owner)),
            Lookup::Hit(_)
        ));
    }
}
