//! Per-user session facade.
//!
//! Wires the transport, subscription registry, query cache, review engine,
//! notification fan-out and provenance ledger together for one authenticated
//! user. Subscriptions come back as RAII [`SubscriptionHandle`]s that detach
//! on drop, and handlers registered through the session skip events that
//! merely echo the session's own mutations: the ledger confirms the echo and
//! the handler never sees it, while cache invalidation still runs.

use std::sync::Arc;

use revsync_proto::{
    ApprovalAction, ChangeOp, ContentItemId, ContentVersion, EntityKind, Notification,
    NotificationId, StreamFilter, UserId, VersionId,
};
use tracing::warn;

use crate::backend::{ChangeStreamTransport, NotificationStore, ReviewStore};
use crate::cache::{CacheKey, QueryCache};
use crate::channel::ChannelStatus;
use crate::config::SyncConfig;
use crate::error::Error;
use crate::notify::NotificationFanout;
use crate::provenance::{ProvenanceLedger, Tag};
use crate::registry::{EventHandler, SubscriptionId, SubscriptionRegistry};
use crate::workflow::ReviewEngine;

/// Detaches its subscription when dropped.
pub struct SubscriptionHandle {
    registry: Arc<SubscriptionRegistry>,
    id: Option<SubscriptionId>,
}

impl SubscriptionHandle {
    fn new(registry: Arc<SubscriptionRegistry>, id: SubscriptionId) -> Self {
        Self {
            registry,
            id: Some(id),
        }
    }

    /// The underlying subscription id, for manual registry calls.
    pub fn id(&self) -> SubscriptionId {
        // Only `detach` and `Drop` take the id out.
        self.id.unwrap_or(SubscriptionId(0))
    }

    /// Connection status of the subscription's channel.
    pub fn status(&self) -> Result<ChannelStatus, Error> {
        self.registry.status(self.id())
    }

    /// Force the channel to re-dial.
    pub fn reconnect(&self) -> Result<(), Error> {
        self.registry.reconnect(self.id())
    }

    /// Detach now instead of at drop.
    pub fn detach(mut self) -> Result<(), Error> {
        match self.id.take() {
            Some(id) => self.registry.unsubscribe(id),
            None => Ok(()),
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if let Err(e) = self.registry.unsubscribe(id) {
                warn!(subscription_id = %id, error = %e, "drop-time unsubscribe failed");
            }
        }
    }
}

/// One user's live view of the review platform.
pub struct ReviewSession {
    user: UserId,
    registry: Arc<SubscriptionRegistry>,
    cache: Arc<QueryCache>,
    engine: Arc<ReviewEngine>,
    fanout: Arc<NotificationFanout>,
    ledger: Arc<ProvenanceLedger>,
}

impl ReviewSession {
    /// Open a session for `user` over the given backend halves.
    pub fn new(
        user: UserId,
        transport: Arc<dyn ChangeStreamTransport>,
        review_store: Arc<dyn ReviewStore>,
        notification_store: Arc<dyn NotificationStore>,
        config: SyncConfig,
    ) -> Self {
        let cache = Arc::new(QueryCache::new(config.cache_ttls.clone()));
        let fanout = Arc::new(NotificationFanout::new(notification_store, cache.clone()));
        let engine = Arc::new(ReviewEngine::new(
            review_store,
            fanout.clone(),
            cache.clone(),
            config.request_timeout,
        ));
        let registry = Arc::new(SubscriptionRegistry::new(transport, cache.clone(), config));
        Self {
            user,
            registry,
            cache,
            engine,
            fanout,
            ledger: Arc::new(ProvenanceLedger::new()),
        }
    }

    /// The authenticated user this session acts as.
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// The session's query cache.
    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// The session's subscription registry, for manual subscriptions.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// The review engine, for callers that need it directly.
    pub fn engine(&self) -> &Arc<ReviewEngine> {
        &self.engine
    }

    /// Wrap a handler so echoes of this session's own mutations are consumed
    /// as confirmations instead of delivered as remote changes.
    fn guarded(&self, handler: EventHandler) -> EventHandler {
        let ledger = self.ledger.clone();
        Arc::new(move |event| {
            if ledger.confirm(event) {
                return Ok(());
            }
            handler(event)
        })
    }

    /// Watch the comment thread of one content item.
    pub fn watch_comments(
        &self,
        content_item_id: ContentItemId,
        handler: EventHandler,
    ) -> SubscriptionHandle {
        let scope = content_item_id.0.to_string();
        let id = self.registry.subscribe(
            EntityKind::Comment,
            scope.clone(),
            StreamFilter::equals("content_item_id", scope),
            vec![CacheKey::CommentThread(content_item_id)],
            self.guarded(handler),
        );
        SubscriptionHandle::new(self.registry.clone(), id)
    }

    /// Watch the version history of one content item.
    pub fn watch_versions(
        &self,
        content_item_id: ContentItemId,
        handler: EventHandler,
    ) -> SubscriptionHandle {
        let scope = content_item_id.0.to_string();
        let id = self.registry.subscribe(
            EntityKind::ContentVersion,
            scope.clone(),
            StreamFilter::equals("content_item_id", scope),
            vec![CacheKey::VersionHistory(content_item_id)],
            self.guarded(handler),
        );
        SubscriptionHandle::new(self.registry.clone(), id)
    }

    /// Watch this user's notification inbox.
    pub fn watch_notifications(&self, handler: EventHandler) -> SubscriptionHandle {
        let scope = self.user.as_str().to_string();
        let id = self.registry.subscribe(
            EntityKind::Notification,
            scope.clone(),
            StreamFilter::equals("recipient_id", scope),
            vec![
                CacheKey::NotificationList(self.user.clone()),
                CacheKey::UnreadCount(self.user.clone()),
            ],
            self.guarded(handler),
        );
        SubscriptionHandle::new(self.registry.clone(), id)
    }

    fn version_tag(&self, content_item_id: ContentItemId, op: ChangeOp) -> Tag {
        Tag::new(
            self.user.clone(),
            EntityKind::ContentVersion,
            content_item_id.0.to_string(),
            op,
        )
    }

    /// Run a mutation with its echo pre-recorded, retracting on failure.
    async fn tagged<T>(
        &self,
        tag: Tag,
        fut: impl std::future::Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        self.ledger.record(tag.clone());
        let result = fut.await;
        if result.is_err() {
            self.ledger.retract(&tag);
        }
        result
    }

    /// Submit a draft version for review as this user.
    pub async fn submit(
        &self,
        content_item_id: ContentItemId,
        version_id: VersionId,
    ) -> Result<ContentVersion, Error> {
        self.tagged(
            self.version_tag(content_item_id, ChangeOp::Update),
            self.engine.submit(version_id, &self.user),
        )
        .await
    }

    /// Approve a submitted version as this user.
    pub async fn approve(
        &self,
        content_item_id: ContentItemId,
        version_id: VersionId,
        feedback: Option<String>,
    ) -> Result<ApprovalAction, Error> {
        self.tagged(
            self.version_tag(content_item_id, ChangeOp::Update),
            self.engine
                .approve(content_item_id, version_id, &self.user, feedback),
        )
        .await
    }

    /// Request changes on a submitted version as this user.
    pub async fn request_changes(
        &self,
        content_item_id: ContentItemId,
        version_id: VersionId,
        feedback: String,
    ) -> Result<ApprovalAction, Error> {
        self.tagged(
            self.version_tag(content_item_id, ChangeOp::Update),
            self.engine
                .request_changes(content_item_id, version_id, &self.user, feedback),
        )
        .await
    }

    /// Create the successor draft after changes were requested.
    pub async fn create_revision(
        &self,
        content_item_id: ContentItemId,
    ) -> Result<ContentVersion, Error> {
        self.tagged(
            self.version_tag(content_item_id, ChangeOp::Insert),
            self.engine.create_revision(content_item_id, &self.user),
        )
        .await
    }

    /// This user's notifications, newest first.
    pub async fn notifications(&self, limit: usize) -> Result<Vec<Notification>, Error> {
        self.fanout.list(&self.user, limit).await
    }

    /// This user's unread notification count.
    pub async fn unread_count(&self) -> Result<usize, Error> {
        self.fanout.unread_count(&self.user).await
    }

    /// Mark one notification read.
    pub async fn mark_read(&self, id: NotificationId) -> Result<Notification, Error> {
        let tag = Tag::new(
            self.user.clone(),
            EntityKind::Notification,
            self.user.as_str().to_string(),
            ChangeOp::Update,
        );
        self.tagged(tag, self.fanout.mark_read(id)).await
    }

    /// Mark all of this user's notifications read.
    ///
    /// The backend echoes one update event per flipped row; each outstanding
    /// row gets its own tag so the whole batch reads as confirmations.
    pub async fn mark_all_read(&self) -> Result<usize, Error> {
        let tag = Tag::new(
            self.user.clone(),
            EntityKind::Notification,
            self.user.as_str().to_string(),
            ChangeOp::Update,
        );
        let expected = self.fanout.unread_count(&self.user).await?;
        for _ in 0..expected {
            self.ledger.record(tag.clone());
        }
        match self.fanout.mark_all_read(&self.user).await {
            Ok(flipped) => {
                // Reconcile the tag count with what actually flipped.
                if flipped > expected {
                    for _ in expected..flipped {
                        self.ledger.record(tag.clone());
                    }
                } else {
                    for _ in flipped..expected {
                        self.ledger.retract(&tag);
                    }
                }
                Ok(flipped)
            }
            Err(e) => {
                for _ in 0..expected {
                    self.ledger.retract(&tag);
                }
                Err(e)
            }
        }
    }
}
