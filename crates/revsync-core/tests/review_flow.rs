//! End-to-end review workflow scenarios over the in-memory backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use revsync_core::backend::{MemoryBackend, ReviewStore};
use revsync_core::cache::{CacheKey, Lookup};
use revsync_core::channel::ChannelStatus;
use revsync_core::error::Error;
use revsync_core::registry::EventHandler;
use revsync_core::session::{ReviewSession, SubscriptionHandle};
use revsync_core::SyncConfig;
use revsync_proto::{
    ContentItem, ContentItemId, NotificationKind, ReviewDecision, UserId, VersionStatus,
};
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct TestContext {
    backend: Arc<MemoryBackend>,
    owner: ReviewSession,
    reviewer: ReviewSession,
}

impl TestContext {
    fn new() -> Self {
        init_tracing();
        let backend = Arc::new(MemoryBackend::new());
        let config = SyncConfig::new()
            .with_handshake_timeout(Duration::from_millis(200))
            .with_backoff(Duration::from_millis(10), Duration::from_millis(30));
        let owner = ReviewSession::new(
            UserId::new("owner"),
            backend.clone(),
            backend.clone(),
            backend.clone(),
            config.clone(),
        );
        let reviewer = ReviewSession::new(
            UserId::new("reviewer"),
            backend.clone(),
            backend.clone(),
            backend.clone(),
            config,
        );
        Self {
            backend,
            owner,
            reviewer,
        }
    }

    fn create_item(&self) -> ContentItem {
        self.backend
            .create_item(self.owner.user().clone(), "launch post")
    }

    async fn connected(&self, handle: &SubscriptionHandle) {
        timeout(Duration::from_secs(2), async {
            loop {
                if handle.status().unwrap() == ChannelStatus::Connected {
                    return;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("channel never connected");
    }

    async fn wait_count(&self, counter: &Arc<AtomicU64>, at_least: u64) {
        timeout(Duration::from_secs(2), async {
            while counter.load(Ordering::SeqCst) < at_least {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("events never arrived");
    }
}

fn counting_handler() -> (Arc<AtomicU64>, EventHandler) {
    let counter = Arc::new(AtomicU64::new(0));
    let inner = counter.clone();
    (
        counter,
        Arc::new(move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    )
}

#[tokio::test]
async fn test_submit_approve_notifies_submitter() {
    let ctx = TestContext::new();
    let item = ctx.create_item();
    let draft = ctx
        .backend
        .create_draft(item.id, ctx.owner.user())
        .await
        .unwrap();

    assert_eq!(ctx.owner.unread_count().await.unwrap(), 0);

    ctx.owner.submit(item.id, draft.id).await.unwrap();
    let action = ctx
        .reviewer
        .approve(item.id, draft.id, Some("ship it".into()))
        .await
        .unwrap();
    assert_eq!(action.decision, ReviewDecision::Approve);

    let version = ctx.backend.version(draft.id).await.unwrap();
    assert_eq!(version.status, VersionStatus::Approved);

    // The submitter sees exactly one new unread approval notification.
    assert_eq!(ctx.owner.unread_count().await.unwrap(), 1);
    let inbox = ctx.owner.notifications(10).await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].kind, NotificationKind::VersionApproved);
    assert!(!inbox[0].read);

    // The audit trail has the single decision.
    let trail = ctx.owner.engine().decisions(item.id).await.unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].actor, *ctx.reviewer.user());
}

#[tokio::test]
async fn test_full_revision_cycle() {
    let ctx = TestContext::new();
    let item = ctx.create_item();
    let v1 = ctx
        .backend
        .create_draft(item.id, ctx.owner.user())
        .await
        .unwrap();

    ctx.owner.submit(item.id, v1.id).await.unwrap();
    ctx.reviewer
        .request_changes(item.id, v1.id, "tighten the intro".into())
        .await
        .unwrap();

    let v2 = ctx.owner.create_revision(item.id).await.unwrap();
    assert_eq!(v2.status, VersionStatus::Draft);

    let superseded = ctx.backend.version(v1.id).await.unwrap();
    assert_eq!(superseded.status, VersionStatus::ChangesRequested);
    assert_eq!(superseded.superseded_by, Some(v2.id));

    ctx.owner.submit(item.id, v2.id).await.unwrap();
    ctx.reviewer.approve(item.id, v2.id, None).await.unwrap();
    let approved = ctx.backend.version(v2.id).await.unwrap();
    assert_eq!(approved.status, VersionStatus::Approved);

    // The first version stays terminal; approving it again conflicts.
    let err = ctx
        .reviewer
        .approve(item.id, v1.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
}

#[tokio::test]
async fn test_concurrent_reviewers_one_winner() {
    let ctx = TestContext::new();
    let item = ctx.create_item();
    let draft = ctx
        .backend
        .create_draft(item.id, ctx.owner.user())
        .await
        .unwrap();
    ctx.owner.submit(item.id, draft.id).await.unwrap();

    let second_reviewer = ReviewSession::new(
        UserId::new("reviewer-2"),
        ctx.backend.clone(),
        ctx.backend.clone(),
        ctx.backend.clone(),
        SyncConfig::new(),
    );

    let (a, b) = tokio::join!(
        ctx.reviewer.approve(item.id, draft.id, None),
        second_reviewer.request_changes(item.id, draft.id, "hold on".into()),
    );
    let winners = [a.is_ok(), b.is_ok()].iter().filter(|&&ok| ok).count();
    assert_eq!(winners, 1);

    let version = ctx.backend.version(draft.id).await.unwrap();
    assert_ne!(version.status, VersionStatus::Submitted);
    assert_eq!(
        ctx.owner.engine().decisions(item.id).await.unwrap().len(),
        1
    );
    // Exactly one unread notification reached the submitter.
    assert_eq!(ctx.owner.unread_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_version_events_decode_into_typed_rows() {
    let ctx = TestContext::new();
    let item = ctx.create_item();
    let draft = ctx
        .backend
        .create_draft(item.id, ctx.owner.user())
        .await
        .unwrap();

    // A third participant observes the item's version stream.
    let viewer = ReviewSession::new(
        UserId::new("viewer"),
        ctx.backend.clone(),
        ctx.backend.clone(),
        ctx.backend.clone(),
        SyncConfig::new().with_handshake_timeout(Duration::from_millis(200)),
    );
    let statuses: Arc<parking_lot::Mutex<Vec<VersionStatus>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    let statuses_clone = statuses.clone();
    let handle = viewer.watch_versions(
        item.id,
        Arc::new(move |event| {
            let version: revsync_proto::ContentVersion = event.decode_payload()?;
            statuses_clone.lock().push(version.status);
            Ok(())
        }),
    );
    ctx.connected(&handle).await;

    ctx.owner.submit(item.id, draft.id).await.unwrap();
    ctx.reviewer.approve(item.id, draft.id, None).await.unwrap();

    timeout(Duration::from_secs(2), async {
        while statuses.lock().len() < 2 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("version events never arrived");
    assert_eq!(
        statuses.lock().as_slice(),
        &[VersionStatus::Submitted, VersionStatus::Approved]
    );
}

#[tokio::test]
async fn test_comment_events_invalidate_thread_cache() {
    let ctx = TestContext::new();
    let item = ctx.create_item();

    let (count, handler) = counting_handler();
    let handle = ctx.owner.watch_comments(item.id, handler);
    ctx.connected(&handle).await;

    let key = CacheKey::CommentThread(item.id);
    ctx.owner.cache().set(key.clone(), serde_json::json!([]));

    ctx.backend
        .publish_comment(item.id, ctx.reviewer.user(), "first impressions");
    ctx.wait_count(&count, 1).await;

    assert!(matches!(ctx.owner.cache().get(&key), Lookup::Stale(_)));

    // Events for other items never reach this handler.
    ctx.backend
        .publish_comment(ContentItemId(999), ctx.reviewer.user(), "elsewhere");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_disconnect_reconnect_reconciles_cache() {
    let ctx = TestContext::new();
    let item = ctx.create_item();

    let (count, handler) = counting_handler();
    let handle = ctx.owner.watch_comments(item.id, handler);
    ctx.connected(&handle).await;

    let key = CacheKey::CommentThread(item.id);
    ctx.owner.cache().set(key.clone(), serde_json::json!([]));

    // Sever the stream: the channel must re-dial and mark the thread stale,
    // since anything pushed during the gap was lost.
    ctx.backend
        .disconnect_streams(revsync_proto::EntityKind::Comment, &item.id.0.to_string());

    timeout(Duration::from_secs(2), async {
        loop {
            if matches!(ctx.owner.cache().get(&key), Lookup::Stale(_)) {
                return;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("reconnect never reconciled the cache");
    ctx.connected(&handle).await;

    // The rebuilt stream keeps delivering.
    ctx.backend
        .publish_comment(item.id, ctx.reviewer.user(), "back online");
    ctx.wait_count(&count, 1).await;
}

#[tokio::test]
async fn test_inbox_drain_after_review_burst() {
    let ctx = TestContext::new();
    let item = ctx.create_item();

    for feedback in ["intro", "outro", "title"] {
        let draft = ctx
            .backend
            .create_draft(item.id, ctx.owner.user())
            .await
            .unwrap();
        ctx.owner.submit(item.id, draft.id).await.unwrap();
        ctx.reviewer
            .request_changes(item.id, draft.id, feedback.into())
            .await
            .unwrap();
    }
    assert_eq!(ctx.owner.unread_count().await.unwrap(), 3);

    let flipped = ctx.owner.mark_all_read().await.unwrap();
    assert_eq!(flipped, 3);
    assert_eq!(ctx.owner.unread_count().await.unwrap(), 0);
    assert!(ctx
        .owner
        .notifications(10)
        .await
        .unwrap()
        .iter()
        .all(|n| n.read));

    // Draining again is a no-op.
    assert_eq!(ctx.owner.mark_all_read().await.unwrap(), 0);
}
