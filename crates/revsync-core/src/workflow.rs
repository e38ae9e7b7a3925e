//! Review workflow engine.
//!
//! Drives the per-version state machine `Draft -> Submitted -> {Approved |
//! ChangesRequested}` with single-flight protection per version: while one
//! review call is in flight, a concurrent call for the same version is
//! rejected instead of queued. The status transition and the audit record
//! are applied atomically by the store; notification fan-out afterwards is
//! non-fatal — a delivery failure never rolls the transition back.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use revsync_proto::{
    ApprovalAction, ContentItemId, ContentVersion, NotificationKind, ReviewDecision, UserId,
    VersionId, VersionStatus,
};
use serde_json::json;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::backend::ReviewStore;
use crate::cache::{CacheKey, QueryCache};
use crate::error::Error;
use crate::notify::{FanoutSource, NotificationFanout};

/// Review workflow engine.
pub struct ReviewEngine {
    store: Arc<dyn ReviewStore>,
    fanout: Arc<NotificationFanout>,
    cache: Arc<QueryCache>,
    in_flight: Arc<DashMap<VersionId, ()>>,
    request_timeout: Duration,
}

/// Clears the in-flight mark on every exit path.
struct InFlightGuard {
    map: Arc<DashMap<VersionId, ()>>,
    version_id: VersionId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.map.remove(&self.version_id);
    }
}

impl ReviewEngine {
    /// Create an engine over a review store and a notification fan-out.
    /// Submission and decision transitions invalidate the owner's review
    /// queue in `cache`.
    pub fn new(
        store: Arc<dyn ReviewStore>,
        fanout: Arc<NotificationFanout>,
        cache: Arc<QueryCache>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            fanout,
            cache,
            in_flight: Arc::new(DashMap::new()),
            request_timeout,
        }
    }

    /// Whether a review call for this version is currently in flight.
    pub fn is_in_flight(&self, version_id: VersionId) -> bool {
        self.in_flight.contains_key(&version_id)
    }

    fn begin(&self, version_id: VersionId) -> Result<InFlightGuard, Error> {
        use dashmap::mapref::entry::Entry;
        match self.in_flight.entry(version_id) {
            Entry::Occupied(_) => Err(Error::InFlight(version_id)),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(InFlightGuard {
                    map: self.in_flight.clone(),
                    version_id,
                })
            }
        }
    }

    /// Bound a store call with the request timeout. No automatic retry:
    /// retrying a review mutation without a transport-level idempotency key
    /// is unsafe, so expiry surfaces as an error.
    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        timeout(self.request_timeout, fut)
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Approve a submitted version.
    ///
    /// Fails with [`Error::Conflict`] when the version is not `Submitted`
    /// (already reviewed, or superseded) and [`Error::InFlight`] when a
    /// concurrent call for the same version is still running.
    pub async fn approve(
        &self,
        content_item_id: ContentItemId,
        version_id: VersionId,
        actor: &UserId,
        feedback: Option<String>,
    ) -> Result<ApprovalAction, Error> {
        let _guard = self.begin(version_id)?;
        self.decide(content_item_id, version_id, actor, ReviewDecision::Approve, feedback)
            .await
    }

    /// Request changes on a submitted version. Feedback is mandatory.
    pub async fn request_changes(
        &self,
        content_item_id: ContentItemId,
        version_id: VersionId,
        actor: &UserId,
        feedback: String,
    ) -> Result<ApprovalAction, Error> {
        if feedback.trim().is_empty() {
            return Err(Error::Validation(
                "feedback is required when requesting changes".into(),
            ));
        }
        let _guard = self.begin(version_id)?;
        self.decide(
            content_item_id,
            version_id,
            actor,
            ReviewDecision::RequestChanges,
            Some(feedback),
        )
        .await
    }

    async fn decide(
        &self,
        content_item_id: ContentItemId,
        version_id: VersionId,
        actor: &UserId,
        decision: ReviewDecision,
        feedback: Option<String>,
    ) -> Result<ApprovalAction, Error> {
        let version = self.bounded(self.store.version(version_id)).await?;
        if version.content_item_id != content_item_id {
            return Err(Error::Validation(format!(
                "version {version_id} does not belong to {content_item_id}"
            )));
        }
        if version.status != VersionStatus::Submitted {
            return Err(Error::Conflict {
                version_id,
                status: version.status,
            });
        }

        let action = ApprovalAction::new(
            content_item_id,
            version_id,
            actor.clone(),
            decision,
            feedback,
        );
        let updated = self.bounded(self.store.record_decision(&action)).await?;
        info!(
            version_id = %version_id,
            actor = %actor,
            status = %updated.status,
            "review decision recorded"
        );

        let owner = self.resolve_owner(updated.content_item_id).await;
        if let Some(owner) = &owner {
            // The version left the Submitted state, so the owner's queue of
            // pending reviews changed.
            self.cache
                .invalidate(&CacheKey::ReviewQueue(owner.to_string()));
        }
        self.fan_out_decision(&updated, &action, owner).await;
        Ok(action)
    }

    /// The content owner, when the item can be loaded. Failures are logged;
    /// the caller degrades instead of failing a transition that already
    /// happened.
    async fn resolve_owner(&self, content_item_id: ContentItemId) -> Option<UserId> {
        match self.bounded(self.store.content_item(content_item_id)).await {
            Ok(item) => Some(item.owner),
            Err(e) => {
                warn!(
                    content_item_id = %content_item_id,
                    error = %e,
                    "could not resolve content owner"
                );
                None
            }
        }
    }

    /// Notify the content owner and the submitter of a recorded decision.
    /// Non-fatal by design: the transition already happened.
    async fn fan_out_decision(
        &self,
        version: &ContentVersion,
        action: &ApprovalAction,
        owner: Option<UserId>,
    ) {
        let mut recipients = vec![version.created_by.clone()];
        recipients.extend(owner);
        recipients.retain(|r| r != &action.actor);

        let (kind, title) = match action.decision {
            ReviewDecision::Approve => (NotificationKind::VersionApproved, "Version approved"),
            ReviewDecision::RequestChanges => {
                (NotificationKind::ChangesRequested, "Changes requested")
            }
        };
        let body = match &action.feedback {
            Some(feedback) => format!("{}: {}", version.id, feedback),
            None => version.id.to_string(),
        };
        let source = FanoutSource {
            kind,
            content_item_id: action.content_item_id,
            version_id: action.version_id,
        };
        let metadata = json!({
            "content_item_id": action.content_item_id.0,
            "version_id": action.version_id.0,
            "decision": kind.as_str(),
        });
        self.fanout
            .notify(&recipients, source, title, &body, metadata, &action.actor)
            .await;
    }

    /// Submit a draft version for review and notify the content owner.
    pub async fn submit(
        &self,
        version_id: VersionId,
        actor: &UserId,
    ) -> Result<ContentVersion, Error> {
        let _guard = self.begin(version_id)?;
        let updated = self
            .bounded(self.store.transition(
                version_id,
                VersionStatus::Draft,
                VersionStatus::Submitted,
                actor,
            ))
            .await?;
        info!(version_id = %version_id, actor = %actor, "version submitted for review");

        let owner = self.resolve_owner(updated.content_item_id).await;
        if let Some(owner) = &owner {
            // A newly submitted version joins the owner's pending queue.
            self.cache
                .invalidate(&CacheKey::ReviewQueue(owner.to_string()));
        }
        let mut recipients: Vec<UserId> = owner.into_iter().collect();
        recipients.retain(|r| r != actor);
        let source = FanoutSource {
            kind: NotificationKind::VersionSubmitted,
            content_item_id: updated.content_item_id,
            version_id,
        };
        self.fanout
            .notify(
                &recipients,
                source,
                "Version submitted",
                &format!("{} is ready for review", version_id),
                json!({
                    "content_item_id": updated.content_item_id.0,
                    "version_id": version_id.0,
                }),
                actor,
            )
            .await;
        Ok(updated)
    }

    /// Create the successor draft after changes were requested.
    ///
    /// The predecessor stays `ChangesRequested` and is linked to the new
    /// draft via `superseded_by`; the state machine never returns a version
    /// to `Draft`.
    pub async fn create_revision(
        &self,
        content_item_id: ContentItemId,
        author: &UserId,
    ) -> Result<ContentVersion, Error> {
        let latest = self
            .bounded(self.store.latest_version(content_item_id))
            .await?
            .ok_or_else(|| Error::NotFound(content_item_id.to_string()))?;
        if latest.status != VersionStatus::ChangesRequested {
            return Err(Error::Conflict {
                version_id: latest.id,
                status: latest.status,
            });
        }
        let draft = self
            .bounded(self.store.create_draft(content_item_id, author))
            .await?;
        info!(
            content_item_id = %content_item_id,
            version_id = %draft.id,
            supersedes = %latest.id,
            "revision draft created"
        );
        Ok(draft)
    }

    /// The audit trail for an item, oldest first.
    pub async fn decisions(
        &self,
        content_item_id: ContentItemId,
    ) -> Result<Vec<ApprovalAction>, Error> {
        self.bounded(self.store.decisions(content_item_id)).await
    }
}
