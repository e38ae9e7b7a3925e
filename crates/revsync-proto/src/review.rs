//! Review-workflow domain types.
//!
//! A content item accumulates versions; each version moves through the
//! review state machine `Draft -> Submitted -> {Approved | ChangesRequested}`.
//! A version with changes requested is superseded by a fresh draft — it never
//! returns to `Draft` itself.

use serde::{Deserialize, Serialize};

use crate::ids::{ContentItemId, UserId, VersionId};

/// Review status of a content version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionStatus {
    /// Being authored; not yet visible to reviewers.
    Draft,
    /// Awaiting review.
    Submitted,
    /// Accepted by a reviewer. Terminal.
    Approved,
    /// Sent back by a reviewer. Terminal for this version; a new draft
    /// version supersedes it.
    ChangesRequested,
}

impl VersionStatus {
    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: VersionStatus) -> bool {
        matches!(
            (self, next),
            (VersionStatus::Draft, VersionStatus::Submitted)
                | (VersionStatus::Submitted, VersionStatus::Approved)
                | (VersionStatus::Submitted, VersionStatus::ChangesRequested)
        )
    }
}

impl std::fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VersionStatus::Draft => "draft",
            VersionStatus::Submitted => "submitted",
            VersionStatus::Approved => "approved",
            VersionStatus::ChangesRequested => "changes_requested",
        };
        f.write_str(s)
    }
}

/// A content item under review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    /// Unique item identifier.
    pub id: ContentItemId,
    /// The user who owns the item and receives review outcomes.
    pub owner: UserId,
    /// Human-readable title.
    pub title: String,
}

impl ContentItem {
    /// Create a new content item.
    pub fn new(id: ContentItemId, owner: UserId, title: impl Into<String>) -> Self {
        Self {
            id,
            owner,
            title: title.into(),
        }
    }
}

/// One version of a content item.
///
/// Immutable once superseded by a newer version; only the workflow engine
/// mutates `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentVersion {
    /// Unique version identifier.
    pub id: VersionId,
    /// The content item this version belongs to.
    pub content_item_id: ContentItemId,
    /// Current review status.
    pub status: VersionStatus,
    /// Automated compliance score, when one was computed.
    pub compliance_score: Option<f32>,
    /// Author of this version.
    pub created_by: UserId,
    /// Creation timestamp in microseconds since epoch.
    pub created_at_micros: u64,
    /// Version that replaced this one, once changes were requested.
    pub superseded_by: Option<VersionId>,
}

impl ContentVersion {
    /// Create a new draft version.
    pub fn draft(id: VersionId, content_item_id: ContentItemId, created_by: UserId) -> Self {
        Self {
            id,
            content_item_id,
            status: VersionStatus::Draft,
            compliance_score: None,
            created_by,
            created_at_micros: crate::time::now_micros(),
            superseded_by: None,
        }
    }

    /// Attach a compliance score.
    pub fn with_compliance_score(mut self, score: f32) -> Self {
        self.compliance_score = Some(score);
        self
    }
}

/// A reviewer's decision on a submitted version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReviewDecision {
    /// Accept the version as-is.
    Approve,
    /// Send the version back with mandatory feedback.
    RequestChanges,
}

impl ReviewDecision {
    /// The status a successful decision transitions the version to.
    pub fn resulting_status(&self) -> VersionStatus {
        match self {
            ReviewDecision::Approve => VersionStatus::Approved,
            ReviewDecision::RequestChanges => VersionStatus::ChangesRequested,
        }
    }
}

/// Write-once audit record of a review decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalAction {
    /// The content item the decision applies to.
    pub content_item_id: ContentItemId,
    /// The version the decision applies to.
    pub version_id: VersionId,
    /// Reviewer who made the decision.
    pub actor: UserId,
    /// The decision taken.
    pub decision: ReviewDecision,
    /// Reviewer feedback. Mandatory for `RequestChanges`.
    pub feedback: Option<String>,
    /// Decision timestamp in microseconds since epoch.
    pub timestamp_micros: u64,
}

impl ApprovalAction {
    /// Create a new approval action stamped with the current time.
    pub fn new(
        content_item_id: ContentItemId,
        version_id: VersionId,
        actor: UserId,
        decision: ReviewDecision,
        feedback: Option<String>,
    ) -> Self {
        Self {
            content_item_id,
            version_id,
            actor,
            decision,
            feedback,
            timestamp_micros: crate::time::now_micros(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        assert!(VersionStatus::Draft.can_transition_to(VersionStatus::Submitted));
        assert!(VersionStatus::Submitted.can_transition_to(VersionStatus::Approved));
        assert!(VersionStatus::Submitted.can_transition_to(VersionStatus::ChangesRequested));
    }

    #[test]
    fn test_no_cycle_back_to_draft() {
        for status in [
            VersionStatus::Submitted,
            VersionStatus::Approved,
            VersionStatus::ChangesRequested,
        ] {
            assert!(!status.can_transition_to(VersionStatus::Draft));
        }
        // Terminal states go nowhere.
        assert!(!VersionStatus::Approved.can_transition_to(VersionStatus::Submitted));
        assert!(!VersionStatus::ChangesRequested.can_transition_to(VersionStatus::Submitted));
    }

    #[test]
    fn test_decision_resulting_status() {
        assert_eq!(
            ReviewDecision::Approve.resulting_status(),
            VersionStatus::Approved
        );
        assert_eq!(
            ReviewDecision::RequestChanges.resulting_status(),
            VersionStatus::ChangesRequested
        );
    }
}
