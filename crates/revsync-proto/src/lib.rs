//! Revsync protocol types.
//!
//! This crate defines the domain and event types shared between the revsync
//! engine and its backend interfaces.
//!
//! # Modules
//!
//! - [`ids`] - Identifier newtypes
//! - [`event`] - Change events and stream filters
//! - [`review`] - Review-workflow domain records
//! - [`notification`] - In-app notification records
//! - [`error`] - Protocol error types
//!
//! All types derive `serde::Serialize`/`Deserialize`; event and cache
//! payloads interchange as `serde_json::Value`.

pub mod error;
pub mod event;
pub mod ids;
pub mod notification;
pub mod review;

pub use error::Error;

// Re-export commonly used types at crate root
pub use event::{ChangeEvent, ChangeOp, EntityKind, StreamFilter};
pub use ids::{ContentItemId, NotificationId, UserId, VersionId};
pub use notification::{Notification, NotificationKind};
pub use review::{ApprovalAction, ContentItem, ContentVersion, ReviewDecision, VersionStatus};

/// Timestamp helpers.
pub mod time {
    /// Current wall-clock time in microseconds since the Unix epoch.
    pub fn now_micros() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serde_roundtrip() {
        let event = ChangeEvent::new(
            EntityKind::Notification,
            "u1",
            ChangeOp::Insert,
            serde_json::json!({"title": "Approved"}),
            UserId::new("reviewer-1"),
        );
        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: ChangeEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn test_now_micros_is_monotonic_enough() {
        let a = time::now_micros();
        let b = time::now_micros();
        assert!(b >= a);
    }
}
