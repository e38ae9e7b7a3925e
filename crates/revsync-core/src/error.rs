//! Engine error types.

use revsync_proto::{VersionId, VersionStatus};
use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure. Absorbed by the change channel and retried
    /// with backoff; surfaced to consumers only as a connectivity status.
    #[error("connection error: {0}")]
    Connection(String),

    /// The version was already reviewed, possibly by someone else.
    #[error("version {version_id} was already reviewed (status: {status})")]
    Conflict {
        /// The version the decision targeted.
        version_id: VersionId,
        /// Its status at the time of the attempt.
        status: VersionStatus,
    },

    /// Another review call for the same version is still in flight.
    #[error("a review action for {0} is already in flight")]
    InFlight(VersionId),

    /// Caller input failed validation (e.g. blank mandatory feedback).
    #[error("validation error: {0}")]
    Validation(String),

    /// Notification fan-out failed. Non-fatal; logged at the fan-out
    /// boundary, never rolls back a workflow transition.
    #[error("notification delivery failed: {0}")]
    NotificationDelivery(String),

    /// A bounded request or handshake timed out.
    #[error("request timed out")]
    Timeout,

    /// The subscription id is not registered.
    #[error("unknown subscription: {0}")]
    UnknownSubscription(u64),

    /// A referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] revsync_proto::Error),
}

impl Error {
    /// Whether this error is transient and safe to retry with backoff.
    ///
    /// Review mutations are never retried automatically; retrying an
    /// approval without a transport-level idempotency key is unsafe.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_message_names_the_version() {
        let err = Error::Conflict {
            version_id: VersionId(7),
            status: VersionStatus::Approved,
        };
        let msg = err.to_string();
        assert!(msg.contains("v-7"));
        assert!(msg.contains("already reviewed"));
    }

    #[test]
    fn test_proto_errors_convert_to_protocol() {
        let err = Error::from(revsync_proto::Error::InvalidPayload("bad shape".into()));
        assert!(matches!(err, Error::Protocol(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_only_connection_errors_are_transient() {
        assert!(Error::Connection("reset".into()).is_transient());
        assert!(!Error::Timeout.is_transient());
        assert!(!Error::Validation("blank".into()).is_transient());
    }
}
