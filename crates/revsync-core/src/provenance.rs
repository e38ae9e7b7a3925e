//! Provenance ledger for locally-initiated mutations.
//!
//! When a session mutates something, the change stream echoes the mutation
//! back as a change event with the session's own actor as origin. The ledger
//! lets the session tell that echo apart from a genuinely remote change:
//! [`ProvenanceLedger::record`] tags the outgoing mutation, and
//! [`ProvenanceLedger::confirm`] consumes the tag exactly once when the
//! matching event arrives. A failed mutation retracts its tag so a later
//! remote event with the same shape is not swallowed.

use std::collections::HashMap;

use parking_lot::Mutex;
use revsync_proto::{ChangeEvent, ChangeOp, EntityKind, UserId};
use tracing::debug;

/// Identity of one locally-initiated mutation, as it will appear on the
/// change stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    /// Acting user.
    pub actor: UserId,
    /// Entity the mutation touches.
    pub entity: EntityKind,
    /// Scope key the echo will carry.
    pub scope_key: String,
    /// Operation the echo will carry.
    pub op: ChangeOp,
}

impl Tag {
    /// Tag for a mutation by `actor` on one (entity, scope, op).
    pub fn new(
        actor: UserId,
        entity: EntityKind,
        scope_key: impl Into<String>,
        op: ChangeOp,
    ) -> Self {
        Self {
            actor,
            entity,
            scope_key: scope_key.into(),
            op,
        }
    }

    fn matches(&self, event: &ChangeEvent) -> bool {
        event.origin_actor == self.actor
            && event.entity == self.entity
            && event.scope_key == self.scope_key
            && event.op == self.op
    }
}

/// Counts outstanding tags; each confirms at most one echoed event.
#[derive(Default)]
pub struct ProvenanceLedger {
    pending: Mutex<HashMap<Tag, usize>>,
}

impl ProvenanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an about-to-run local mutation.
    pub fn record(&self, tag: Tag) {
        let mut pending = self.pending.lock();
        *pending.entry(tag).or_insert(0) += 1;
    }

    /// Withdraw a tag after the mutation failed, so its shape does not
    /// swallow a later remote event.
    pub fn retract(&self, tag: &Tag) {
        let mut pending = self.pending.lock();
        if let Some(count) = pending.get_mut(tag) {
            *count -= 1;
            if *count == 0 {
                pending.remove(tag);
            }
        }
    }

    /// Whether `event` confirms a recorded local mutation. Consumes one
    /// matching tag; a second identical event reads as a remote change.
    pub fn confirm(&self, event: &ChangeEvent) -> bool {
        let mut pending = self.pending.lock();
        let matched = pending
            .keys()
            .find(|tag| tag.matches(event))
            .cloned();
        match matched {
            Some(tag) => {
                let count = pending.get_mut(&tag).map(|c| {
                    *c -= 1;
                    *c
                });
                if count == Some(0) {
                    pending.remove(&tag);
                }
                debug!(
                    entity = %event.entity,
                    scope = %event.scope_key,
                    op = ?event.op,
                    "self-originated event confirmed"
                );
                true
            }
            None => false,
        }
    }

    /// Number of tags awaiting confirmation.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().values().sum()
    }
}
