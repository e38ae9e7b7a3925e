//! Real-time synchronization and review-workflow engine.
//!
//! The crate keeps a client's view of a multi-tenant content-review platform
//! live: server-pushed change streams feed a subscription registry that
//! multiplexes events to handlers and invalidates a typed query cache, while
//! a review engine drives version state transitions with single-flight
//! protection and fans notifications out to affected users.
//!
//! Layering, bottom up:
//! - [`backend`] — the transport and storage traits the engine consumes,
//!   plus [`backend::MemoryBackend`] for tests and embedders.
//! - [`channel`] — one self-healing change stream with jittered backoff.
//! - [`registry`] — refcounted channel dedup and ordered handler dispatch.
//! - [`cache`] — TTL'd query cache with stale marking and refetch observers.
//! - [`workflow`] — the `Draft -> Submitted -> {Approved|ChangesRequested}`
//!   state machine with write-once audit records.
//! - [`notify`] — idempotent notification fan-out and read tracking.
//! - [`provenance`] / [`session`] — echo suppression for local mutations and
//!   the per-user facade tying everything together.

pub mod backend;
pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod notify;
pub mod provenance;
pub mod registry;
pub mod session;
pub mod workflow;

pub use cache::{CacheKey, CacheStats, Lookup, ObserverId, QueryCache};
pub use channel::{ChangeChannel, ChannelStatus};
pub use config::SyncConfig;
pub use error::Error;
pub use notify::{idempotency_key, FanoutSource, NotificationFanout};
pub use provenance::{ProvenanceLedger, Tag};
pub use registry::{EventHandler, HandlerResult, SubscriptionId, SubscriptionRegistry};
pub use session::{ReviewSession, SubscriptionHandle};
pub use workflow::ReviewEngine;
