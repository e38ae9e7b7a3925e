//! Subscription registry.
//!
//! The single owner of all live change channels. Identical subscriptions —
//! same (entity, scope key) — share one channel through reference counting;
//! the channel closes when the last subscriber detaches. Incoming events are
//! multiplexed to every registered handler in registration order, then the
//! affected cache keys are invalidated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use revsync_proto::{ChangeEvent, EntityKind, StreamFilter};
use tracing::{debug, info, warn};

use crate::backend::ChangeStreamTransport;
use crate::cache::{CacheKey, QueryCache};
use crate::channel::{ChangeChannel, ChannelStatus};
use crate::config::SyncConfig;
use crate::error::Error;

/// Handle to one registered subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Outcome of one handler invocation. Errors are logged; they never
/// suppress delivery to later handlers or the invalidation step.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Callback invoked once per event, in per-channel receipt order. Must not
/// block; spawn for follow-up I/O.
pub type EventHandler = Arc<dyn Fn(&ChangeEvent) -> HandlerResult + Send + Sync>;

type ChannelKey = (EntityKind, String);

struct SubscriptionRecord {
    key: ChannelKey,
    handler: EventHandler,
    invalidation_keys: Vec<CacheKey>,
    events_seen: Arc<AtomicU64>,
    created_at: Instant,
}

struct ChannelEntry {
    channel: ChangeChannel,
    // Subscription ids in registration order.
    members: Vec<u64>,
}

struct RegistryInner {
    channels: Mutex<HashMap<ChannelKey, ChannelEntry>>,
    subscriptions: Mutex<HashMap<u64, SubscriptionRecord>>,
    cache: Arc<QueryCache>,
}

impl RegistryInner {
    /// Collect a channel's handlers and the deduplicated invalidation-key
    /// union, in registration order. Locks are released before handlers run
    /// so they may call back into the registry.
    fn collect(
        &self,
        key: &ChannelKey,
    ) -> (Vec<(u64, EventHandler, Arc<AtomicU64>)>, Vec<CacheKey>) {
        let member_ids = self
            .channels
            .lock()
            .get(key)
            .map(|entry| entry.members.clone())
            .unwrap_or_default();

        let mut handlers = Vec::with_capacity(member_ids.len());
        let mut invalidation_keys: Vec<CacheKey> = Vec::new();
        let subscriptions = self.subscriptions.lock();
        for id in member_ids {
            if let Some(record) = subscriptions.get(&id) {
                handlers.push((id, record.handler.clone(), record.events_seen.clone()));
                for cache_key in &record.invalidation_keys {
                    if !invalidation_keys.contains(cache_key) {
                        invalidation_keys.push(cache_key.clone());
                    }
                }
            }
        }
        (handlers, invalidation_keys)
    }

    fn dispatch(&self, key: &ChannelKey, event: ChangeEvent) {
        let (handlers, invalidation_keys) = self.collect(key);
        for (id, handler, events_seen) in handlers {
            events_seen.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = handler(&event) {
                warn!(
                    subscription_id = id,
                    entity = %event.entity,
                    error = %e,
                    "event handler failed"
                );
            }
        }
        for cache_key in invalidation_keys {
            self.cache.invalidate(&cache_key);
        }
    }

    fn reconcile(&self, key: &ChannelKey) {
        let (_, invalidation_keys) = self.collect(key);
        info!(
            entity = %key.0,
            scope = %key.1,
            keys = invalidation_keys.len(),
            "reconciling caches after reconnect"
        );
        for cache_key in invalidation_keys {
            self.cache.invalidate(&cache_key);
        }
    }
}

/// Owner of all live channels, deduplicating identical subscriptions.
pub struct SubscriptionRegistry {
    transport: Arc<dyn ChangeStreamTransport>,
    config: SyncConfig,
    inner: Arc<RegistryInner>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    /// Create a registry dispatching into `cache`.
    pub fn new(
        transport: Arc<dyn ChangeStreamTransport>,
        cache: Arc<QueryCache>,
        config: SyncConfig,
    ) -> Self {
        Self {
            transport,
            config,
            inner: Arc::new(RegistryInner {
                channels: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                cache,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for one (entity, scope key) stream.
    ///
    /// An existing matching channel gains a reference instead of a second
    /// connection. `invalidation_keys` are marked stale after every
    /// dispatched event and after every reconnect.
    pub fn subscribe(
        &self,
        entity: EntityKind,
        scope_key: impl Into<String>,
        filter: StreamFilter,
        invalidation_keys: Vec<CacheKey>,
        handler: EventHandler,
    ) -> SubscriptionId {
        let scope_key = scope_key.into();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let key: ChannelKey = (entity, scope_key.clone());

        // The record goes in before channel membership: dispatch resolves
        // members through the records map, so a member id must never be
        // visible without its record.
        self.inner.subscriptions.lock().insert(
            id,
            SubscriptionRecord {
                key: key.clone(),
                handler,
                invalidation_keys,
                events_seen: Arc::new(AtomicU64::new(0)),
                created_at: Instant::now(),
            },
        );

        {
            let mut channels = self.inner.channels.lock();
            match channels.get_mut(&key) {
                Some(entry) => {
                    entry.members.push(id);
                    debug!(
                        subscription_id = id,
                        entity = %entity,
                        scope = %scope_key,
                        refcount = entry.members.len(),
                        "subscription joined existing channel"
                    );
                }
                None => {
                    let dispatch_inner = self.inner.clone();
                    let dispatch_key = key.clone();
                    let reconcile_inner = self.inner.clone();
                    let reconcile_key = key.clone();
                    let channel = ChangeChannel::open(
                        self.transport.clone(),
                        entity,
                        filter,
                        &self.config,
                        Arc::new(move |event| dispatch_inner.dispatch(&dispatch_key, event)),
                        Arc::new(move || reconcile_inner.reconcile(&reconcile_key)),
                    );
                    channels.insert(
                        key.clone(),
                        ChannelEntry {
                            channel,
                            members: vec![id],
                        },
                    );
                    debug!(
                        subscription_id = id,
                        entity = %entity,
                        scope = %scope_key,
                        "subscription created, channel opened"
                    );
                }
            }
        }

        SubscriptionId(id)
    }

    /// Detach a subscription. The underlying channel closes when its last
    /// subscriber detaches.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), Error> {
        let key = self.channel_key(id)?;

        // Membership comes out before the record, mirroring subscribe: a
        // dispatch running in between sees the record without the member,
        // which is a no-op, never a member without its record.
        let close_channel = {
            let mut channels = self.inner.channels.lock();
            let close = match channels.get_mut(&key) {
                Some(entry) => {
                    entry.members.retain(|&member| member != id.0);
                    entry.members.is_empty()
                }
                None => false,
            };
            if close {
                if let Some(entry) = channels.remove(&key) {
                    entry.channel.close();
                }
            }
            close
        };

        let record = self
            .inner
            .subscriptions
            .lock()
            .remove(&id.0)
            .ok_or(Error::UnknownSubscription(id.0))?;

        debug!(
            subscription_id = id.0,
            entity = %record.key.0,
            scope = %record.key.1,
            events_seen = record.events_seen.load(Ordering::Relaxed),
            age_ms = record.created_at.elapsed().as_millis() as u64,
            channel_closed = close_channel,
            "subscription removed"
        );
        Ok(())
    }

    /// Force the subscription's channel to re-dial, for consumers that
    /// detect prolonged staleness.
    pub fn reconnect(&self, id: SubscriptionId) -> Result<(), Error> {
        let key = self.channel_key(id)?;
        let channels = self.inner.channels.lock();
        let entry = channels
            .get(&key)
            .ok_or(Error::UnknownSubscription(id.0))?;
        entry.channel.force_reconnect();
        Ok(())
    }

    /// Connection status of the subscription's channel.
    pub fn status(&self, id: SubscriptionId) -> Result<ChannelStatus, Error> {
        let key = self.channel_key(id)?;
        let channels = self.inner.channels.lock();
        let entry = channels
            .get(&key)
            .ok_or(Error::UnknownSubscription(id.0))?;
        Ok(entry.channel.status())
    }

    fn channel_key(&self, id: SubscriptionId) -> Result<ChannelKey, Error> {
        self.inner
            .subscriptions
            .lock()
            .get(&id.0)
            .map(|record| record.key.clone())
            .ok_or(Error::UnknownSubscription(id.0))
    }

    /// Number of registered subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    /// Number of open channels.
    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }

    /// Subscription ids attached to one (entity, scope key), registration
    /// order.
    pub fn subscriptions_for(&self, entity: EntityKind, scope_key: &str) -> Vec<SubscriptionId> {
        self.inner
            .channels
            .lock()
            .get(&(entity, scope_key.to_string()))
            .map(|entry| entry.members.iter().map(|&id| SubscriptionId(id)).collect())
            .unwrap_or_default()
    }
}
