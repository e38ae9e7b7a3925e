//! Change event channel.
//!
//! One channel holds one filtered server-side change stream. A background
//! task owns the connection: it dials with a bounded handshake, forwards
//! every received event to the dispatch callback in receipt order, and on
//! unexpected disconnect retries forever with exponential backoff and full
//! jitter until the channel is closed.
//!
//! Nothing is buffered across an outage. A reconnect is a correctness
//! boundary: after every successful RE-connect the reconcile callback runs
//! exactly once so consumers can recover potentially missed state with a
//! forced refetch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use revsync_proto::{ChangeEvent, EntityKind, StreamFilter};
use tokio::sync::{watch, Notify};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::backend::ChangeStreamTransport;
use crate::config::SyncConfig;

/// Observable connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Dialing or handshaking.
    Connecting,
    /// Live; events are flowing.
    Connected,
    /// Unexpectedly dropped; retrying with backoff.
    Disconnected,
    /// Closed by the owner. Terminal.
    Closed,
}

/// Callback receiving each event once, in receipt order.
///
/// Must not block; spawn for any follow-up I/O so the next event is not
/// held up.
pub type DispatchFn = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// Callback run once after every successful reconnect.
pub type ReconcileFn = Arc<dyn Fn() + Send + Sync>;

/// Exponential backoff with full jitter.
struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, attempt: 0 }
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Next delay: uniform over [0, min(cap, base * 2^attempt)].
    fn next_delay(&mut self) -> Duration {
        let shift = self.attempt.min(20);
        self.attempt = self.attempt.saturating_add(1);
        let exp = self
            .base
            .saturating_mul(1u32 << shift)
            .min(self.cap);
        if exp.is_zero() {
            return Duration::ZERO;
        }
        let jittered = rand::thread_rng().gen_range(0..=exp.as_millis() as u64);
        Duration::from_millis(jittered)
    }
}

enum StreamExit {
    Closed,
    Forced,
    Dropped,
}

/// A live, filtered change stream connection.
pub struct ChangeChannel {
    entity: EntityKind,
    scope_key: String,
    status: Arc<watch::Sender<ChannelStatus>>,
    closed: Arc<AtomicBool>,
    close_signal: Arc<Notify>,
    reconnect_signal: Arc<Notify>,
}

impl ChangeChannel {
    /// Open a channel and start its connection task.
    ///
    /// `dispatch` receives every event; `reconcile` runs once after each
    /// successful reconnect (not the first connect).
    pub fn open(
        transport: Arc<dyn ChangeStreamTransport>,
        entity: EntityKind,
        filter: StreamFilter,
        config: &SyncConfig,
        dispatch: DispatchFn,
        reconcile: ReconcileFn,
    ) -> Self {
        let (status_tx, _) = watch::channel(ChannelStatus::Connecting);
        let status = Arc::new(status_tx);
        let closed = Arc::new(AtomicBool::new(false));
        let close_signal = Arc::new(Notify::new());
        let reconnect_signal = Arc::new(Notify::new());

        let task = ChannelTask {
            transport,
            entity,
            filter: filter.clone(),
            handshake_timeout: config.handshake_timeout,
            backoff: Backoff::new(config.backoff_base, config.backoff_cap),
            status: status.clone(),
            closed: closed.clone(),
            close_signal: close_signal.clone(),
            reconnect_signal: reconnect_signal.clone(),
            dispatch,
            reconcile,
        };
        tokio::spawn(task.run());

        Self {
            entity,
            scope_key: filter.value,
            status,
            closed,
            close_signal,
            reconnect_signal,
        }
    }

    /// The entity class this channel streams.
    pub fn entity(&self) -> EntityKind {
        self.entity
    }

    /// The scope value this channel is filtered to.
    pub fn scope_key(&self) -> &str {
        &self.scope_key
    }

    /// Current status.
    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    /// Subscribe to status changes.
    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.subscribe()
    }

    /// Drop the current stream and re-dial immediately, skipping backoff.
    /// Used when a consumer detects prolonged staleness.
    pub fn force_reconnect(&self) {
        self.reconnect_signal.notify_one();
    }

    /// Close the channel. Idempotent; the connection task stops and the
    /// status becomes `Closed`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.status.send(ChannelStatus::Closed);
            self.close_signal.notify_one();
            debug!(entity = %self.entity, scope = %self.scope_key, "channel closed");
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for ChangeChannel {
    fn drop(&mut self) {
        self.close();
    }
}

struct ChannelTask {
    transport: Arc<dyn ChangeStreamTransport>,
    entity: EntityKind,
    filter: StreamFilter,
    handshake_timeout: Duration,
    backoff: Backoff,
    status: Arc<watch::Sender<ChannelStatus>>,
    closed: Arc<AtomicBool>,
    close_signal: Arc<Notify>,
    reconnect_signal: Arc<Notify>,
    dispatch: DispatchFn,
    reconcile: ReconcileFn,
}

impl ChannelTask {
    fn set_status(&self, next: ChannelStatus) {
        // Never overwrite the terminal Closed status.
        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.status.send(next);
        }
    }

    async fn run(mut self) {
        let mut was_connected = false;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            self.set_status(ChannelStatus::Connecting);

            let connect = self.transport.connect(self.entity, &self.filter);
            let outcome = tokio::select! {
                _ = self.close_signal.notified() => return,
                res = timeout(self.handshake_timeout, connect) => res,
            };

            match outcome {
                Err(_) => {
                    warn!(
                        entity = %self.entity,
                        scope = %self.filter.value,
                        "handshake timed out"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        entity = %self.entity,
                        scope = %self.filter.value,
                        error = %e,
                        "stream connect failed"
                    );
                }
                Ok(Ok(rx)) => {
                    self.backoff.reset();
                    self.set_status(ChannelStatus::Connected);
                    if was_connected {
                        info!(
                            entity = %self.entity,
                            scope = %self.filter.value,
                            "stream reconnected, reconciling"
                        );
                        (self.reconcile)();
                    } else {
                        debug!(
                            entity = %self.entity,
                            scope = %self.filter.value,
                            "stream connected"
                        );
                        was_connected = true;
                    }

                    match self.pump_events(rx).await {
                        StreamExit::Closed => return,
                        StreamExit::Forced => continue,
                        StreamExit::Dropped => {}
                    }
                }
            }

            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            self.set_status(ChannelStatus::Disconnected);
            let delay = self.backoff.next_delay();
            debug!(
                entity = %self.entity,
                scope = %self.filter.value,
                delay_ms = delay.as_millis() as u64,
                "retrying after backoff"
            );
            tokio::select! {
                _ = self.close_signal.notified() => return,
                _ = sleep(delay) => {}
            }
        }
    }

    async fn pump_events(&self, mut rx: crate::backend::EventReceiver) -> StreamExit {
        loop {
            tokio::select! {
                _ = self.close_signal.notified() => return StreamExit::Closed,
                _ = self.reconnect_signal.notified() => {
                    info!(
                        entity = %self.entity,
                        scope = %self.filter.value,
                        "forced reconnect"
                    );
                    return StreamExit::Forced;
                }
                maybe = rx.recv() => match maybe {
                    Some(event) => (self.dispatch)(event),
                    None => {
                        warn!(
                            entity = %self.entity,
                            scope = %self.filter.value,
                            "stream dropped"
                        );
                        return StreamExit::Dropped;
                    }
                }
            }
        }
    }
}
