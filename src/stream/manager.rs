use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::{HEARTBEAT_INTERVAL_SECS, MAX_SEND_FAILURES, SEND_TIMEOUT_SECS, SUBSCRIBER_QUEUE_CAPACITY};
use crate::stream::subscription::{Enqueued, Outbound, Subscription, SubscriptionHandle, SubscriptionState};
use crate::types::{ChangeEvent, StreamFilter};

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub queue_capacity: usize,
    pub heartbeat_interval: Duration,
    pub max_send_failures: u32,
    /// A send still pending after this long counts as failed.
    pub send_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_capacity: SUBSCRIBER_QUEUE_CAPACITY,
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            max_send_failures: MAX_SEND_FAILURES,
            send_timeout: Duration::from_secs(SEND_TIMEOUT_SECS),
        }
    }
}

/// Fan-out counts for one published event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub matched: usize,
    pub queued: usize,
    /// Subscribers that had to evict their oldest queued item.
    pub overflowed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub session_id: String,
    pub state: SubscriptionState,
    pub queued: usize,
    pub dropped: u64,
    pub last_delivered_seq: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub active_sessions: usize,
    pub events_published: u64,
    pub events_dropped: u64,
    pub last_published_seq: u64,
}

/// Registry of live subscriptions keyed by session id, plus fan-out.
///
/// The poller publishes through `publish`, which never waits on a consumer:
/// every subscription has its own bounded queue drained by its own session.
pub struct StreamManager {
    registry: DashMap<String, Arc<Subscription>>,
    config: StreamConfig,
    next_connection_id: AtomicU64,
    events_published: AtomicU64,
    events_dropped: AtomicU64,
    last_published_seq: AtomicU64,
}

impl StreamManager {
    pub fn new(config: StreamConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: DashMap::new(),
            config,
            next_connection_id: AtomicU64::new(1),
            events_published: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            last_published_seq: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Registers interest for `session_id`. A second subscribe with the same
    /// id replaces the first; the old subscription is closed.
    pub fn subscribe(&self, session_id: &str, filter: StreamFilter) -> SubscriptionHandle {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let sub = Arc::new(Subscription::new(
            session_id,
            connection_id,
            filter,
            self.config.queue_capacity,
        ));

        // Active before it becomes visible to publish.
        sub.transition(SubscriptionState::Active);
        if let Some(old) = self.registry.insert(session_id.to_string(), Arc::clone(&sub)) {
            old.close();
            info!(
                session_id,
                replaced_connection = old.connection_id(),
                "Session reconnected, previous subscription closed"
            );
        }

        info!(
            session_id,
            sport = ?sub.filter().sport,
            league = ?sub.filter().league,
            active = self.active_count(),
            "Subscribed"
        );
        SubscriptionHandle::new(sub)
    }

    /// Removes and closes the subscription for `session_id`. Unknown ids are a no-op.
    pub fn unsubscribe(&self, session_id: &str) -> bool {
        match self.registry.remove(session_id) {
            Some((_, sub)) => {
                sub.close();
                info!(session_id, active = self.active_count(), "Unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Closes `sub` and drops it from the registry only if it is still the
    /// registered connection for its session id.
    pub fn release(&self, sub: &Arc<Subscription>) {
        sub.close();
        let removed = self
            .registry
            .remove_if(sub.session_id(), |_, current| Arc::ptr_eq(current, sub))
            .is_some();
        if removed {
            info!(
                session_id = sub.session_id(),
                dropped = sub.dropped(),
                last_delivered_seq = sub.last_delivered_seq(),
                active = self.active_count(),
                "Session released"
            );
        }
    }

    fn snapshot(&self) -> Vec<Arc<Subscription>> {
        self.registry.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Enqueues `event` for every Active subscription whose filter matches.
    /// Works on a snapshot of the registry, so concurrent subscribe or
    /// unsubscribe never blocks it.
    pub fn publish(&self, event: ChangeEvent) -> PublishReport {
        let seq = event.seq;
        let event = Arc::new(event);
        let mut report = PublishReport::default();

        for sub in self.snapshot() {
            if !sub.filter().matches(event.fixture()) {
                continue;
            }
            report.matched += 1;
            match sub.enqueue(Outbound::Change(Arc::clone(&event))) {
                Enqueued::Queued => report.queued += 1,
                Enqueued::DroppedOldest => {
                    report.queued += 1;
                    report.overflowed += 1;
                    self.events_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(session_id = sub.session_id(), seq, "Subscriber queue full, dropped oldest");
                }
                Enqueued::Rejected => {}
            }
        }

        self.events_published.fetch_add(1, Ordering::Relaxed);
        self.last_published_seq.fetch_max(seq, Ordering::Relaxed);
        report
    }

    /// Queues a heartbeat on every idle Active subscription. Returns how many got one.
    pub fn heartbeat(&self) -> usize {
        let now = Utc::now();
        self.snapshot()
            .into_iter()
            .filter(|sub| sub.enqueue_heartbeat(now))
            .count()
    }

    pub async fn run_heartbeat(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // first tick is immediate

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sent = self.heartbeat();
                    debug!(sent, "Heartbeat tick");
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Heartbeat loop stopped");
    }

    /// Closes every subscription. Sessions see their queues end and shut down.
    pub fn close_all(&self) -> usize {
        let subs = self.snapshot();
        self.registry.clear();
        for sub in &subs {
            sub.close();
        }
        info!(closed = subs.len(), "All stream sessions closed");
        subs.len()
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let mut infos: Vec<_> = self
            .snapshot()
            .into_iter()
            .map(|sub| SubscriptionInfo {
                session_id: sub.session_id().to_string(),
                state: sub.state(),
                queued: sub.queued(),
                dropped: sub.dropped(),
                last_delivered_seq: sub.last_delivered_seq(),
            })
            .collect();
        infos.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        infos
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            active_sessions: self.active_count(),
            events_published: self.events_published.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            last_published_seq: self.last_published_seq.load(Ordering::Relaxed),
        }
    }
}
