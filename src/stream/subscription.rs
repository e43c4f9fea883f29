use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Notify};

use crate::types::{ChangeEvent, StreamFilter};

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Connecting → Active → Draining → Closed. Transitions only move forward;
/// nothing leaves Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Connecting,
    Active,
    Draining,
    Closed,
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubscriptionState::Connecting => "connecting",
            SubscriptionState::Active => "active",
            SubscriptionState::Draining => "draining",
            SubscriptionState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// One queued item for a session's drain unit.
#[derive(Debug, Clone)]
pub enum Outbound {
    Change(Arc<ChangeEvent>),
    Heartbeat(DateTime<Utc>),
}

/// What happened to an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// Queued after evicting the oldest item.
    DroppedOldest,
    /// Subscription is not Active; nothing queued.
    Rejected,
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Shared {
    state: SubscriptionState,
    queue: VecDeque<Outbound>,
}

/// A live interest registration. Owned by the StreamManager registry; the
/// session's drain unit reaches it through a `SubscriptionHandle`.
#[derive(Debug)]
pub struct Subscription {
    session_id: String,
    /// Distinguishes reconnects that reuse a session id.
    connection_id: u64,
    filter: StreamFilter,
    capacity: usize,
    shared: Mutex<Shared>,
    notify: Notify,
    /// Flips to true on the move to Draining; wakes a session blocked in a send.
    closing: watch::Sender<bool>,
    dropped: AtomicU64,
    last_delivered_seq: AtomicU64,
}

impl Subscription {
    pub(crate) fn new(session_id: &str, connection_id: u64, filter: StreamFilter, capacity: usize) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            session_id: session_id.to_string(),
            connection_id,
            filter,
            capacity: capacity.max(1),
            shared: Mutex::new(Shared {
                state: SubscriptionState::Connecting,
                queue: VecDeque::with_capacity(capacity.clamp(1, 1024)),
            }),
            notify: Notify::new(),
            closing,
            dropped: AtomicU64::new(0),
            last_delivered_seq: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn filter(&self) -> &StreamFilter {
        &self.filter
    }

    pub fn state(&self) -> SubscriptionState {
        self.lock().state
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Events evicted by drop-oldest over the subscription's lifetime.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn last_delivered_seq(&self) -> u64 {
        self.last_delivered_seq.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_delivered(&self, seq: u64) {
        self.last_delivered_seq.fetch_max(seq, Ordering::Relaxed);
    }

    /// Moves forward to `to`. Returns false (and changes nothing) for a
    /// backward or same-state transition.
    pub(crate) fn transition(&self, to: SubscriptionState) -> bool {
        let mut shared = self.lock();
        if to <= shared.state {
            return false;
        }
        shared.state = to;
        if to == SubscriptionState::Closed {
            shared.queue.clear();
            shared.queue.shrink_to_fit();
        }
        drop(shared);
        if to >= SubscriptionState::Draining {
            self.closing.send_replace(true);
            self.notify.notify_one();
        }
        true
    }

    /// Resolves once the subscription is Draining or Closed.
    pub(crate) async fn closed(&self) {
        let mut rx = self.closing.subscribe();
        // The sender lives in `self`, so this only returns once the flag is set.
        let _ = rx.wait_for(|closing| *closing).await;
    }

    /// Active → Draining (if needed) → Closed. Idempotent.
    pub(crate) fn close(&self) -> bool {
        self.transition(SubscriptionState::Draining);
        self.transition(SubscriptionState::Closed)
    }

    /// Bounded, drop-oldest enqueue. Never blocks on the consumer.
    pub(crate) fn enqueue(&self, item: Outbound) -> Enqueued {
        let mut shared = self.lock();
        if shared.state != SubscriptionState::Active {
            return Enqueued::Rejected;
        }
        let result = if shared.queue.len() >= self.capacity {
            shared.queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            Enqueued::DroppedOldest
        } else {
            Enqueued::Queued
        };
        shared.queue.push_back(item);
        drop(shared);
        self.notify.notify_one();
        result
    }

    /// Heartbeats only go onto an empty queue so they never evict an event.
    pub(crate) fn enqueue_heartbeat(&self, at: DateTime<Utc>) -> bool {
        let mut shared = self.lock();
        if shared.state != SubscriptionState::Active || !shared.queue.is_empty() {
            return false;
        }
        shared.queue.push_back(Outbound::Heartbeat(at));
        drop(shared);
        self.notify.notify_one();
        true
    }

    /// Next queued item; waits while the queue is empty. `None` once the
    /// subscription is Draining or Closed.
    pub(crate) async fn recv(&self) -> Option<Outbound> {
        loop {
            {
                let mut shared = self.lock();
                if shared.state >= SubscriptionState::Draining {
                    return None;
                }
                if let Some(item) = shared.queue.pop_front() {
                    return Some(item);
                }
            }
            // notify_one stores a permit, so a push between the check and here is not lost.
            self.notify.notified().await;
        }
    }
}

/// The drain side of a subscription, handed to the session that owns it.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    inner: Arc<Subscription>,
}

impl SubscriptionHandle {
    pub(crate) fn new(inner: Arc<Subscription>) -> Self {
        Self { inner }
    }

    pub async fn recv(&self) -> Option<Outbound> {
        self.inner.recv().await
    }

    pub fn subscription(&self) -> &Arc<Subscription> {
        &self.inner
    }

    pub fn session_id(&self) -> &str {
        self.inner.session_id()
    }

    #[cfg(test)]
    pub fn state(&self) -> SubscriptionState {
        self.inner.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::fixture;
    use crate::types::FixtureChange;

    fn event(seq: u64) -> Outbound {
        Outbound::Change(Arc::new(ChangeEvent {
            seq,
            change: FixtureChange::Created { fixture: fixture(&format!("f{seq}"), "nba") },
        }))
    }

    fn seq_of(item: Outbound) -> u64 {
        match item {
            Outbound::Change(e) => e.seq,
            Outbound::Heartbeat(_) => panic!("unexpected heartbeat"),
        }
    }

    fn active(capacity: usize) -> Subscription {
        let sub = Subscription::new("s1", 1, StreamFilter::default(), capacity);
        assert!(sub.transition(SubscriptionState::Active));
        sub
    }

    #[test]
    fn transitions_only_move_forward() {
        let sub = Subscription::new("s1", 1, StreamFilter::default(), 4);
        assert_eq!(sub.state(), SubscriptionState::Connecting);
        assert!(sub.transition(SubscriptionState::Active));
        assert!(!sub.transition(SubscriptionState::Connecting));
        assert!(sub.transition(SubscriptionState::Draining));
        assert!(!sub.transition(SubscriptionState::Active));
        assert!(sub.transition(SubscriptionState::Closed));
        assert!(!sub.close());
        assert_eq!(sub.state(), SubscriptionState::Closed);
    }

    #[test]
    fn enqueue_rejected_unless_active() {
        let sub = Subscription::new("s1", 1, StreamFilter::default(), 4);
        assert_eq!(sub.enqueue(event(1)), Enqueued::Rejected);
        sub.transition(SubscriptionState::Active);
        assert_eq!(sub.enqueue(event(2)), Enqueued::Queued);
        sub.close();
        assert_eq!(sub.enqueue(event(3)), Enqueued::Rejected);
        assert_eq!(sub.queued(), 0);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_stays_active() {
        let sub = active(5);
        let results: Vec<_> = (1..=6).map(|seq| sub.enqueue(event(seq))).collect();
        assert_eq!(results[5], Enqueued::DroppedOldest);
        assert_eq!(sub.dropped(), 1);
        assert_eq!(sub.state(), SubscriptionState::Active);

        let mut seqs = Vec::new();
        while sub.queued() > 0 {
            seqs.push(seq_of(sub.recv().await.unwrap()));
        }
        assert_eq!(seqs, vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn heartbeat_only_on_empty_queue() {
        let sub = active(2);
        assert!(sub.enqueue_heartbeat(Utc::now()));
        assert!(!sub.enqueue_heartbeat(Utc::now()));
        assert_eq!(sub.queued(), 1);
    }

    #[tokio::test]
    async fn recv_wakes_on_close() {
        let sub = Arc::new(active(2));
        let waiter = {
            let sub = Arc::clone(&sub);
            tokio::spawn(async move { sub.recv().await })
        };
        tokio::task::yield_now().await;
        sub.close();
        let got = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("recv did not wake")
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn closed_resolves_for_late_and_early_waiters() {
        let sub = Arc::new(active(2));
        let waiter = {
            let sub = Arc::clone(&sub);
            tokio::spawn(async move { sub.closed().await })
        };
        tokio::task::yield_now().await;
        sub.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("closed() did not resolve")
            .unwrap();
        // Already closed: resolves immediately.
        tokio::time::timeout(std::time::Duration::from_millis(100), sub.closed())
            .await
            .expect("closed() blocked after close");
    }
}
