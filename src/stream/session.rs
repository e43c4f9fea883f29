use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::SendError;
use crate::stream::manager::StreamManager;
use crate::stream::messages::StreamMessage;
use crate::stream::subscription::{Outbound, Subscription, SubscriptionHandle, SubscriptionState};
use crate::types::Fixture;

/// Fixtures per snapshot frame.
const SNAPSHOT_CHUNK_SIZE: usize = 500;

/// Transport for one subscriber. Delivery is at-most-once: a failed send is
/// not retried.
#[async_trait]
pub trait SessionConnection: Send + 'static {
    async fn send(&mut self, message: String) -> Result<(), SendError>;
    async fn close(&mut self);
}

/// Counters for one finished session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub delivered: u64,
    pub heartbeats: u64,
    pub snapshot_fixtures: u64,
    pub send_failures: u64,
    pub last_delivered_seq: u64,
}

#[derive(Debug, Clone, Copy)]
enum Frame {
    Connected,
    Snapshot(usize),
    Change(u64),
    Heartbeat,
}

/// Send bookkeeping shared by the preamble and the queue drain.
struct Delivery<'a, C> {
    conn: &'a mut C,
    sub: &'a Subscription,
    session_id: &'a str,
    send_timeout: Duration,
    max_failures: u32,
    consecutive_failures: u32,
    summary: SessionSummary,
}

impl<C: SessionConnection> Delivery<'_, C> {
    /// Sends one frame. Returns false once the session should stop: the
    /// subscription closed mid-send, or the failure limit was reached.
    async fn send(&mut self, text: String, session_seq: u64, frame: Frame) -> bool {
        let limit = self.send_timeout;
        let result = tokio::select! {
            biased;
            _ = self.sub.closed() => return false,
            sent = tokio::time::timeout(limit, self.conn.send(text)) => {
                sent.unwrap_or_else(|_| Err(SendError::Timeout(limit)))
            }
        };

        match result {
            Ok(()) => {
                self.consecutive_failures = 0;
                match frame {
                    Frame::Connected => {}
                    Frame::Snapshot(n) => self.summary.snapshot_fixtures += n as u64,
                    Frame::Change(seq) => {
                        self.summary.delivered += 1;
                        self.summary.last_delivered_seq = seq;
                        self.sub.mark_delivered(seq);
                    }
                    Frame::Heartbeat => self.summary.heartbeats += 1,
                }
                true
            }
            Err(e) => {
                self.consecutive_failures += 1;
                self.summary.send_failures += 1;
                warn!(
                    session_id = self.session_id,
                    session_seq,
                    consecutive_failures = self.consecutive_failures,
                    "Send failed, message dropped: {e}"
                );
                self.consecutive_failures < self.max_failures
            }
        }
    }
}

/// Drains a subscription into its connection until the subscription closes
/// or the transport fails `max_send_failures` times in a row.
///
/// Order on the wire: `connected`, then `snapshot` (the stored fixtures the
/// caller read after subscribing, in chunks), then queued changes and
/// heartbeats. Every frame after `connected` gets the next per-session
/// sequence number, attempted or not. A send that outlives `send_timeout`
/// counts as a failure, and closing the subscription interrupts a pending
/// send. Always releases the subscription and closes the connection on exit.
pub async fn drive_session<C: SessionConnection>(
    manager: Arc<StreamManager>,
    handle: SubscriptionHandle,
    snapshot: Vec<Fixture>,
    mut conn: C,
) -> SessionSummary {
    let send_timeout = manager.config().send_timeout;
    let max_failures = manager.config().max_send_failures.max(1);
    let sub = Arc::clone(handle.subscription());
    let session_id = handle.session_id().to_string();
    let mut session_seq = 0u64;

    let mut delivery = Delivery {
        conn: &mut conn,
        sub: &sub,
        session_id: &session_id,
        send_timeout,
        max_failures,
        consecutive_failures: 0,
        summary: SessionSummary::default(),
    };

    let mut running = match (StreamMessage::Connected { session_id: &session_id }).encode() {
        Ok(text) => delivery.send(text, session_seq, Frame::Connected).await,
        Err(e) => {
            warn!(session_id, "Failed to encode connected frame: {e}");
            true
        }
    };

    for chunk in snapshot.chunks(SNAPSHOT_CHUNK_SIZE) {
        if !running {
            break;
        }
        session_seq += 1;
        match (StreamMessage::Snapshot { session_seq, fixtures: chunk }).encode() {
            Ok(text) => running = delivery.send(text, session_seq, Frame::Snapshot(chunk.len())).await,
            Err(e) => warn!(session_id, session_seq, "Failed to encode snapshot, skipping: {e}"),
        }
    }

    while running {
        let Some(item) = handle.recv().await else {
            break;
        };
        session_seq += 1;

        let (encoded, frame) = match &item {
            Outbound::Change(event) => (
                StreamMessage::Change { session_seq, event: event.as_ref() }.encode(),
                Frame::Change(event.seq),
            ),
            Outbound::Heartbeat(at) => (StreamMessage::Heartbeat { session_seq, at: *at }.encode(), Frame::Heartbeat),
        };
        match encoded {
            Ok(text) => running = delivery.send(text, session_seq, frame).await,
            Err(e) => warn!(session_id, session_seq, "Failed to encode frame, skipping: {e}"),
        }
    }

    let consecutive_failures = delivery.consecutive_failures;
    let summary = delivery.summary;
    if consecutive_failures >= max_failures {
        sub.transition(SubscriptionState::Draining);
        info!(session_id, consecutive_failures, "Transport failing, closing session");
    }

    manager.release(&sub);
    if tokio::time::timeout(send_timeout, conn.close()).await.is_err() {
        debug!(session_id, "Transport close timed out, dropping it");
    }
    debug!(
        session_id,
        delivered = summary.delivered,
        heartbeats = summary.heartbeats,
        snapshot_fixtures = summary.snapshot_fixtures,
        send_failures = summary.send_failures,
        "Session ended"
    );
    summary
}
