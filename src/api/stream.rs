//! WebSocket endpoint for live fixture changes.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::routes::ApiState;
use crate::db::FixtureRepository;
use crate::error::SendError;
use crate::stream::{drive_session, SessionConnection, StreamManager};
use crate::types::{Fixture, FixtureQuery, StreamFilter};

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Reusing a session id replaces that session's previous connection.
    pub session_id: Option<String>,
    pub sport: Option<String>,
    pub league: Option<String>,
}

pub async fn stream_fixtures(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Query(params): Query<StreamQuery>,
) -> impl IntoResponse {
    let session_id = params
        .session_id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let filter = StreamFilter {
        sport: params.sport.filter(|s| !s.is_empty()),
        league: params.league.filter(|l| !l.is_empty()),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state.streams, state.repo, session_id, filter))
}

/// Stored fixtures matching `filter`. Read after subscribing, so a change
/// applied meanwhile is also queued behind the snapshot and never lost.
async fn initial_snapshot(repo: &dyn FixtureRepository, filter: &StreamFilter) -> Vec<Fixture> {
    let query = FixtureQuery {
        sport: filter.sport.clone(),
        league: filter.league.clone(),
        ..Default::default()
    };
    match repo.query(&query).await {
        Ok(fixtures) => fixtures,
        Err(e) => {
            warn!("Initial snapshot unavailable, streaming changes only: {e}");
            Vec::new()
        }
    }
}

async fn handle_socket(
    socket: WebSocket,
    streams: Arc<StreamManager>,
    repo: Arc<dyn FixtureRepository>,
    session_id: String,
    filter: StreamFilter,
) {
    let (sink, mut incoming) = socket.split();
    let handle = streams.subscribe(&session_id, filter);
    let snapshot = initial_snapshot(repo.as_ref(), handle.subscription().filter()).await;

    // Clients only send control frames; a close or read error ends the session.
    let reader = {
        let streams = Arc::clone(&streams);
        let sub = Arc::clone(handle.subscription());
        tokio::spawn(async move {
            while let Some(msg) = incoming.next().await {
                match msg {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            debug!(session_id = sub.session_id(), "Client disconnected");
            streams.release(&sub);
        })
    };

    let summary = drive_session(streams, handle, snapshot, WsSession { sink }).await;
    reader.abort();
    info!(
        session_id,
        delivered = summary.delivered,
        snapshot_fixtures = summary.snapshot_fixtures,
        send_failures = summary.send_failures,
        last_delivered_seq = summary.last_delivered_seq,
        "WebSocket session closed"
    );
}

/// Write half of an axum WebSocket.
struct WsSession {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl SessionConnection for WsSession {
    async fn send(&mut self, message: String) -> Result<(), SendError> {
        self.sink
            .send(Message::Text(message))
            .await
            .map_err(|e| SendError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryFixtureRepository;
    use crate::types::tests::fixture;

    #[tokio::test]
    async fn snapshot_follows_the_session_filter() {
        let repo = MemoryFixtureRepository::new();
        let mut nfl = fixture("nfl-1", "nfl");
        nfl.sport = "football".into();
        for f in [&fixture("nba-1", "nba"), &nfl, &fixture("nba-2", "nba")] {
            repo.upsert(f).await.unwrap();
        }

        let nba = StreamFilter { sport: Some("Basketball".into()), league: Some("NBA".into()) };
        let ids: Vec<String> = initial_snapshot(&repo, &nba).await.into_iter().map(|f| f.id).collect();
        assert_eq!(ids, vec!["nba-1", "nba-2"]);

        assert_eq!(initial_snapshot(&repo, &StreamFilter::default()).await.len(), 3);
    }
}
