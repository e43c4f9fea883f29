//! fixture-tail [url]: follows the /stream endpoint and prints one line per
//! snapshot fixture and per change.
//!
//!   STREAM_URL   used when no url argument is given
//!   SESSION_ID   reused across reconnects (random when unset)
//!   SPORT, LEAGUE  optional stream filter

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const RECONNECT_BACKOFF_MS: &[u64] = &[100, 200, 400, 800];

/// Sequence bookkeeping. `last_session_seq` restarts with every connection;
/// the counters run across reconnects.
#[derive(Debug, Default)]
struct Progress {
    last_session_seq: u64,
    last_seq: u64,
    changes: u64,
    heartbeats: u64,
    snapshot_fixtures: u64,
    gaps: u64,
}

impl Progress {
    /// A filtered session never sees non-matching `seq` values, so gaps are
    /// judged on the per-session counter only.
    fn observe_session_seq(&mut self, frame: &Value) {
        let Some(session_seq) = frame["session_seq"].as_u64() else {
            return;
        };
        if session_seq > self.last_session_seq + 1 {
            self.gaps += 1;
            // Missed events can be recovered through GET /fixtures.
            warn!(
                from = self.last_session_seq + 1,
                to = session_seq - 1,
                "Gap in session sequence"
            );
        }
        self.last_session_seq = self.last_session_seq.max(session_seq);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(
            std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        ))
        .init();

    let base = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("STREAM_URL").ok())
        .unwrap_or_else(|| "ws://localhost:3000/stream".to_string());
    let session_id = std::env::var("SESSION_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
    let url = stream_url(
        &base,
        &session_id,
        std::env::var("SPORT").ok().as_deref(),
        std::env::var("LEAGUE").ok().as_deref(),
    );

    let mut progress = Progress::default();
    let mut backoff_idx = 0usize;

    loop {
        info!("Connecting to {url}");
        tokio::select! {
            result = follow(&url, &mut progress) => match result {
                Ok(()) => {
                    info!("Stream closed by server");
                    backoff_idx = 0;
                }
                Err(e) => error!("Stream error: {e}"),
            },
            _ = tokio::signal::ctrl_c() => break,
        }

        let delay_ms = RECONNECT_BACKOFF_MS
            .get(backoff_idx)
            .copied()
            .unwrap_or(800);
        backoff_idx = (backoff_idx + 1).min(RECONNECT_BACKOFF_MS.len() - 1);
        warn!("Reconnecting in {delay_ms}ms");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!(
        changes = progress.changes,
        heartbeats = progress.heartbeats,
        snapshot_fixtures = progress.snapshot_fixtures,
        gaps = progress.gaps,
        last_seq = progress.last_seq,
        "fixture-tail stopped"
    );
}

fn stream_url(base: &str, session_id: &str, sport: Option<&str>, league: Option<&str>) -> String {
    let mut url = format!("{base}?session_id={session_id}");
    if let Some(sport) = sport.filter(|s| !s.is_empty()) {
        url.push_str(&format!("&sport={sport}"));
    }
    if let Some(league) = league.filter(|l| !l.is_empty()) {
        url.push_str(&format!("&league={league}"));
    }
    url
}

async fn follow(url: &str, progress: &mut Progress) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let (ws_stream, _) = connect_async(url).await?;
    progress.last_session_seq = 0;
    let (mut write, mut read) = ws_stream.split();

    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => match serde_json::from_str::<Value>(&text) {
                Ok(frame) => handle_frame(&frame, progress),
                Err(e) => warn!("Unparseable frame: {e}"),
            },
            Message::Ping(data) => write.send(Message::Pong(data)).await?,
            Message::Close(_) => return Ok(()),
            _ => {}
        }
    }
    Ok(())
}

fn handle_frame(frame: &Value, progress: &mut Progress) {
    match frame["type"].as_str() {
        Some("connected") => {
            progress.last_session_seq = 0;
            info!(session_id = frame["session_id"].as_str(), "Connected");
        }
        Some("snapshot") => {
            progress.observe_session_seq(frame);
            let fixtures = frame["fixtures"].as_array().map_or(&[][..], |a| a.as_slice());
            progress.snapshot_fixtures += fixtures.len() as u64;
            for fixture in fixtures {
                print_fixture("snapshot", None, fixture);
            }
        }
        Some("heartbeat") => {
            progress.observe_session_seq(frame);
            progress.heartbeats += 1;
        }
        Some("change") => {
            progress.observe_session_seq(frame);
            let seq = frame["seq"].as_u64().unwrap_or(0);
            progress.last_seq = progress.last_seq.max(seq);
            progress.changes += 1;
            print_fixture(frame["kind"].as_str().unwrap_or("?"), Some(seq), &frame["fixture"]);
        }
        other => warn!(frame_type = ?other, "Unknown frame"),
    }
}

fn print_fixture(kind: &str, seq: Option<u64>, fixture: &Value) {
    let seq = seq.map_or_else(|| "-".to_string(), |s| s.to_string());
    println!(
        "{seq:>8} {kind:<8} {} {} @ {} [{}] {}",
        fixture["away_team"].as_str().unwrap_or("?"),
        fixture["home_team"].as_str().unwrap_or("?"),
        fixture["start_time"].as_str().unwrap_or("?"),
        fixture["status"].as_str().unwrap_or("?"),
        fixture["id"].as_str().unwrap_or("?"),
    );
}
