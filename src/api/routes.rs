use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::api::health::{HealthSnapshot, HealthState};
use crate::api::latency::{LatencyStats, LatencySummary};
use crate::api::stream::stream_fixtures;
use crate::db::FixtureRepository;
use crate::error::AppError;
use crate::scheduler::{CycleOutcome, CycleReport, PollingScheduler};
use crate::stream::manager::{StreamStats, SubscriptionInfo};
use crate::stream::StreamManager;
use crate::types::{Fixture, FixtureQuery, FixtureStatus};

const DEFAULT_PAGE_SIZE: usize = 1000;
const MAX_PAGE_SIZE: usize = 10_000;

#[derive(Clone)]
pub struct ApiState {
    pub repo: Arc<dyn FixtureRepository>,
    pub streams: Arc<StreamManager>,
    pub scheduler: Arc<PollingScheduler>,
    pub health: Arc<HealthState>,
    pub latency: Arc<LatencyStats>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/fixtures", get(get_fixtures))
        .route("/fixtures/:id", get(get_fixture))
        .route("/stream", get(stream_fixtures))
        .route("/admin/poll", post(force_poll))
        .route("/admin/sessions/:session_id", delete(close_session))
        .route("/health", get(get_health))
        .route("/stats/latency", get(get_stats_latency))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct FixturesQuery {
    pub status: Option<String>,
    pub team: Option<String>,
    /// RFC 3339 timestamp or YYYY-MM-DD (start of day, UTC).
    pub from: Option<String>,
    /// RFC 3339 timestamp or YYYY-MM-DD (end of day, UTC).
    pub to: Option<String>,
    pub season: Option<String>,
    pub week: Option<String>,
    pub sport: Option<String>,
    pub league: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl FixturesQuery {
    fn into_query(self) -> Result<FixtureQuery, AppError> {
        let status = match self.status.as_deref().filter(|s| !s.is_empty()) {
            Some(s) => Some(
                FixtureStatus::parse(s).ok_or_else(|| AppError::BadRequest(format!("unknown status `{s}`")))?,
            ),
            None => None,
        };
        let start_from = self.from.as_deref().map(|s| parse_bound(s, false)).transpose()?;
        let start_to = self.to.as_deref().map(|s| parse_bound(s, true)).transpose()?;
        if let (Some(from), Some(to)) = (start_from, start_to) {
            if from > to {
                return Err(AppError::BadRequest("`from` is after `to`".to_string()));
            }
        }

        Ok(FixtureQuery {
            status,
            team: non_empty(self.team),
            start_from,
            start_to,
            season: non_empty(self.season),
            week: non_empty(self.week),
            sport: non_empty(self.sport),
            league: non_empty(self.league),
            limit: Some(self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)),
            offset: self.offset.unwrap_or(0),
        })
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_bound(s: &str, end_of_day: bool) -> Result<DateTime<Utc>, AppError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s.trim()) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::BadRequest(format!("invalid date `{s}`")))?;
    let time = if end_of_day {
        date.and_hms_milli_opt(23, 59, 59, 999)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc())
        .ok_or_else(|| AppError::BadRequest(format!("invalid date `{s}`")))
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct FixturesPage {
    pub data: Vec<Fixture>,
    pub page: u64,
    pub total_pages: u64,
    pub total: u64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub poller: HealthSnapshot,
    pub poll_in_progress: bool,
    pub streams: StreamStats,
    pub sessions: Vec<SubscriptionInfo>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum PollResponse {
    Completed(CycleReport),
    Skipped { skipped: bool },
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_fixtures(
    State(state): State<ApiState>,
    Query(params): Query<FixturesQuery>,
) -> Result<Json<FixturesPage>, AppError> {
    let query = params.into_query()?;
    let data = state.repo.query(&query).await?;
    let total = state.repo.count(&query).await?;

    let page_size = query.limit.unwrap_or(DEFAULT_PAGE_SIZE) as u64;
    Ok(Json(FixturesPage {
        data,
        page: query.offset as u64 / page_size + 1,
        total_pages: total.div_ceil(page_size),
        total,
    }))
}

async fn get_fixture(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Fixture>, AppError> {
    state
        .repo
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("fixture {id}")))
}

/// 409 with `{"skipped":true}` when a cycle is already in flight.
async fn force_poll(State(state): State<ApiState>) -> Result<(StatusCode, Json<PollResponse>), AppError> {
    match state.scheduler.run_cycle().await? {
        CycleOutcome::Completed(report) => Ok((StatusCode::OK, Json(PollResponse::Completed(report)))),
        CycleOutcome::Skipped => Ok((StatusCode::CONFLICT, Json(PollResponse::Skipped { skipped: true }))),
    }
}

/// Ends a stream session server-side. 404 when no such session is registered.
async fn close_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.streams.unsubscribe(&session_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("session {session_id}")))
    }
}

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let poller = state.health.snapshot();
    let status = if poller.last_cycle_at_ms.is_none() || !poller.last_cycle_ok {
        "degraded"
    } else {
        "ok"
    };
    Json(HealthResponse {
        status,
        poller,
        poll_in_progress: state.scheduler.is_running(),
        streams: state.streams.stats(),
        sessions: state.streams.subscriptions(),
    })
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencySummary> {
    Json(state.latency.summary())
}
