use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::UPSTREAM_TIMEOUT_SECS;
use crate::error::{MalformedRecord, UpstreamError};
use crate::types::{Fixture, FixtureStatus, PollScope};

/// Hard stop on pagination in case the provider keeps reporting more pages.
const MAX_PAGES: u32 = 200;

/// Filter passed to the provider for one fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchFilter {
    pub sport: Option<String>,
    pub league: Option<String>,
    pub start_after: Option<DateTime<Utc>>,
    pub start_before: Option<DateTime<Utc>>,
}

impl FetchFilter {
    pub fn for_scope(scope: &PollScope) -> Self {
        Self {
            sport: Some(scope.sport.clone()),
            league: scope.league.clone(),
            ..Self::default()
        }
    }
}

/// Fetch contract of the upstream provider. Returns every raw record across
/// all pages, or an error if any page could not be fetched.
#[async_trait]
pub trait FixtureSource: Send + Sync + 'static {
    async fn fetch_fixtures(
        &self,
        filter: &FetchFilter,
    ) -> std::result::Result<Vec<serde_json::Value>, UpstreamError>;
}

// ---------------------------------------------------------------------------
// HTTP provider
// ---------------------------------------------------------------------------

pub struct HttpFixtureSource {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpFixtureSource {
    pub fn new(base_url: &str, api_key: &str) -> std::result::Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(UPSTREAM_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn fetch_page(
        &self,
        filter: &FetchFilter,
        page: u32,
    ) -> std::result::Result<serde_json::Value, UpstreamError> {
        let mut params: Vec<(&str, String)> = vec![("page", page.to_string())];
        if let Some(sport) = &filter.sport {
            params.push(("sport", sport.clone()));
        }
        if let Some(league) = &filter.league {
            params.push(("league", league.clone()));
        }
        if let Some(after) = filter.start_after {
            params.push(("start_date_after", after.to_rfc3339()));
        }
        if let Some(before) = filter.start_before {
            params.push(("start_date_before", before.to_rfc3339()));
        }

        let resp = self
            .client
            .get(format!("{}/fixtures/active", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .header("accept", "application/json")
            .query(&params)
            .send()
            .await?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok());
            return Err(UpstreamError::RateLimited { retry_after_secs });
        }
        if !status.is_success() {
            return Err(UpstreamError::Status(status.as_u16()));
        }

        Ok(resp.json().await?)
    }
}

#[async_trait]
impl FixtureSource for HttpFixtureSource {
    async fn fetch_fixtures(
        &self,
        filter: &FetchFilter,
    ) -> std::result::Result<Vec<serde_json::Value>, UpstreamError> {
        let mut records = Vec::new();
        let mut page = 1u32;

        loop {
            let body = self.fetch_page(filter, page).await?;
            let (items, total_pages) = split_page(&body)?;
            debug!(page, total_pages, items = items.len(), "upstream page fetched");
            records.extend(items);

            if page >= total_pages {
                break;
            }
            if page >= MAX_PAGES {
                warn!(total_pages, "upstream reported more than {MAX_PAGES} pages, truncating");
                break;
            }
            page += 1;
        }

        info!(
            sport = filter.sport.as_deref().unwrap_or("*"),
            league = filter.league.as_deref().unwrap_or("*"),
            fetched = records.len(),
            "Fetched {} fixtures from upstream",
            records.len(),
        );
        Ok(records)
    }
}

/// Splits one provider page into its records and the reported page count.
fn split_page(
    body: &serde_json::Value,
) -> std::result::Result<(Vec<serde_json::Value>, u32), UpstreamError> {
    let items = body
        .get("data")
        .and_then(|d| d.as_array())
        .cloned()
        .ok_or_else(|| UpstreamError::InvalidResponse("response has no `data` array".to_string()))?;
    let total_pages = body
        .get("total_pages")
        .and_then(|t| t.as_u64())
        .map(|t| t.min(u64::from(u32::MAX)) as u32)
        .unwrap_or(1)
        .max(1);
    Ok((items, total_pages))
}

// ---------------------------------------------------------------------------
// Record normalisation
// ---------------------------------------------------------------------------

/// Turns one raw provider record into a `Fixture`. `scope` supplies sport and
/// league when the record itself does not carry them.
pub fn parse_fixture_record(
    raw: &serde_json::Value,
    scope: &PollScope,
    now: DateTime<Utc>,
) -> std::result::Result<Fixture, MalformedRecord> {
    let id = string_or_number(raw.get("id"))
        .filter(|s| !s.is_empty())
        .ok_or(MalformedRecord::MissingField("id"))?;

    let home_team = team_name(raw, "home_team_display", "home_competitors")
        .ok_or(MalformedRecord::MissingField("home_team_display"))?;
    let away_team = team_name(raw, "away_team_display", "away_competitors")
        .ok_or(MalformedRecord::MissingField("away_team_display"))?;

    let start_raw = raw
        .get("start_date")
        .and_then(|s| s.as_str())
        .ok_or(MalformedRecord::MissingField("start_date"))?;
    let start_time = parse_start_time(start_raw).ok_or_else(|| MalformedRecord::InvalidField {
        field: "start_date",
        value: start_raw.to_string(),
    })?;

    let status_raw = raw
        .get("status")
        .and_then(|s| s.as_str())
        .ok_or(MalformedRecord::MissingField("status"))?;
    let mut status = FixtureStatus::parse(status_raw).ok_or_else(|| MalformedRecord::InvalidField {
        field: "status",
        value: status_raw.to_string(),
    })?;
    let is_live = raw.get("is_live").and_then(|v| v.as_bool()).unwrap_or(false);
    if is_live && status == FixtureStatus::Scheduled {
        status = FixtureStatus::Live;
    }

    let sport = nested_id(raw, "sport")
        .unwrap_or_else(|| scope.sport.clone());
    let league = nested_id(raw, "league")
        .or_else(|| scope.league.clone())
        .ok_or(MalformedRecord::MissingField("league"))?;

    let season = string_or_number(raw.get("season_year")).map(|year| {
        match raw.get("season_type").and_then(|t| t.as_str()).filter(|t| !t.is_empty()) {
            Some(kind) => format!("{year} {kind}"),
            None => year,
        }
    });
    let week = string_or_number(raw.get("season_week"));

    Ok(Fixture {
        id,
        sport,
        league,
        home_team,
        away_team,
        start_time,
        status,
        season,
        week,
        last_synced_at: now,
        payload: raw.clone(),
    })
}

/// RFC 3339, truncated to millisecond precision so stored and fresh values compare equal.
pub fn parse_start_time(s: &str) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(s.trim()).ok()?;
    DateTime::from_timestamp_millis(parsed.timestamp_millis())
}

fn string_or_number(v: Option<&serde_json::Value>) -> Option<String> {
    match v? {
        serde_json::Value::String(s) => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn team_name(raw: &serde_json::Value, display_key: &str, competitors_key: &str) -> Option<String> {
    raw.get(display_key)
        .and_then(|v| v.as_str())
        .or_else(|| {
            raw.get(competitors_key)
                .and_then(|c| c.as_array())
                .and_then(|a| a.first())
                .and_then(|c| c.get("name"))
                .and_then(|n| n.as_str())
        })
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// `{"league": {"id": "nfl"}}` → `nfl`. Also accepts a bare string.
fn nested_id(raw: &serde_json::Value, key: &str) -> Option<String> {
    let v = raw.get(key)?;
    let id = match v {
        serde_json::Value::String(s) => s.as_str(),
        _ => v.get("id")?.as_str()?,
    };
    let id = id.trim().to_ascii_lowercase();
    (!id.is_empty()).then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nfl() -> PollScope {
        PollScope { sport: "football".into(), league: Some("nfl".into()) }
    }

    fn raw_record() -> serde_json::Value {
        json!({
            "id": "202512029BE1BA5B",
            "game_id": "37240-37430-25-48",
            "start_date": "2025-12-02T01:15:00Z",
            "home_team_display": "New England Patriots",
            "away_team_display": "New York Giants",
            "status": "unplayed",
            "is_live": false,
            "season_type": "Regular Season",
            "season_year": "2025",
            "season_week": "13",
            "sport": {"id": "football", "name": "Football"},
            "league": {"id": "nfl", "name": "NFL"}
        })
    }

    #[test]
    fn parses_complete_record() {
        let now = Utc::now();
        let f = parse_fixture_record(&raw_record(), &nfl(), now).unwrap();
        assert_eq!(f.id, "202512029BE1BA5B");
        assert_eq!(f.sport, "football");
        assert_eq!(f.league, "nfl");
        assert_eq!(f.home_team, "New England Patriots");
        assert_eq!(f.status, FixtureStatus::Scheduled);
        assert_eq!(f.season.as_deref(), Some("2025 Regular Season"));
        assert_eq!(f.week.as_deref(), Some("13"));
        assert_eq!(f.start_time.to_rfc3339(), "2025-12-02T01:15:00+00:00");
        assert_eq!(f.last_synced_at, now);
        assert_eq!(f.payload, raw_record());
    }

    #[test]
    fn falls_back_to_competitor_names_and_scope_league() {
        let raw = json!({
            "id": 991,
            "start_date": "2025-03-01T19:00:00+01:00",
            "status": "live",
            "home_competitors": [{"name": "Arsenal"}],
            "away_competitors": [{"name": "Chelsea"}]
        });
        let scope = PollScope { sport: "soccer".into(), league: Some("epl".into()) };
        let f = parse_fixture_record(&raw, &scope, Utc::now()).unwrap();
        assert_eq!(f.id, "991");
        assert_eq!(f.home_team, "Arsenal");
        assert_eq!(f.away_team, "Chelsea");
        assert_eq!(f.league, "epl");
        assert_eq!(f.status, FixtureStatus::Live);
        assert_eq!(f.start_time.to_rfc3339(), "2025-03-01T18:00:00+00:00");
    }

    #[test]
    fn is_live_flag_promotes_scheduled() {
        let mut raw = raw_record();
        raw["is_live"] = json!(true);
        let f = parse_fixture_record(&raw, &nfl(), Utc::now()).unwrap();
        assert_eq!(f.status, FixtureStatus::Live);
    }

    #[test]
    fn missing_required_fields_are_malformed() {
        let mut no_id = raw_record();
        no_id.as_object_mut().unwrap().remove("id");
        assert_eq!(
            parse_fixture_record(&no_id, &nfl(), Utc::now()),
            Err(MalformedRecord::MissingField("id"))
        );

        let mut bad_date = raw_record();
        bad_date["start_date"] = json!("next tuesday");
        assert!(matches!(
            parse_fixture_record(&bad_date, &nfl(), Utc::now()),
            Err(MalformedRecord::InvalidField { field: "start_date", .. })
        ));

        let mut bad_status = raw_record();
        bad_status["status"] = json!("???");
        assert!(matches!(
            parse_fixture_record(&bad_status, &nfl(), Utc::now()),
            Err(MalformedRecord::InvalidField { field: "status", .. })
        ));
    }

    #[test]
    fn record_without_any_league_is_malformed() {
        let mut raw = raw_record();
        raw.as_object_mut().unwrap().remove("league");
        let scope = PollScope { sport: "football".into(), league: None };
        assert_eq!(
            parse_fixture_record(&raw, &scope, Utc::now()),
            Err(MalformedRecord::MissingField("league"))
        );
    }

    #[test]
    fn split_page_reads_total_pages() {
        let body = json!({"data": [{"id": "a"}, {"id": "b"}], "page": 1, "total_pages": 3});
        let (items, total) = split_page(&body).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(total, 3);

        let (_, total) = split_page(&json!({"data": []})).unwrap();
        assert_eq!(total, 1);

        assert!(matches!(
            split_page(&json!({"error": "nope"})),
            Err(UpstreamError::InvalidResponse(_))
        ));
    }
}
