//! Database row type matching `migrations/0001_create_fixtures.sql`.
//! Timestamps are unix milliseconds; the payload is JSON text.

use chrono::DateTime;

use crate::error::StorageError;
use crate::types::{Fixture, FixtureStatus};

#[derive(Debug, sqlx::FromRow)]
pub struct FixtureRow {
    pub id: String,
    pub sport: String,
    pub league: String,
    pub home_team: String,
    pub away_team: String,
    pub start_time: i64,
    pub status: String,
    pub season: Option<String>,
    pub week: Option<String>,
    pub last_synced_at: i64,
    pub payload: String,
}

impl TryFrom<FixtureRow> for Fixture {
    type Error = StorageError;

    fn try_from(row: FixtureRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StorageError::Corrupt { id: row.id.clone(), reason };

        let status = FixtureStatus::parse(&row.status)
            .ok_or_else(|| corrupt(format!("unknown status `{}`", row.status)))?;
        let start_time = DateTime::from_timestamp_millis(row.start_time)
            .ok_or_else(|| corrupt(format!("start_time {} out of range", row.start_time)))?;
        let last_synced_at = DateTime::from_timestamp_millis(row.last_synced_at)
            .ok_or_else(|| corrupt(format!("last_synced_at {} out of range", row.last_synced_at)))?;
        let payload = serde_json::from_str(&row.payload)
            .map_err(|e| corrupt(format!("payload is not JSON: {e}")))?;

        Ok(Fixture {
            id: row.id,
            sport: row.sport,
            league: row.league,
            home_team: row.home_team,
            away_team: row.away_team,
            start_time,
            status,
            season: row.season,
            week: row.week,
            last_synced_at,
            payload,
        })
    }
}
