use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use crate::db::models::FixtureRow;
use crate::db::{FixtureRepository, StorageResult, UpsertOutcome};
use crate::types::{Fixture, FixtureQuery, FixtureStatus};

const SELECT_COLUMNS: &str = "SELECT id, sport, league, home_team, away_team, start_time, status, \
     season, week, last_synced_at, payload FROM fixtures";

/// Persistent, transactional fixture store backed by SQLite.
pub struct SqliteFixtureRepository {
    pool: SqlitePool,
}

impl SqliteFixtureRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> StorageResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Appends `WHERE` clauses for every set filter. Each filter maps onto an
/// indexed column; team uses the two NOCASE team indexes. Sport and league
/// are stored lower-cased, so the bound value is lower-cased to match.
fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, q: &FixtureQuery) {
    qb.push(" WHERE 1 = 1");
    if let Some(status) = q.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(team) = &q.team {
        qb.push(" AND (home_team = ")
            .push_bind(team.clone())
            .push(" OR away_team = ")
            .push_bind(team.clone())
            .push(")");
    }
    if let Some(from) = q.start_from {
        qb.push(" AND start_time >= ").push_bind(from.timestamp_millis());
    }
    if let Some(to) = q.start_to {
        qb.push(" AND start_time <= ").push_bind(to.timestamp_millis());
    }
    if let Some(season) = &q.season {
        qb.push(" AND season = ").push_bind(season.clone());
    }
    if let Some(week) = &q.week {
        qb.push(" AND week = ").push_bind(week.clone());
    }
    if let Some(sport) = &q.sport {
        qb.push(" AND sport = ").push_bind(sport.to_ascii_lowercase());
    }
    if let Some(league) = &q.league {
        qb.push(" AND league = ").push_bind(league.to_ascii_lowercase());
    }
}

#[async_trait]
impl FixtureRepository for SqliteFixtureRepository {
    async fn upsert(&self, fixture: &Fixture) -> StorageResult<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;
        let now_ms = Utc::now().timestamp_millis();
        let synced_ms = fixture.last_synced_at.timestamp_millis();

        let existing: Option<FixtureRow> =
            sqlx::query_as::<_, FixtureRow>(&format!("{SELECT_COLUMNS} WHERE id = ?"))
                .bind(&fixture.id)
                .fetch_optional(&mut *tx)
                .await?;

        let outcome = match existing {
            None => {
                let payload = serde_json::to_string(&fixture.payload)?;
                sqlx::query(
                    r#"
                    INSERT INTO fixtures (
                        id, sport, league, home_team, away_team, start_time, status,
                        season, week, last_synced_at, payload, created_at, updated_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&fixture.id)
                .bind(&fixture.sport)
                .bind(&fixture.league)
                .bind(&fixture.home_team)
                .bind(&fixture.away_team)
                .bind(fixture.start_time.timestamp_millis())
                .bind(fixture.status.as_str())
                .bind(&fixture.season)
                .bind(&fixture.week)
                .bind(synced_ms)
                .bind(payload)
                .bind(now_ms)
                .bind(now_ms)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::created()
            }
            Some(row) => {
                let stored = Fixture::try_from(row)?;
                let changed_fields = fixture.diff(&stored);
                if changed_fields.is_empty() {
                    sqlx::query("UPDATE fixtures SET last_synced_at = ? WHERE id = ?")
                        .bind(synced_ms)
                        .bind(&fixture.id)
                        .execute(&mut *tx)
                        .await?;
                } else {
                    let payload = serde_json::to_string(&fixture.payload)?;
                    sqlx::query(
                        r#"
                        UPDATE fixtures SET
                            sport = ?, league = ?, home_team = ?, away_team = ?,
                            start_time = ?, status = ?, season = ?, week = ?,
                            last_synced_at = ?, payload = ?, updated_at = ?
                        WHERE id = ?
                        "#,
                    )
                    .bind(&fixture.sport)
                    .bind(&fixture.league)
                    .bind(&fixture.home_team)
                    .bind(&fixture.away_team)
                    .bind(fixture.start_time.timestamp_millis())
                    .bind(fixture.status.as_str())
                    .bind(&fixture.season)
                    .bind(&fixture.week)
                    .bind(synced_ms)
                    .bind(payload)
                    .bind(now_ms)
                    .bind(&fixture.id)
                    .execute(&mut *tx)
                    .await?;
                }
                UpsertOutcome { is_new: false, changed_fields }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn query(&self, query: &FixtureQuery) -> StorageResult<Vec<Fixture>> {
        let mut qb = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        push_filters(&mut qb, query);
        qb.push(" ORDER BY start_time ASC, id ASC LIMIT ")
            .push_bind(query.limit.map_or(-1, |l| l.min(i64::MAX as usize) as i64))
            .push(" OFFSET ")
            .push_bind(query.offset.min(i64::MAX as usize) as i64);

        let rows: Vec<FixtureRow> = qb.build_query_as::<FixtureRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(Fixture::try_from).collect()
    }

    async fn count(&self, query: &FixtureQuery) -> StorageResult<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM fixtures");
        push_filters(&mut qb, query);
        let count: i64 = qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn get(&self, id: &str) -> StorageResult<Option<Fixture>> {
        let row: Option<FixtureRow> =
            sqlx::query_as::<_, FixtureRow>(&format!("{SELECT_COLUMNS} WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Fixture::try_from).transpose()
    }

    async fn mark_stale(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<Fixture>> {
        let cutoff_ms = cutoff.timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let rows: Vec<FixtureRow> = sqlx::query_as::<_, FixtureRow>(&format!(
            "{SELECT_COLUMNS} WHERE status IN ('scheduled', 'live') AND last_synced_at < ? \
             ORDER BY start_time ASC, id ASC"
        ))
        .bind(cutoff_ms)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        sqlx::query(
            "UPDATE fixtures SET status = 'cancelled', updated_at = ? \
             WHERE status IN ('scheduled', 'live') AND last_synced_at < ?",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(cutoff_ms)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let stale = rows
            .into_iter()
            .map(|row| {
                let mut fixture = Fixture::try_from(row)?;
                fixture.status = FixtureStatus::Cancelled;
                Ok(fixture)
            })
            .collect::<StorageResult<Vec<_>>>()?;
        debug!(count = stale.len(), "marked stale fixtures cancelled");
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::fixture;
    use crate::types::FixtureField;
    use chrono::{Duration, TimeZone};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn repo() -> SqliteFixtureRepository {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let repo = SqliteFixtureRepository::new(pool);
        repo.migrate().await.unwrap();
        repo
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let repo = repo().await;
        let f = fixture("f1", "nba");

        let first = repo.upsert(&f).await.unwrap();
        assert!(first.is_new);

        let second = repo.upsert(&f).await.unwrap();
        assert!(!second.is_new);
        assert!(second.changed_fields.is_empty());
    }

    #[tokio::test]
    async fn upsert_reports_changed_fields_and_persists_them() {
        let repo = repo().await;
        let f = fixture("f1", "nba");
        repo.upsert(&f).await.unwrap();

        let mut live = f.clone();
        live.status = FixtureStatus::Live;
        live.last_synced_at = f.last_synced_at + Duration::minutes(5);
        let outcome = repo.upsert(&live).await.unwrap();
        assert_eq!(outcome.changed_fields.into_iter().collect::<Vec<_>>(), vec![FixtureField::Status]);

        let stored = repo.get("f1").await.unwrap().unwrap();
        assert_eq!(stored, live);
    }

    #[tokio::test]
    async fn unchanged_sighting_refreshes_last_synced() {
        let repo = repo().await;
        let f = fixture("f1", "nba");
        repo.upsert(&f).await.unwrap();

        let mut seen_again = f.clone();
        seen_again.last_synced_at = f.last_synced_at + Duration::hours(1);
        repo.upsert(&seen_again).await.unwrap();

        let stored = repo.get("f1").await.unwrap().unwrap();
        assert_eq!(stored.last_synced_at, seen_again.last_synced_at);
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let repo = repo().await;
        assert!(repo.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn query_filters_compose() {
        let repo = repo().await;
        let base = fixture("a", "nba");

        let mut b = fixture("b", "nba");
        b.home_team = "Chicago Bulls".into();
        b.away_team = "Miami Heat".into();
        b.start_time = base.start_time + Duration::days(1);
        b.status = FixtureStatus::Live;

        let mut c = fixture("c", "nba");
        c.start_time = base.start_time + Duration::days(2);
        c.season = Some("2023".into());

        for f in [&c, &b, &base] {
            repo.upsert(f).await.unwrap();
        }

        let all = repo.query(&FixtureQuery::default()).await.unwrap();
        assert_eq!(all.iter().map(|f| f.id.as_str()).collect::<Vec<_>>(), vec!["a", "b", "c"]);

        let knicks = FixtureQuery { team: Some("new york knicks".into()), ..Default::default() };
        assert_eq!(repo.query(&knicks).await.unwrap().len(), 2);

        let live = FixtureQuery { status: Some(FixtureStatus::Live), ..Default::default() };
        assert_eq!(repo.query(&live).await.unwrap()[0].id, "b");

        let window = FixtureQuery {
            start_from: Some(base.start_time + Duration::hours(1)),
            start_to: Some(c.start_time),
            ..Default::default()
        };
        assert_eq!(
            repo.query(&window).await.unwrap().iter().map(|f| f.id.as_str()).collect::<Vec<_>>(),
            vec!["b", "c"]
        );

        let composite = FixtureQuery {
            team: Some("Boston Celtics".into()),
            season: Some("2024".into()),
            ..Default::default()
        };
        let hits = repo.query(&composite).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
        assert_eq!(repo.count(&composite).await.unwrap(), 1);

        let paged = FixtureQuery { limit: Some(1), offset: 1, ..Default::default() };
        assert_eq!(repo.query(&paged).await.unwrap()[0].id, "b");
        assert_eq!(repo.count(&paged).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn sport_league_and_week_filters() {
        let repo = repo().await;
        let mut week1 = fixture("w1", "nfl");
        week1.sport = "football".into();
        week1.week = Some("1".into());
        let mut week2 = week1.clone();
        week2.id = "w2".into();
        week2.week = Some("2".into());
        let hoops = fixture("h1", "nba");

        for f in [&week1, &week2, &hoops] {
            repo.upsert(f).await.unwrap();
        }

        let mixed_case = FixtureQuery {
            sport: Some("Football".into()),
            league: Some("NFL".into()),
            ..Default::default()
        };
        assert_eq!(repo.count(&mixed_case).await.unwrap(), 2);

        let league_only = FixtureQuery { league: Some("Nba".into()), ..Default::default() };
        assert_eq!(repo.query(&league_only).await.unwrap()[0].id, "h1");

        let composite = FixtureQuery {
            sport: Some("football".into()),
            season: Some("2024".into()),
            week: Some("2".into()),
            ..Default::default()
        };
        let hits = repo.query(&composite).await.unwrap();
        assert_eq!(hits.iter().map(|f| f.id.as_str()).collect::<Vec<_>>(), vec!["w2"]);

        let no_such_week = FixtureQuery { week: Some("17".into()), ..Default::default() };
        assert_eq!(repo.count(&no_such_week).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_stale_cancels_open_fixtures_only() {
        let repo = repo().await;
        let old = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        let mut stale = fixture("stale", "nba");
        stale.last_synced_at = old;
        let mut done = fixture("done", "nba");
        done.last_synced_at = old;
        done.status = FixtureStatus::Completed;
        let fresh = fixture("fresh", "nba");

        for f in [&stale, &done, &fresh] {
            repo.upsert(f).await.unwrap();
        }

        let cutoff = old + Duration::days(1);
        let removed = repo.mark_stale(cutoff).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, "stale");
        assert_eq!(removed[0].status, FixtureStatus::Cancelled);

        // Still queryable, never deleted.
        let stored = repo.get("stale").await.unwrap().unwrap();
        assert_eq!(stored.status, FixtureStatus::Cancelled);
        assert!(repo.mark_stale(cutoff).await.unwrap().is_empty());
    }
}
