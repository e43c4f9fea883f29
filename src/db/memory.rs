use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::{FixtureRepository, StorageResult, UpsertOutcome};
use crate::types::{Fixture, FixtureQuery, FixtureStatus};

// ---------------------------------------------------------------------------
// Indexes
// ---------------------------------------------------------------------------

/// Primary map plus the secondary indexes a query can start from.
/// All of it sits behind one lock so an index never disagrees with the map.
#[derive(Debug, Default)]
struct Indexed {
    fixtures: HashMap<String, Fixture>,
    /// (start_time, id); iteration order is the query result order.
    by_start: BTreeSet<(DateTime<Utc>, String)>,
    by_status: HashMap<FixtureStatus, BTreeSet<String>>,
    /// lower-cased team name → ids where it plays home or away
    by_team: HashMap<String, BTreeSet<String>>,
    by_season: HashMap<String, BTreeSet<String>>,
}

impl Indexed {
    fn index(&mut self, f: &Fixture) {
        self.by_start.insert((f.start_time, f.id.clone()));
        self.by_status.entry(f.status).or_default().insert(f.id.clone());
        for team in [&f.home_team, &f.away_team] {
            self.by_team.entry(team.to_lowercase()).or_default().insert(f.id.clone());
        }
        if let Some(season) = &f.season {
            self.by_season.entry(season.clone()).or_default().insert(f.id.clone());
        }
    }

    fn unindex(&mut self, f: &Fixture) {
        self.by_start.remove(&(f.start_time, f.id.clone()));
        remove_from(&mut self.by_status, &f.status, &f.id);
        for team in [&f.home_team, &f.away_team] {
            remove_from(&mut self.by_team, &team.to_lowercase(), &f.id);
        }
        if let Some(season) = &f.season {
            remove_from(&mut self.by_season, season, &f.id);
        }
    }

    fn put(&mut self, f: Fixture) {
        if let Some(old) = self.fixtures.remove(&f.id) {
            self.unindex(&old);
        }
        self.index(&f);
        self.fixtures.insert(f.id.clone(), f);
    }

    /// Smallest candidate id set any set filter can provide; `None` means
    /// no indexed filter applies and every fixture is a candidate.
    fn candidates(&self, q: &FixtureQuery) -> Option<Vec<&String>> {
        let mut best = None;

        if let Some(status) = q.status {
            keep_smallest(&mut best, ids_of(self.by_status.get(&status)));
        }
        if let Some(team) = &q.team {
            keep_smallest(&mut best, ids_of(self.by_team.get(&team.to_lowercase())));
        }
        if let Some(season) = &q.season {
            keep_smallest(&mut best, ids_of(self.by_season.get(season)));
        }
        if q.start_from.is_some() || q.start_to.is_some() {
            let lower = (q.start_from.unwrap_or(DateTime::<Utc>::MIN_UTC), String::new());
            let ids = self
                .by_start
                .range(lower..)
                .take_while(|(start, _)| q.start_to.map_or(true, |to| *start <= to))
                .map(|(_, id)| id)
                .collect();
            keep_smallest(&mut best, ids);
        }
        best
    }

    fn select(&self, q: &FixtureQuery) -> Vec<&Fixture> {
        let mut hits: Vec<&Fixture> = match self.candidates(q) {
            Some(ids) => ids.into_iter().filter_map(|id| self.fixtures.get(id)).collect(),
            None => self.fixtures.values().collect(),
        };
        hits.retain(|f| q.matches(f));
        hits.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        hits
    }
}

fn ids_of(set: Option<&BTreeSet<String>>) -> Vec<&String> {
    set.map(|s| s.iter().collect()).unwrap_or_default()
}

fn keep_smallest<'a>(best: &mut Option<Vec<&'a String>>, ids: Vec<&'a String>) {
    if best.as_ref().map_or(true, |b| ids.len() < b.len()) {
        *best = Some(ids);
    }
}

fn remove_from<K: Hash + Eq>(map: &mut HashMap<K, BTreeSet<String>>, key: &K, id: &str) {
    if let Some(ids) = map.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            map.remove(key);
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryFixtureRepository
// ---------------------------------------------------------------------------

/// Process-local repository. Same contract as the SQLite store; state is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryFixtureRepository {
    inner: RwLock<Indexed>,
}

impl MemoryFixtureRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Indexed> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Indexed> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.read().fixtures.len()
    }
}

#[async_trait]
impl FixtureRepository for MemoryFixtureRepository {
    async fn upsert(&self, fixture: &Fixture) -> StorageResult<UpsertOutcome> {
        let mut inner = self.write();
        let outcome = match inner.fixtures.get_mut(&fixture.id) {
            None => UpsertOutcome::created(),
            Some(stored) => {
                let changed_fields = fixture.diff(stored);
                if changed_fields.is_empty() {
                    // Not an indexed field; update in place.
                    stored.last_synced_at = fixture.last_synced_at;
                    return Ok(UpsertOutcome::unchanged());
                }
                UpsertOutcome { is_new: false, changed_fields }
            }
        };
        inner.put(fixture.clone());
        Ok(outcome)
    }

    async fn query(&self, query: &FixtureQuery) -> StorageResult<Vec<Fixture>> {
        let inner = self.read();
        Ok(inner
            .select(query)
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn count(&self, query: &FixtureQuery) -> StorageResult<u64> {
        Ok(self.read().select(query).len() as u64)
    }

    async fn get(&self, id: &str) -> StorageResult<Option<Fixture>> {
        Ok(self.read().fixtures.get(id).cloned())
    }

    async fn mark_stale(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<Fixture>> {
        let mut inner = self.write();
        let mut stale: Vec<Fixture> = inner
            .fixtures
            .values()
            .filter(|f| f.status.is_open() && f.last_synced_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));

        for f in &mut stale {
            f.status = FixtureStatus::Cancelled;
            inner.put(f.clone());
        }
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::fixture;
    use crate::types::FixtureField;
    use chrono::{Duration, TimeZone};

    #[tokio::test]
    async fn upsert_twice_yields_no_changes() {
        let repo = MemoryFixtureRepository::new();
        let f = fixture("f1", "nba");
        assert!(repo.upsert(&f).await.unwrap().is_new);
        let again = repo.upsert(&f).await.unwrap();
        assert_eq!(again, UpsertOutcome::unchanged());
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn update_moves_fixture_between_indexes() {
        let repo = MemoryFixtureRepository::new();
        let f = fixture("f1", "nba");
        repo.upsert(&f).await.unwrap();

        let mut moved = f.clone();
        moved.home_team = "Toronto Raptors".into();
        moved.status = FixtureStatus::Live;
        let outcome = repo.upsert(&moved).await.unwrap();
        assert_eq!(
            outcome.changed_fields.into_iter().collect::<Vec<_>>(),
            vec![FixtureField::HomeTeam, FixtureField::Status]
        );

        let by_old_team = FixtureQuery { team: Some("Boston Celtics".into()), ..Default::default() };
        assert!(repo.query(&by_old_team).await.unwrap().is_empty());
        let by_new_team = FixtureQuery { team: Some("toronto raptors".into()), ..Default::default() };
        assert_eq!(repo.query(&by_new_team).await.unwrap().len(), 1);

        let scheduled = FixtureQuery { status: Some(FixtureStatus::Scheduled), ..Default::default() };
        assert!(repo.query(&scheduled).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn query_orders_by_start_then_id_and_pages() {
        let repo = MemoryFixtureRepository::new();
        let base = fixture("m", "nba");
        let mut early = fixture("z", "nba");
        early.start_time = base.start_time - Duration::hours(2);
        let mut tie = fixture("a", "nba");
        tie.start_time = base.start_time;

        for f in [&base, &early, &tie] {
            repo.upsert(f).await.unwrap();
        }

        let all = repo.query(&FixtureQuery::default()).await.unwrap();
        assert_eq!(all.iter().map(|f| f.id.as_str()).collect::<Vec<_>>(), vec!["z", "a", "m"]);

        let window = FixtureQuery {
            start_from: Some(base.start_time),
            start_to: Some(base.start_time),
            season: Some("2024".into()),
            limit: Some(1),
            offset: 1,
            ..Default::default()
        };
        let page = repo.query(&window).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "m");
        assert_eq!(repo.count(&window).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn sport_league_and_week_filters() {
        let repo = MemoryFixtureRepository::new();
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
    async fn mark_stale_keeps_fixture_queryable() {
        let repo = MemoryFixtureRepository::new();
        let old = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let mut f = fixture("gone", "nba");
        f.last_synced_at = old;
        repo.upsert(&f).await.unwrap();

        let removed = repo.mark_stale(old + Duration::hours(1)).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].status, FixtureStatus::Cancelled);

        let cancelled = FixtureQuery { status: Some(FixtureStatus::Cancelled), ..Default::default() };
        assert_eq!(repo.query(&cancelled).await.unwrap()[0].id, "gone");
        assert!(repo.mark_stale(old + Duration::hours(1)).await.unwrap().is_empty());
    }
}
