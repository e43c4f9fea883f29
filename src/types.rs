use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    /// Opaque upstream identifier, unique across all sports.
    pub id: String,
    pub sport: String,
    pub league: String,
    pub home_team: String,
    pub away_team: String,
    pub start_time: DateTime<Utc>,
    pub status: FixtureStatus,
    pub season: Option<String>,
    pub week: Option<String>,
    /// Refreshed on every sighting; not part of the compared field set.
    pub last_synced_at: DateTime<Utc>,
    /// Raw upstream record, passed through untouched.
    pub payload: serde_json::Value,
}

impl Fixture {
    /// Field-by-field comparison against a previously stored version.
    /// `last_synced_at` is ignored. The payload is compared structurally, so
    /// key order inside nested objects never counts as a change.
    pub fn diff(&self, stored: &Fixture) -> BTreeSet<FixtureField> {
        let mut changed = BTreeSet::new();
        if self.sport != stored.sport {
            changed.insert(FixtureField::Sport);
        }
        if self.league != stored.league {
            changed.insert(FixtureField::League);
        }
        if self.home_team != stored.home_team {
            changed.insert(FixtureField::HomeTeam);
        }
        if self.away_team != stored.away_team {
            changed.insert(FixtureField::AwayTeam);
        }
        if self.start_time != stored.start_time {
            changed.insert(FixtureField::StartTime);
        }
        if self.status != stored.status {
            changed.insert(FixtureField::Status);
        }
        if self.season != stored.season {
            changed.insert(FixtureField::Season);
        }
        if self.week != stored.week {
            changed.insert(FixtureField::Week);
        }
        if self.payload != stored.payload {
            changed.insert(FixtureField::Payload);
        }
        changed
    }

    pub fn involves_team(&self, team: &str) -> bool {
        self.home_team.eq_ignore_ascii_case(team) || self.away_team.eq_ignore_ascii_case(team)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixtureStatus {
    Scheduled,
    Live,
    Completed,
    Cancelled,
}

impl FixtureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixtureStatus::Scheduled => "scheduled",
            FixtureStatus::Live => "live",
            FixtureStatus::Completed => "completed",
            FixtureStatus::Cancelled => "cancelled",
        }
    }

    /// Maps both our own names and the provider's vocabulary.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scheduled" | "unplayed" | "not_started" | "pre-game" => Some(FixtureStatus::Scheduled),
            "live" | "in_progress" | "in progress" => Some(FixtureStatus::Live),
            "completed" | "finished" | "final" => Some(FixtureStatus::Completed),
            "cancelled" | "canceled" | "postponed" | "suspended" | "abandoned" => {
                Some(FixtureStatus::Cancelled)
            }
            _ => None,
        }
    }

    /// Scheduled and live fixtures are still expected to show up upstream.
    pub fn is_open(&self) -> bool {
        matches!(self, FixtureStatus::Scheduled | FixtureStatus::Live)
    }
}

impl std::fmt::Display for FixtureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Compared attributes of a fixture, reported in `Updated` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureField {
    Sport,
    League,
    HomeTeam,
    AwayTeam,
    StartTime,
    Status,
    Season,
    Week,
    Payload,
}

// ---------------------------------------------------------------------------
// Change events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    /// Process-scoped, strictly increasing.
    pub seq: u64,
    #[serde(flatten)]
    pub change: FixtureChange,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FixtureChange {
    Created {
        fixture: Fixture,
    },
    Updated {
        changed_fields: BTreeSet<FixtureField>,
        fixture: Fixture,
    },
    Removed {
        fixture: Fixture,
    },
}

impl FixtureChange {
    pub fn fixture(&self) -> &Fixture {
        match self {
            FixtureChange::Created { fixture }
            | FixtureChange::Updated { fixture, .. }
            | FixtureChange::Removed { fixture } => fixture,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FixtureChange::Created { .. } => "created",
            FixtureChange::Updated { .. } => "updated",
            FixtureChange::Removed { .. } => "removed",
        }
    }
}

impl ChangeEvent {
    pub fn fixture(&self) -> &Fixture {
        self.change.fixture()
    }
}

// ---------------------------------------------------------------------------
// Queries and scopes
// ---------------------------------------------------------------------------

/// Filter combination accepted by `FixtureRepository::query`. Every field is
/// optional; set fields are AND-ed together.
#[derive(Debug, Clone, Default)]
pub struct FixtureQuery {
    pub status: Option<FixtureStatus>,
    /// Matches home or away team, case-insensitive.
    pub team: Option<String>,
    /// Inclusive lower bound on start time.
    pub start_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on start time.
    pub start_to: Option<DateTime<Utc>>,
    pub season: Option<String>,
    /// Exact match on the provider's week label.
    pub week: Option<String>,
    pub sport: Option<String>,
    pub league: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl FixtureQuery {
    pub fn matches(&self, f: &Fixture) -> bool {
        self.status.map_or(true, |s| f.status == s)
            && self.team.as_deref().map_or(true, |t| f.involves_team(t))
            && self.start_from.map_or(true, |from| f.start_time >= from)
            && self.start_to.map_or(true, |to| f.start_time <= to)
            && self.season.as_deref().map_or(true, |s| f.season.as_deref() == Some(s))
            && self.week.as_deref().map_or(true, |w| f.week.as_deref() == Some(w))
            && self.sport.as_deref().map_or(true, |s| f.sport.eq_ignore_ascii_case(s))
            && self.league.as_deref().map_or(true, |l| f.league.eq_ignore_ascii_case(l))
    }
}

/// One sport/league pair the poller keeps synchronized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollScope {
    pub sport: String,
    pub league: Option<String>,
}

impl PollScope {
    /// Parses `sport` or `sport:league`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().splitn(2, ':');
        let sport = parts.next()?.trim().to_ascii_lowercase();
        if sport.is_empty() {
            return None;
        }
        let league = parts
            .next()
            .map(|l| l.trim().to_ascii_lowercase())
            .filter(|l| !l.is_empty());
        Some(Self { sport, league })
    }
}

impl std::fmt::Display for PollScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.league {
            Some(league) => write!(f, "{}:{}", self.sport, league),
            None => write!(f, "{}", self.sport),
        }
    }
}

/// Subscriber-side interest filter. No fields set = match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFilter {
    pub sport: Option<String>,
    pub league: Option<String>,
}

impl StreamFilter {
    pub fn matches(&self, fixture: &Fixture) -> bool {
        self.sport
            .as_deref()
            .map_or(true, |s| fixture.sport.eq_ignore_ascii_case(s))
            && self
                .league
                .as_deref()
                .map_or(true, |l| fixture.league.eq_ignore_ascii_case(l))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn fixture(id: &str, league: &str) -> Fixture {
        Fixture {
            id: id.to_string(),
            sport: "basketball".to_string(),
            league: league.to_string(),
            home_team: "Boston Celtics".to_string(),
            away_team: "New York Knicks".to_string(),
            start_time: Utc.with_ymd_and_hms(2025, 1, 10, 0, 30, 0).unwrap(),
            status: FixtureStatus::Scheduled,
            season: Some("2024".to_string()),
            week: None,
            last_synced_at: Utc.with_ymd_and_hms(2025, 1, 9, 12, 0, 0).unwrap(),
            payload: serde_json::json!({"id": id, "league": {"id": league}}),
        }
    }

    #[test]
    fn identical_fixture_has_empty_diff() {
        let a = fixture("f1", "nba");
        let mut b = a.clone();
        b.last_synced_at = Utc::now();
        assert!(a.diff(&b).is_empty());
    }

    #[test]
    fn diff_reports_each_changed_field() {
        let stored = fixture("f1", "nba");
        let mut fresh = stored.clone();
        fresh.status = FixtureStatus::Live;
        fresh.payload = serde_json::json!({"id": "f1", "is_live": true});
        let changed = fresh.diff(&stored);
        assert_eq!(
            changed.into_iter().collect::<Vec<_>>(),
            vec![FixtureField::Status, FixtureField::Payload]
        );
    }

    #[test]
    fn reordered_payload_keys_are_not_a_change() {
        let stored = fixture("f1", "nba");
        let mut fresh = stored.clone();
        fresh.payload = serde_json::from_str(r#"{"league":{"id":"nba"},"id":"f1"}"#).unwrap();
        assert!(fresh.diff(&stored).is_empty());
    }

    #[test]
    fn status_accepts_provider_vocabulary() {
        assert_eq!(FixtureStatus::parse("unplayed"), Some(FixtureStatus::Scheduled));
        assert_eq!(FixtureStatus::parse("Live"), Some(FixtureStatus::Live));
        assert_eq!(FixtureStatus::parse("finished"), Some(FixtureStatus::Completed));
        assert_eq!(FixtureStatus::parse("postponed"), Some(FixtureStatus::Cancelled));
        assert_eq!(FixtureStatus::parse("halftime-ish"), None);
    }

    #[test]
    fn poll_scope_parses_optional_league() {
        assert_eq!(
            PollScope::parse("Football:NFL"),
            Some(PollScope { sport: "football".into(), league: Some("nfl".into()) })
        );
        assert_eq!(
            PollScope::parse("soccer"),
            Some(PollScope { sport: "soccer".into(), league: None })
        );
        assert_eq!(PollScope::parse(":nfl"), None);
    }

    #[test]
    fn stream_filter_matches_league_only() {
        let filter = StreamFilter { sport: None, league: Some("NBA".into()) };
        assert!(filter.matches(&fixture("f1", "nba")));
        assert!(!filter.matches(&fixture("f2", "wnba")));
        assert!(StreamFilter::default().matches(&fixture("f3", "euroleague")));
    }

    #[test]
    fn change_event_serializes_tagged() {
        let event = ChangeEvent {
            seq: 7,
            change: FixtureChange::Updated {
                changed_fields: [FixtureField::Status].into_iter().collect(),
                fixture: fixture("f1", "nba"),
            },
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["seq"], 7);
        assert_eq!(v["kind"], "updated");
        assert_eq!(v["changed_fields"][0], "status");
        assert_eq!(v["fixture"]["id"], "f1");
    }
}
