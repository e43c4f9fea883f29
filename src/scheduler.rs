use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::config::{
    Config, MAX_CONSECUTIVE_STORAGE_FAILURES, POLL_INTERVAL_SECS, SHUTDOWN_GRACE_SECS, STALE_AFTER_SECS,
};
use crate::db::FixtureRepository;
use crate::error::CycleError;
use crate::fetcher::{parse_fixture_record, FetchFilter, FixtureSource};
use crate::stream::StreamManager;
use crate::types::{ChangeEvent, FixtureChange, PollScope};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub scopes: Vec<PollScope>,
    pub interval: Duration,
    /// Only ask the provider for fixtures starting within this many days.
    pub lookahead_days: Option<i64>,
    /// Open fixtures not sighted for this long are marked cancelled.
    pub stale_after: Duration,
    pub max_consecutive_storage_failures: u32,
    pub shutdown_grace: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            scopes: vec![PollScope { sport: "football".into(), league: Some("nfl".into()) }],
            interval: Duration::from_secs(POLL_INTERVAL_SECS),
            lookahead_days: None,
            stale_after: Duration::from_secs(STALE_AFTER_SECS),
            max_consecutive_storage_failures: MAX_CONSECUTIVE_STORAGE_FAILURES,
            shutdown_grace: Duration::from_secs(SHUTDOWN_GRACE_SECS),
        }
    }
}

impl From<&Config> for PollerConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            scopes: cfg.poll_scopes.clone(),
            interval: Duration::from_secs(cfg.poll_interval_secs),
            lookahead_days: cfg.poll_lookahead_days,
            stale_after: Duration::from_secs(cfg.stale_after_secs),
            max_consecutive_storage_failures: cfg.max_consecutive_storage_failures,
            shutdown_grace: Duration::from_secs(cfg.shutdown_grace_secs),
        }
    }
}

/// Counts for one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub malformed: usize,
    /// Records repeating an id already applied this cycle.
    pub duplicates: usize,
    pub removed: usize,
    pub duration_ms: u64,
}

impl CycleReport {
    pub fn events(&self) -> usize {
        self.created + self.updated + self.removed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Another cycle was already running; this trigger did nothing.
    Skipped,
}

// ---------------------------------------------------------------------------
// PollingScheduler
// ---------------------------------------------------------------------------

/// Periodically pulls fixtures from the provider, applies them to the
/// repository and publishes one change event per effective change.
///
/// At most one cycle runs at a time, whether triggered by the ticker or by hand.
pub struct PollingScheduler {
    source: Arc<dyn FixtureSource>,
    repo: Arc<dyn FixtureRepository>,
    streams: Arc<StreamManager>,
    cfg: PollerConfig,
    in_flight: Mutex<()>,
    last_seq: AtomicU64,
    health: Arc<HealthState>,
    latency: Arc<LatencyStats>,
}

impl PollingScheduler {
    pub fn new(
        source: Arc<dyn FixtureSource>,
        repo: Arc<dyn FixtureRepository>,
        streams: Arc<StreamManager>,
        cfg: PollerConfig,
        health: Arc<HealthState>,
        latency: Arc<LatencyStats>,
    ) -> Self {
        Self {
            source,
            repo,
            streams,
            cfg,
            in_flight: Mutex::new(()),
            last_seq: AtomicU64::new(0),
            health,
            latency,
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.try_lock().is_err()
    }

    /// Runs one fetch → apply → publish cycle now, unless one is in flight.
    /// Failures are logged and recorded in health before being returned.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, CycleError> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            self.health.inc_cycles_skipped();
            warn!(skipped = self.health.cycles_skipped(), "Poll cycle already in progress, skipping");
            return Ok(CycleOutcome::Skipped);
        };

        let started = Instant::now();
        let result = self.cycle().await;
        let elapsed = started.elapsed();
        self.latency.record(elapsed);
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;

        match result {
            Ok(mut report) => {
                report.duration_ms = elapsed.as_millis() as u64;
                self.health.record_success(now_ms);
                info!(
                    fetched = report.fetched,
                    created = report.created,
                    updated = report.updated,
                    unchanged = report.unchanged,
                    malformed = report.malformed,
                    removed = report.removed,
                    duration_ms = report.duration_ms,
                    "Poll cycle complete: +{} created, ~{} updated, -{} removed",
                    report.created,
                    report.updated,
                    report.removed,
                );
                Ok(CycleOutcome::Completed(report))
            }
            Err(CycleError::Upstream(e)) => {
                self.health.record_upstream_failure(now_ms);
                warn!("Poll cycle aborted, upstream unavailable: {e}");
                Err(CycleError::Upstream(e))
            }
            Err(CycleError::Storage(e)) => {
                let streak = self.health.record_storage_failure(now_ms);
                if streak >= self.cfg.max_consecutive_storage_failures {
                    error!(alert = true, consecutive_failures = streak, "Fixture storage failing: {e}");
                } else {
                    error!(consecutive_failures = streak, "Poll cycle aborted, storage error: {e}");
                }
                Err(CycleError::Storage(e))
            }
        }
    }

    fn filter_for(&self, scope: &PollScope, now: DateTime<Utc>) -> FetchFilter {
        let mut filter = FetchFilter::for_scope(scope);
        if let Some(days) = self.cfg.lookahead_days {
            filter.start_before = Some(now + chrono::Duration::days(days));
        }
        filter
    }

    fn emit(&self, change: FixtureChange) {
        let seq = self.last_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let report = self.streams.publish(ChangeEvent { seq, change });
        debug!(seq, matched = report.matched, overflowed = report.overflowed, "Change published");
    }

    async fn cycle(&self) -> Result<CycleReport, CycleError> {
        let now = Utc::now();

        // Fetch every scope before touching storage so an upstream failure
        // leaves the repository exactly as it was.
        let mut batches = Vec::with_capacity(self.cfg.scopes.len());
        for scope in &self.cfg.scopes {
            let records = self.source.fetch_fixtures(&self.filter_for(scope, now)).await?;
            debug!(scope = %scope, records = records.len(), "Fetched scope");
            batches.push((scope, records));
        }

        let mut report = CycleReport::default();
        let mut seen = HashSet::new();
        for (scope, records) in &batches {
            report.fetched += records.len();
            for raw in records {
                let fixture = match parse_fixture_record(raw, scope, now) {
                    Ok(f) => f,
                    Err(e) => {
                        report.malformed += 1;
                        debug!(scope = %scope, "Skipping malformed record: {e}");
                        continue;
                    }
                };
                if !seen.insert(fixture.id.clone()) {
                    report.duplicates += 1;
                    continue;
                }

                let outcome = self.repo.upsert(&fixture).await?;
                if outcome.is_new {
                    report.created += 1;
                    self.emit(FixtureChange::Created { fixture });
                } else if outcome.is_effective_change() {
                    report.updated += 1;
                    self.emit(FixtureChange::Updated { changed_fields: outcome.changed_fields, fixture });
                } else {
                    report.unchanged += 1;
                }
            }
        }

        let stale_after = chrono::Duration::from_std(self.cfg.stale_after).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(stale_after).unwrap_or(DateTime::<Utc>::MIN_UTC);
        for fixture in self.repo.mark_stale(cutoff).await? {
            report.removed += 1;
            self.emit(FixtureChange::Removed { fixture });
        }

        Ok(report)
    }

    /// Ticks every `interval` until `shutdown` fires. Each tick's cycle runs in
    /// its own task so a slow cycle makes the next tick skip rather than queue.
    /// On shutdown an in-flight cycle gets `shutdown_grace` to finish.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // skip immediate first tick; startup pre-warm already ran

        let mut cycles: Vec<JoinHandle<()>> = Vec::new();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    cycles.retain(|h| !h.is_finished());
                    let scheduler = Arc::clone(&self);
                    cycles.push(tokio::spawn(async move {
                        // Outcome already logged by run_cycle.
                        let _ = scheduler.run_cycle().await;
                    }));
                }
                _ = shutdown.changed() => break,
            }
        }

        for mut handle in cycles {
            if handle.is_finished() {
                continue;
            }
            if tokio::time::timeout(self.cfg.shutdown_grace, &mut handle).await.is_err() {
                warn!(grace_secs = self.cfg.shutdown_grace.as_secs(), "Poll cycle did not finish in time, aborting");
                handle.abort();
            }
        }
        info!("Polling scheduler stopped");
    }
}
