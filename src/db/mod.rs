pub mod memory;
pub mod models;
pub mod sqlite;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{Config, StorageBackend};
use crate::error::{Result, StorageError};
use crate::types::{Fixture, FixtureField, FixtureQuery};

pub use memory::MemoryFixtureRepository;
pub use sqlite::SqliteFixtureRepository;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result of one upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub is_new: bool,
    pub changed_fields: BTreeSet<FixtureField>,
}

impl UpsertOutcome {
    pub fn created() -> Self {
        Self { is_new: true, changed_fields: BTreeSet::new() }
    }

    pub fn unchanged() -> Self {
        Self { is_new: false, changed_fields: BTreeSet::new() }
    }

    pub fn is_effective_change(&self) -> bool {
        self.is_new || !self.changed_fields.is_empty()
    }
}

/// Durable keyed fixture storage. Single writer (the poller), many readers.
#[async_trait]
pub trait FixtureRepository: Send + Sync + 'static {
    /// Insert or update by id. Re-applying an identical fixture reports no
    /// changed fields; only `last_synced_at` is refreshed.
    async fn upsert(&self, fixture: &Fixture) -> StorageResult<UpsertOutcome>;

    /// Fixtures matching every set filter, ordered by start time then id.
    async fn query(&self, query: &FixtureQuery) -> StorageResult<Vec<Fixture>>;

    /// Number of fixtures matching the filters, ignoring limit/offset.
    async fn count(&self, query: &FixtureQuery) -> StorageResult<u64>;

    async fn get(&self, id: &str) -> StorageResult<Option<Fixture>>;

    /// Moves scheduled/live fixtures last sighted before `cutoff` to
    /// cancelled and returns them in their new state. Nothing is deleted.
    async fn mark_stale(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<Fixture>>;
}

/// Builds the repository selected by configuration. Call sites only ever see the trait.
pub async fn connect(cfg: &Config) -> Result<Arc<dyn FixtureRepository>> {
    match cfg.storage_backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryFixtureRepository::new())),
        StorageBackend::Sqlite => {
            let options = sqlx::sqlite::SqliteConnectOptions::new()
                .filename(&cfg.db_path)
                .create_if_missing(true);
            let pool = sqlx::SqlitePool::connect_with(options).await?;
            let repo = SqliteFixtureRepository::new(pool);
            repo.migrate().await?;
            Ok(Arc::new(repo))
        }
    }
}
