use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::Result;

use super::connection::with_connection;
use super::migrations;
use super::schema::MIGRATIONS;
use super::text_index::Fts5Index;

/// Entry point to the research store. Holds no open handle: each operation
/// opens its own connection, works inside one transaction and closes it.
#[derive(Clone)]
pub struct Repository {
    config: Config,
    clock: Arc<dyn Clock>,
    index: Fts5Index,
}

impl Repository {
    pub async fn new(config: &Config) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let repo = Self {
            config: config.clone(),
            clock,
            index: Fts5Index,
        };
        repo.ensure_schema().await?;
        Ok(repo)
    }

    /// Creates missing tables and applies pending migrations. Safe to call
    /// from several processes at once.
    pub async fn ensure_schema(&self) -> Result<i64> {
        let version = self
            .call(|conn| migrations::ensure_schema(conn, MIGRATIONS))
            .await?;
        tracing::debug!("Store at schema version {}", version);
        Ok(version)
    }

    pub async fn schema_version(&self) -> Result<i64> {
        self.call(|conn| Ok(migrations::current_version(conn)?)).await
    }

    pub fn db_path(&self) -> &Path {
        &self.config.db_path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn index(&self) -> Fts5Index {
        self.index
    }

    pub(crate) async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: Fn(&mut rusqlite::Connection) -> Result<R> + Send + Sync + 'static,
        R: Send + 'static,
    {
        with_connection(&self.config, f).await
    }
}
