use std::sync::Arc;

use rusqlite::{Transaction, TransactionBehavior};
use tokio_rusqlite::Connection;

use crate::config::Config;
use crate::error::Result;

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;
PRAGMA foreign_keys = ON;
"#;

/// Opens a handle on the store file configured for WAL, durable commits and
/// foreign keys. Creates the parent directory on first use.
pub(crate) async fn open(config: &Config) -> Result<Connection> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(&config.db_path).await?;
    let busy_timeout = config.busy_timeout();
    conn.call(move |conn| {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(PRAGMAS)?;
        Ok(())
    })
    .await?;

    Ok(conn)
}

/// Runs `f` on a fresh handle and closes the handle afterwards, whatever `f`
/// returned. Lock contention retries the whole thing with backoff.
pub(crate) async fn with_connection<F, R>(config: &Config, f: F) -> Result<R>
where
    F: Fn(&mut rusqlite::Connection) -> Result<R> + Send + Sync + 'static,
    R: Send + 'static,
{
    let f = Arc::new(f);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = run_once(config, Arc::clone(&f)).await;
        match result {
            Err(e) if e.is_busy() && attempt < config.retry.max_attempts => {
                let delay = config.retry.delay_for(attempt);
                tracing::warn!(
                    "Store busy (attempt {}/{}), retrying in {:?}: {}",
                    attempt,
                    config.retry.max_attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

async fn run_once<F, R>(config: &Config, f: Arc<F>) -> Result<R>
where
    F: Fn(&mut rusqlite::Connection) -> Result<R> + Send + Sync + 'static,
    R: Send + 'static,
{
    let conn = open(config).await?;
    let result = conn.call(move |conn| Ok(f(conn))).await;
    if let Err(e) = conn.close().await {
        tracing::debug!("Failed to close store handle: {}", e);
    }
    result?
}

/// Starts a write transaction that takes the write lock up front, so
/// contention shows up here rather than halfway through.
pub(crate) fn write_tx(conn: &mut rusqlite::Connection) -> rusqlite::Result<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
}
