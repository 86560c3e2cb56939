//! Forward-only schema migrations.
//!
//! Each pending migration runs in its own IMMEDIATE transaction together with
//! the row that records it, and the recorded version is re-read once the write
//! lock is held. Two processes starting at once therefore apply every
//! migration exactly once, and a failure leaves the store at the last version
//! that committed.

use rusqlite::{params, Connection};

use super::connection::write_tx;
use super::schema::{Migration, SCHEMA_VERSION_TABLE};
use crate::error::{AppError, Result};

pub(crate) fn current_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Brings the store up to the newest migration in `migrations` and returns
/// the resulting version.
pub(crate) fn ensure_schema(conn: &mut Connection, migrations: &[Migration]) -> Result<i64> {
    conn.execute_batch(SCHEMA_VERSION_TABLE)
        .map_err(|e| AppError::Migration {
            version: 0,
            message: e.to_string(),
        })?;

    for migration in migrations {
        let tx = write_tx(conn)?;
        if current_version(&tx)? >= migration.version {
            continue;
        }

        tx.execute_batch(migration.sql)
            .map_err(|e| AppError::Migration {
                version: migration.version,
                message: format!("{}: {e}", migration.name),
            })?;
        tx.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![migration.version],
        )?;
        tx.commit()?;

        tracing::info!(
            "Applied schema migration {} ({})",
            migration.version,
            migration.name
        );
    }

    Ok(current_version(conn)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::{LATEST_VERSION, MIGRATIONS};

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE name = ?1",
            params![name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            > 0
    }

    #[test]
    fn fresh_store_reaches_latest_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(ensure_schema(&mut conn, MIGRATIONS).unwrap(), LATEST_VERSION);
        for table in ["topics", "research_runs", "findings", "findings_fts", "settings"] {
            assert!(table_exists(&conn, table), "missing {table}");
        }
        assert!(table_exists(&conn, "idx_runs_run_date"));
    }

    #[test]
    fn rerunning_is_a_no_op() {
        let mut conn = Connection::open_in_memory().unwrap();
        ensure_schema(&mut conn, MIGRATIONS).unwrap();
        conn.execute("UPDATE settings SET value = '9.00' WHERE key = 'daily_budget'", [])
            .unwrap();

        assert_eq!(ensure_schema(&mut conn, MIGRATIONS).unwrap(), LATEST_VERSION);
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, LATEST_VERSION);
        let budget: String = conn
            .query_row("SELECT value FROM settings WHERE key = 'daily_budget'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(budget, "9.00");
    }

    #[test]
    fn only_newer_migrations_are_applied() {
        let mut conn = Connection::open_in_memory().unwrap();
        ensure_schema(&mut conn, &MIGRATIONS[..1]).unwrap();
        assert_eq!(current_version(&conn).unwrap(), 1);
        assert!(!table_exists(&conn, "idx_runs_run_date"));

        assert_eq!(ensure_schema(&mut conn, MIGRATIONS).unwrap(), 2);
        assert!(table_exists(&conn, "idx_runs_run_date"));
    }

    #[test]
    fn failed_migration_stops_at_last_good_version() {
        let broken = [
            Migration {
                version: 1,
                name: "base",
                sql: MIGRATIONS[0].sql,
            },
            Migration {
                version: 2,
                name: "broken",
                sql: "CREATE TABLE half (id INTEGER); ALTER TABLE nope ADD COLUMN x TEXT;",
            },
        ];
        let mut conn = Connection::open_in_memory().unwrap();

        let err = ensure_schema(&mut conn, &broken).unwrap_err();
        assert!(matches!(err, AppError::Migration { version: 2, .. }));
        assert_eq!(current_version(&conn).unwrap(), 1);
        assert!(!table_exists(&conn, "half"));

        // Fixed migration applies on retry.
        assert_eq!(ensure_schema(&mut conn, MIGRATIONS).unwrap(), 2);
    }
}
