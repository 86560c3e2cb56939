use std::collections::BTreeMap;
use std::path::Path;

use chrono::Duration;
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::models::{RunStatus, Stats, TrendingTopic};

use super::runs::cost_between;
use super::settings::{parse_budget, select_setting, DAILY_BUDGET};
use super::{encode_day, Repository};

const STATS_WINDOW_DAYS: i64 = 7;

impl Repository {
    // Aggregates

    /// Enabled topics ranked by how many findings they first saw in the last
    /// `window_days` days (counted from the start of that day, UTC). Topics
    /// with nothing new are included with zero counts.
    pub async fn get_trending(&self, window_days: u32) -> Result<Vec<TrendingTopic>> {
        let since = self.window_start(i64::from(window_days));
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                r#"SELECT t.id AS id, t.name AS name,
                          COUNT(f.id) AS new_findings,
                          COALESCE(SUM(f.engagement_score), 0) AS total_engagement
                   FROM topics t
                   LEFT JOIN findings f ON f.topic_id = t.id AND f.first_seen >= ?1
                   WHERE t.enabled = 1
                   GROUP BY t.id, t.name
                   ORDER BY new_findings DESC, t.name"#,
            )?;
            let trending = stmt
                .query_map(params![since], |row| {
                    Ok(TrendingTopic {
                        id: row.get("id")?,
                        name: row.get("name")?,
                        new_findings: row.get("new_findings")?,
                        total_engagement: row.get("total_engagement")?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(trending)
        })
        .await
    }

    /// Corpus-wide counters. Run counts and cost cover the last seven days.
    pub async fn get_stats(&self) -> Result<Stats> {
        let since = self.window_start(STATS_WINDOW_DAYS);
        let db_size_bytes = storage_size(self.db_path());

        self.call(move |conn| {
            let tx = conn.transaction()?;
            let topics_active = count(&tx, "SELECT COUNT(*) FROM topics WHERE enabled = 1", [])?;
            let total_findings = count(&tx, "SELECT COUNT(*) FROM findings", [])?;
            let runs_7d = count(
                &tx,
                "SELECT COUNT(*) FROM research_runs WHERE run_date >= ?1",
                params![since],
            )?;
            let successful_7d = count(
                &tx,
                "SELECT COUNT(*) FROM research_runs WHERE run_date >= ?1 AND status = ?2",
                params![since, RunStatus::Completed],
            )?;
            let failed_7d = count(
                &tx,
                "SELECT COUNT(*) FROM research_runs WHERE run_date >= ?1 AND status = ?2",
                params![since, RunStatus::Failed],
            )?;
            let cost_7d = cost_between(&tx, &since, None)?;

            let sources = {
                let mut stmt = tx.prepare(
                    "SELECT source, COUNT(*) AS cnt FROM findings GROUP BY source ORDER BY source",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get("source")?, row.get("cnt")?)))?
                    .collect::<rusqlite::Result<BTreeMap<String, i64>>>()?;
                rows
            };
            let daily_budget = parse_budget(select_setting(&tx, DAILY_BUDGET)?.as_deref());

            Ok(Stats {
                topics_active,
                total_findings,
                db_size_bytes,
                runs_7d,
                successful_7d,
                failed_7d,
                cost_7d,
                sources,
                daily_budget,
            })
        })
        .await
    }

    fn window_start(&self, days: i64) -> String {
        encode_day((self.now() - Duration::days(days)).date_naive())
    }
}

fn count<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> rusqlite::Result<i64> {
    conn.query_row(sql, params, |row| row.get(0))
}

/// Size of the store file plus its write-ahead log.
fn storage_size(db_path: &Path) -> u64 {
    let mut wal = db_path.as_os_str().to_owned();
    wal.push("-wal");
    [db_path, Path::new(&wal)]
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum()
}
