use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::models::{Topic, TopicSummary};

use super::connection::write_tx;
use super::text_index::TextIndex;
use super::{encode_time, opt_time_column, time_column, Repository};

const TOPIC_COLUMNS: &str = "t.id AS id, t.name AS name, t.search_queries AS search_queries, \
     t.schedule AS schedule, t.enabled AS enabled, t.created_at AS created_at, \
     t.updated_at AS updated_at";

impl Repository {
    // Topic operations

    /// Inserts the topic, or overwrites queries and schedule of the existing
    /// topic with the same name.
    pub async fn add_topic(
        &self,
        name: &str,
        search_queries: Option<Vec<String>>,
        schedule: &str,
    ) -> Result<Topic> {
        let name = name.trim().to_string();
        let schedule = schedule.to_string();
        let queries_json = match search_queries.filter(|q| !q.is_empty()) {
            Some(q) => Some(serde_json::to_string(&q)?),
            None => None,
        };
        let now = encode_time(&self.now());

        let topic = self
            .call(move |conn| {
                let tx = write_tx(conn)?;
                tx.execute(
                    r#"INSERT INTO topics (name, search_queries, schedule, created_at, updated_at)
                       VALUES (?1, ?2, ?3, ?4, ?4)
                       ON CONFLICT(name) DO UPDATE SET
                           search_queries = excluded.search_queries,
                           schedule = excluded.schedule,
                           updated_at = excluded.updated_at"#,
                    params![name, queries_json, schedule, now],
                )?;
                let topic = select_topic(&tx, &name)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
                tx.commit()?;
                Ok(topic)
            })
            .await?;

        tracing::info!("Saved topic {:?} (id {})", topic.name, topic.id);
        Ok(topic)
    }

    /// Deletes the topic with its runs and findings. Returns false when no
    /// topic has that name.
    pub async fn remove_topic(&self, name: &str) -> Result<bool> {
        let topic_name = name.to_string();
        let index = self.index();

        let removed = self
            .call(move |conn| {
                let tx = write_tx(conn)?;
                let Some(topic_id) = tx
                    .query_row("SELECT id FROM topics WHERE name = ?1", params![topic_name], |row| {
                        row.get::<_, i64>("id")
                    })
                    .optional()?
                else {
                    return Ok(None);
                };

                let finding_ids = {
                    let mut stmt = tx.prepare("SELECT id FROM findings WHERE topic_id = ?1")?;
                    let ids = stmt
                        .query_map(params![topic_id], |row| row.get::<_, i64>("id"))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    ids
                };
                for id in &finding_ids {
                    index.remove(&tx, *id)?;
                }
                tx.execute("DELETE FROM findings WHERE topic_id = ?1", params![topic_id])?;
                let runs = tx.execute(
                    "DELETE FROM research_runs WHERE topic_id = ?1",
                    params![topic_id],
                )?;
                tx.execute("DELETE FROM topics WHERE id = ?1", params![topic_id])?;
                tx.commit()?;
                Ok(Some((finding_ids.len(), runs)))
            })
            .await?;

        match removed {
            Some((findings, runs)) => {
                tracing::info!(
                    "Removed topic {:?} with {} findings and {} runs",
                    name,
                    findings,
                    runs
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn list_topics(&self) -> Result<Vec<TopicSummary>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(&format!(
                r#"SELECT {TOPIC_COLUMNS},
                          (SELECT COUNT(*) FROM findings WHERE topic_id = t.id) AS finding_count,
                          (SELECT MAX(run_date) FROM research_runs WHERE topic_id = t.id) AS last_run,
                          (SELECT status FROM research_runs WHERE topic_id = t.id
                           ORDER BY created_at DESC, id DESC LIMIT 1) AS last_status
                   FROM topics t
                   ORDER BY t.name"#
            ))?;
            let topics = stmt
                .query_map([], topic_summary_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(topics)
        })
        .await
    }

    pub async fn get_topic(&self, name: &str) -> Result<Option<Topic>> {
        let name = name.to_string();
        self.call(move |conn| Ok(select_topic(conn, &name)?)).await
    }

    /// Returns false when no topic has that name.
    pub async fn set_topic_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        let name = name.to_string();
        let now = encode_time(&self.now());
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE topics SET enabled = ?1, updated_at = ?2 WHERE name = ?3",
                params![enabled, now, name],
            )?;
            Ok(changed > 0)
        })
        .await
    }
}

fn select_topic(conn: &Connection, name: &str) -> rusqlite::Result<Option<Topic>> {
    conn.query_row(
        &format!("SELECT {TOPIC_COLUMNS} FROM topics t WHERE t.name = ?1"),
        params![name],
        topic_from_row,
    )
    .optional()
}

pub(crate) fn topic_from_row(row: &Row) -> rusqlite::Result<Topic> {
    let search_queries = match row.get::<_, Option<String>>("search_queries")? {
        Some(json) => Some(serde_json::from_str(&json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };

    Ok(Topic {
        id: row.get("id")?,
        name: row.get("name")?,
        search_queries,
        schedule: row.get("schedule")?,
        enabled: row.get("enabled")?,
        created_at: time_column(row, "created_at")?,
        updated_at: time_column(row, "updated_at")?,
    })
}

fn topic_summary_from_row(row: &Row) -> rusqlite::Result<TopicSummary> {
    Ok(TopicSummary {
        topic: topic_from_row(row)?,
        finding_count: row.get("finding_count")?,
        last_run: opt_time_column(row, "last_run")?,
        last_status: row.get("last_status")?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use crate::db::test_support::{repo, start};
    use crate::models::{CandidateFinding, NewRun, RunPatch, RunStatus, DAILY_SCHEDULE, WEEKLY_SCHEDULE};

    #[tokio::test]
    async fn add_is_an_upsert_by_name() {
        let (_dir, clock, repo) = repo().await;
        let first = repo.add_topic("AI video tools", None, DAILY_SCHEDULE).await.unwrap();
        assert_eq!(first.search_queries, None);
        assert!(first.enabled);

        clock.advance(Duration::hours(1));
        let second = repo
            .add_topic(
                "AI video tools",
                Some(vec!["sora".into(), "runway".into()]),
                WEEKLY_SCHEDULE,
            )
            .await
            .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.schedule, WEEKLY_SCHEDULE);
        assert_eq!(second.search_queries, Some(vec!["sora".to_string(), "runway".to_string()]));
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.updated_at, start() + Duration::hours(1));
        assert_eq!(repo.list_topics().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn get_unknown_topic_is_none() {
        let (_dir, _clock, repo) = repo().await;
        assert!(repo.get_topic("nothing").await.unwrap().is_none());
        assert!(!repo.remove_topic("nothing").await.unwrap());
        assert!(!repo.set_topic_enabled("nothing", false).await.unwrap());
    }

    #[tokio::test]
    async fn list_is_sorted_with_stats() {
        let (_dir, clock, repo) = repo().await;
        let zeta = repo.add_topic("zeta", None, DAILY_SCHEDULE).await.unwrap();
        repo.add_topic("alpha", None, DAILY_SCHEDULE).await.unwrap();

        let run_a = repo.record_run(NewRun::new(zeta.id)).await.unwrap();
        repo.update_run(run_a, RunPatch::completed()).await.unwrap();
        repo.store_findings(
            run_a,
            zeta.id,
            vec![
                CandidateFinding::new("x", "https://x.test/1"),
                CandidateFinding::new("x", "https://x.test/2"),
            ],
        )
        .await
        .unwrap();
        clock.advance(Duration::minutes(5));
        let run_b = repo.record_run(NewRun::new(zeta.id)).await.unwrap();
        repo.update_run(run_b, RunPatch::failed("boom")).await.unwrap();

        let topics = repo.list_topics().await.unwrap();
        let names: Vec<_> = topics.iter().map(|t| t.topic.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);

        assert_eq!(topics[0].finding_count, 0);
        assert_eq!(topics[0].last_run, None);
        assert_eq!(topics[0].last_status, None);

        assert_eq!(topics[1].finding_count, 2);
        assert_eq!(topics[1].last_run, Some(start() + Duration::minutes(5)));
        assert_eq!(topics[1].last_status, Some(RunStatus::Failed));
    }

    #[tokio::test]
    async fn remove_cascades_runs_findings_and_index() {
        let (_dir, _clock, repo) = repo().await;
        let doomed = repo.add_topic("doomed", None, DAILY_SCHEDULE).await.unwrap();
        let kept = repo.add_topic("kept", None, DAILY_SCHEDULE).await.unwrap();

        let kept_run = repo.record_run(NewRun::new(kept.id)).await.unwrap();
        repo.store_findings(
            kept_run,
            kept.id,
            vec![CandidateFinding::new("x", "https://x.test/shared").content("shared zebra")],
        )
        .await
        .unwrap();

        let doomed_run = repo.record_run(NewRun::new(doomed.id)).await.unwrap();
        repo.store_findings(
            doomed_run,
            doomed.id,
            vec![
                CandidateFinding::new("x", "https://x.test/own").content("unique aardvark"),
                // Re-sighting of the kept topic's finding by a doomed run.
                CandidateFinding::new("x", "https://x.test/shared"),
            ],
        )
        .await
        .unwrap();

        assert!(repo.remove_topic("doomed").await.unwrap());

        assert!(repo.get_topic("doomed").await.unwrap().is_none());
        assert!(repo.get_run(doomed_run).await.unwrap().is_none());
        assert!(repo.get_new_findings(doomed.id, None).await.unwrap().is_empty());
        assert!(repo.search_findings("aardvark", 10).await.unwrap().is_empty());

        let names: Vec<_> = repo
            .list_topics()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.topic.name)
            .collect();
        assert_eq!(names, vec!["kept"]);

        let shared = repo.get_new_findings(kept.id, None).await.unwrap();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].run_id, None);
        assert_eq!(shared[0].sighting_count, 2);
        assert_eq!(repo.search_findings("zebra", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_topics_keep_their_data() {
        let (_dir, _clock, repo) = repo().await;
        repo.add_topic("quiet", None, DAILY_SCHEDULE).await.unwrap();
        assert!(repo.set_topic_enabled("quiet", false).await.unwrap());
        assert!(!repo.get_topic("quiet").await.unwrap().unwrap().enabled);
    }
}
