use chrono::{Duration, NaiveDate};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::error::{AppError, Result};
use crate::models::{NewRun, Run, RunPatch, RunStatus};

use super::connection::write_tx;
use super::{encode_day, encode_time, time_column, Repository};

const RUN_COLUMNS: &str = "id, topic_id, run_date, source_mode, prompt_tokens, completion_tokens, \
     token_cost, duration_seconds, status, error_message, findings_new, findings_updated, created_at";

impl Repository {
    // Run ledger

    /// Opens a run in the `running` state and returns its id.
    pub async fn record_run(&self, run: NewRun) -> Result<i64> {
        let now = encode_time(&self.now());
        let topic_id = run.topic_id;

        let id = self
            .call(move |conn| {
                let tx = write_tx(conn)?;
                tx.execute(
                    "INSERT INTO research_runs (topic_id, run_date, source_mode, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?2)",
                    params![run.topic_id, now, run.source_mode, RunStatus::Running],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(id)
            })
            .await?;

        tracing::debug!("Recorded run {} for topic {}", id, topic_id);
        Ok(id)
    }

    /// Applies `patch` to a run. A running run may be finalized once; after
    /// that only the finding counts can change. Returns false for an unknown id.
    pub async fn update_run(&self, id: i64, patch: RunPatch) -> Result<bool> {
        patch.validate()?;
        if patch.is_empty() {
            return self.get_run(id).await.map(|run| run.is_some());
        }

        let updated = self
            .call(move |conn| {
                let tx = write_tx(conn)?;
                let Some(current) = select_run(&tx, id)? else {
                    return Ok(false);
                };
                check_transition(&current, &patch)?;

                let (assignments, mut values) = run_assignments(&patch);
                values.push(Value::Integer(id));
                tx.execute(
                    &format!(
                        "UPDATE research_runs SET {} WHERE id = ?",
                        assignments.join(", ")
                    ),
                    params_from_iter(values.iter()),
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await?;

        if updated {
            tracing::debug!("Updated run {}", id);
        }
        Ok(updated)
    }

    pub async fn get_run(&self, id: i64) -> Result<Option<Run>> {
        self.call(move |conn| Ok(select_run(conn, id)?)).await
    }

    /// Most recent runs of a topic, newest first.
    pub async fn runs_for_topic(&self, topic_id: i64, limit: usize) -> Result<Vec<Run>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM research_runs
                 WHERE topic_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2"
            ))?;
            let runs = stmt
                .query_map(params![topic_id, limit], run_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(runs)
        })
        .await
    }

    /// Sum of `token_cost` over runs whose `run_date` falls on `day` (UTC).
    pub async fn daily_cost(&self, day: NaiveDate) -> Result<f64> {
        let from = encode_day(day);
        let to = encode_day(day + Duration::days(1));
        self.call(move |conn| Ok(cost_between(conn, &from, Some(to.as_str()))?))
            .await
    }

    pub async fn daily_cost_today(&self) -> Result<f64> {
        self.daily_cost(self.now().date_naive()).await
    }
}

pub(crate) fn cost_between(conn: &Connection, from: &str, to: Option<&str>) -> rusqlite::Result<f64> {
    conn.query_row(
        "SELECT COALESCE(SUM(token_cost), 0) AS total
         FROM research_runs
         WHERE run_date >= ?1 AND (?2 IS NULL OR run_date < ?2)",
        params![from, to],
        |row| row.get("total"),
    )
}

fn select_run(conn: &Connection, id: i64) -> rusqlite::Result<Option<Run>> {
    conn.query_row(
        &format!("SELECT {RUN_COLUMNS} FROM research_runs WHERE id = ?1"),
        params![id],
        run_from_row,
    )
    .optional()
}

fn check_transition(current: &Run, patch: &RunPatch) -> Result<()> {
    if !current.status.is_terminal() || patch.is_counts_only() {
        return Ok(());
    }
    match patch.status {
        Some(to) => Err(AppError::InvalidTransition {
            run_id: current.id,
            from: current.status,
            to,
        }),
        None => Err(AppError::InvalidPatch(format!(
            "run {} is {} and only accepts finding counts",
            current.id, current.status
        ))),
    }
}

/// `column = ?` pairs for every field set in the patch, in parameter order.
fn run_assignments(patch: &RunPatch) -> (Vec<&'static str>, Vec<Value>) {
    let mut assignments = Vec::new();
    let mut values = Vec::new();

    if let Some(status) = patch.status {
        assignments.push("status = ?");
        values.push(Value::Text(status.as_str().to_string()));
    }
    if let Some(message) = patch.stored_error_message() {
        assignments.push("error_message = ?");
        values.push(Value::Text(message));
    }
    for (column, value) in [
        ("duration_seconds = ?", patch.duration_seconds),
        ("token_cost = ?", patch.token_cost),
    ] {
        if let Some(v) = value {
            assignments.push(column);
            values.push(Value::Real(v));
        }
    }
    for (column, value) in [
        ("prompt_tokens = ?", patch.prompt_tokens),
        ("completion_tokens = ?", patch.completion_tokens),
        ("findings_new = ?", patch.findings_new),
        ("findings_updated = ?", patch.findings_updated),
    ] {
        if let Some(v) = value {
            assignments.push(column);
            values.push(Value::Integer(v));
        }
    }

    (assignments, values)
}

fn run_from_row(row: &Row) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get("id")?,
        topic_id: row.get("topic_id")?,
        run_date: time_column(row, "run_date")?,
        source_mode: row.get("source_mode")?,
        prompt_tokens: row.get("prompt_tokens")?,
        completion_tokens: row.get("completion_tokens")?,
        token_cost: row.get("token_cost")?,
        duration_seconds: row.get("duration_seconds")?,
        status: row.get("status")?,
        error_message: row.get("error_message")?,
        findings_new: row.get("findings_new")?,
        findings_updated: row.get("findings_updated")?,
        created_at: time_column(row, "created_at")?,
    })
}
