use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::models::{CandidateFinding, Finding, FindingPatch, IngestCounts, SearchHit};

use super::connection::write_tx;
use super::text_index::{IndexedText, TextIndex};
use super::{encode_time, time_column, Repository};

const FINDING_COLUMNS: &str = "f.id AS id, f.run_id AS run_id, f.topic_id AS topic_id, \
     f.source AS source, f.source_url AS source_url, f.source_title AS source_title, \
     f.author AS author, f.content AS content, f.summary AS summary, \
     f.engagement_score AS engagement_score, f.relevance_score AS relevance_score, \
     f.first_seen AS first_seen, f.last_seen AS last_seen, f.sighting_count AS sighting_count, \
     f.dismissed AS dismissed";

impl Repository {
    // Findings

    /// Ingests one run's candidates, deduplicating on URL.
    ///
    /// A URL already in the store counts as a re-sighting: `last_seen` moves
    /// to now, `sighting_count` goes up by one, `engagement_score` keeps the
    /// highest value ever observed and `run_id` points at this run. Text,
    /// source, topic and `first_seen` keep their first-observed values.
    /// Candidates without a URL are dropped. The counts are written back onto
    /// the run, and the whole batch commits or fails as one.
    pub async fn store_findings(
        &self,
        run_id: i64,
        topic_id: i64,
        candidates: Vec<CandidateFinding>,
    ) -> Result<IngestCounts> {
        let now = encode_time(&self.now());
        let index = self.index();
        let submitted = candidates.len();

        let (counts, dropped) = self
            .call(move |conn| {
                let tx = write_tx(conn)?;
                let mut counts = IngestCounts::default();
                let mut dropped = 0;

                for candidate in &candidates {
                    let Some(url) = candidate.dedup_key() else {
                        dropped += 1;
                        continue;
                    };

                    if resight(&tx, &url, candidate, run_id, &now)? {
                        counts.updated += 1;
                        continue;
                    }

                    match insert_new(&tx, &url, candidate, run_id, topic_id, &now)? {
                        Some(doc) => {
                            index.add(&tx, doc.as_indexed())?;
                            counts.new += 1;
                        }
                        None => {
                            // Lost an insert race on the URL; the row exists now.
                            resight(&tx, &url, candidate, run_id, &now)?;
                            counts.updated += 1;
                        }
                    }
                }

                tx.execute(
                    "UPDATE research_runs SET findings_new = ?1, findings_updated = ?2 WHERE id = ?3",
                    params![counts.new, counts.updated, run_id],
                )?;
                tx.commit()?;
                Ok((counts, dropped))
            })
            .await?;

        if dropped > 0 {
            tracing::debug!("Dropped {} candidates without a URL for run {}", dropped, run_id);
        }
        tracing::info!(
            "Run {}: {} candidates, {} new, {} updated",
            run_id,
            submitted,
            counts.new,
            counts.updated
        );
        Ok(counts)
    }

    /// Non-dismissed findings of a topic first seen at or after `since`,
    /// newest first.
    pub async fn get_new_findings(
        &self,
        topic_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Finding>> {
        let since = since.map(|s| encode_time(&s));
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {FINDING_COLUMNS} FROM findings f
                 WHERE f.topic_id = ?1 AND f.dismissed = 0
                   AND (?2 IS NULL OR f.first_seen >= ?2)
                 ORDER BY f.first_seen DESC, f.id DESC"
            ))?;
            let findings = stmt
                .query_map(params![topic_id, since], finding_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(findings)
        })
        .await
    }

    /// Ranked full-text search over every topic.
    pub async fn search_findings(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let query = query.trim().to_string();
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let index = self.index();

        self.call(move |conn| {
            let tx = conn.transaction()?;
            let mut hits = Vec::new();
            for (id, rank) in index.search(&tx, &query, limit)? {
                let hit = tx
                    .query_row(
                        &format!(
                            "SELECT {FINDING_COLUMNS}, t.name AS topic_name
                             FROM findings f
                             LEFT JOIN topics t ON t.id = f.topic_id
                             WHERE f.id = ?1 AND f.dismissed = 0"
                        ),
                        params![id],
                        |row| {
                            Ok(SearchHit {
                                finding: finding_from_row(row)?,
                                topic_name: row.get("topic_name")?,
                                rank,
                            })
                        },
                    )
                    .optional()?;
                hits.extend(hit);
            }
            Ok(hits)
        })
        .await
    }

    pub async fn get_finding(&self, id: i64) -> Result<Option<Finding>> {
        self.call(move |conn| Ok(select_finding(conn, id)?)).await
    }

    /// Hides a finding from retrieval and search. Returns false for an unknown id.
    pub async fn dismiss_finding(&self, id: i64) -> Result<bool> {
        self.update_finding(
            id,
            FindingPatch {
                dismissed: Some(true),
                ..FindingPatch::default()
            },
        )
        .await
    }

    /// Removes a finding and its index entry. Returns false for an unknown id.
    pub async fn delete_finding(&self, id: i64) -> Result<bool> {
        let index = self.index();
        let deleted = self
            .call(move |conn| {
                let tx = write_tx(conn)?;
                index.remove(&tx, id)?;
                let deleted = tx.execute("DELETE FROM findings WHERE id = ?1", params![id])?;
                tx.commit()?;
                Ok(deleted > 0)
            })
            .await?;
        if deleted {
            tracing::debug!("Deleted finding {}", id);
        }
        Ok(deleted)
    }

    /// Applies `patch` and re-indexes the finding in the same transaction.
    /// Returns false for an unknown id.
    pub async fn update_finding(&self, id: i64, patch: FindingPatch) -> Result<bool> {
        patch.validate()?;
        let index = self.index();

        self.call(move |conn| {
            let tx = write_tx(conn)?;
            let Some(mut finding) = select_finding(&tx, id)? else {
                return Ok(false);
            };
            if patch.is_empty() {
                return Ok(true);
            }
            let was_dismissed = finding.dismissed;
            patch.apply(&mut finding);

            tx.execute(
                "UPDATE findings SET
                     source_title = ?1, author = ?2, content = ?3, summary = ?4,
                     engagement_score = ?5, relevance_score = ?6, dismissed = ?7
                 WHERE id = ?8",
                params![
                    finding.source_title,
                    finding.author,
                    finding.content,
                    finding.summary,
                    finding.engagement_score,
                    finding.relevance_score,
                    finding.dismissed,
                    id
                ],
            )?;

            match (was_dismissed, finding.dismissed) {
                (false, true) => index.remove(&tx, id)?,
                (true, false) => index.add(&tx, IndexedText::from(&finding))?,
                (false, false) if patch.touches_text() => {
                    index.replace(&tx, IndexedText::from(&finding))?
                }
                _ => {}
            }

            tx.commit()?;
            Ok(true)
        })
        .await
    }
}

/// Merges a re-sighting into the stored row. Returns false when the URL is new.
fn resight(
    conn: &Connection,
    url: &str,
    candidate: &CandidateFinding,
    run_id: i64,
    now: &str,
) -> rusqlite::Result<bool> {
    // Indexed columns are untouched here, so the text index needs no change.
    let changed = conn.execute(
        "UPDATE findings SET
             last_seen = ?1,
             sighting_count = sighting_count + 1,
             engagement_score = MAX(engagement_score, ?2),
             run_id = ?3
         WHERE source_url = ?4",
        params![now, candidate.engagement_or_zero(), run_id, url],
    )?;
    Ok(changed > 0)
}

/// The text of a freshly inserted row, ready for the index.
struct InsertedText {
    id: i64,
    content: String,
    summary: String,
    source_title: String,
    author: String,
}

impl InsertedText {
    fn as_indexed(&self) -> IndexedText<'_> {
        IndexedText {
            id: self.id,
            content: &self.content,
            summary: &self.summary,
            source_title: &self.source_title,
            author: &self.author,
        }
    }
}

/// Inserts a first sighting. Returns None if another writer got the URL first.
fn insert_new(
    conn: &Connection,
    url: &str,
    candidate: &CandidateFinding,
    run_id: i64,
    topic_id: i64,
    now: &str,
) -> rusqlite::Result<Option<InsertedText>> {
    let text = InsertedText {
        id: 0,
        content: candidate.content.clone().unwrap_or_default(),
        summary: candidate.summary.clone().unwrap_or_default(),
        source_title: candidate.source_title.clone().unwrap_or_default(),
        author: candidate.author.clone().unwrap_or_default(),
    };

    let inserted = conn.execute(
        r#"INSERT INTO findings
               (run_id, topic_id, source, source_url, source_title, author, content, summary,
                engagement_score, relevance_score, first_seen, last_seen, sighting_count)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11, 1)
           ON CONFLICT(source_url) DO NOTHING"#,
        params![
            run_id,
            topic_id,
            candidate.source_or_default(),
            url,
            text.source_title,
            text.author,
            text.content,
            text.summary,
            candidate.engagement_or_zero(),
            candidate.relevance_or_zero(),
            now,
        ],
    )?;

    if inserted == 0 {
        return Ok(None);
    }
    Ok(Some(InsertedText {
        id: conn.last_insert_rowid(),
        ..text
    }))
}

fn select_finding(conn: &Connection, id: i64) -> rusqlite::Result<Option<Finding>> {
    conn.query_row(
        &format!("SELECT {FINDING_COLUMNS} FROM findings f WHERE f.id = ?1"),
        params![id],
        finding_from_row,
    )
    .optional()
}

fn finding_from_row(row: &Row) -> rusqlite::Result<Finding> {
    Ok(Finding {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        topic_id: row.get("topic_id")?,
        source: row.get("source")?,
        source_url: row.get("source_url")?,
        source_title: row.get("source_title")?,
        author: row.get("author")?,
        content: row.get("content")?,
        summary: row.get("summary")?,
        engagement_score: row.get("engagement_score")?,
        relevance_score: row.get("relevance_score")?,
        first_seen: time_column(row, "first_seen")?,
        last_seen: time_column(row, "last_seen")?,
        sighting_count: row.get("sighting_count")?,
        dismissed: row.get("dismissed")?,
    })
}
