use rusqlite::{params, Connection};

use crate::models::Finding;

/// The indexed columns of one finding.
#[derive(Debug, Clone, Copy)]
pub struct IndexedText<'a> {
    pub id: i64,
    pub content: &'a str,
    pub summary: &'a str,
    pub source_title: &'a str,
    pub author: &'a str,
}

impl<'a> From<&'a Finding> for IndexedText<'a> {
    fn from(finding: &'a Finding) -> Self {
        Self {
            id: finding.id,
            content: &finding.content,
            summary: &finding.summary,
            source_title: &finding.source_title,
            author: &finding.author,
        }
    }
}

/// Full-text index kept in step with the findings table. Callers invoke it on
/// the same transaction as the primary write, so both commit or neither does.
pub trait TextIndex {
    fn add(&self, conn: &Connection, doc: IndexedText<'_>) -> rusqlite::Result<()>;

    fn remove(&self, conn: &Connection, id: i64) -> rusqlite::Result<()>;

    fn replace(&self, conn: &Connection, doc: IndexedText<'_>) -> rusqlite::Result<()> {
        self.remove(conn, doc.id)?;
        self.add(conn, doc)
    }

    /// Ids matching `query`, best first, paired with their rank.
    fn search(&self, conn: &Connection, query: &str, limit: usize)
        -> rusqlite::Result<Vec<(i64, f64)>>;
}

/// SQLite FTS5 table keyed by finding id, ranked with BM25.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fts5Index;

impl TextIndex for Fts5Index {
    fn add(&self, conn: &Connection, doc: IndexedText<'_>) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO findings_fts (rowid, content, summary, source_title, author)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![doc.id, doc.content, doc.summary, doc.source_title, doc.author],
        )?;
        Ok(())
    }

    fn remove(&self, conn: &Connection, id: i64) -> rusqlite::Result<()> {
        conn.execute("DELETE FROM findings_fts WHERE rowid = ?1", params![id])?;
        Ok(())
    }

    fn search(
        &self,
        conn: &Connection,
        query: &str,
        limit: usize,
    ) -> rusqlite::Result<Vec<(i64, f64)>> {
        let mut stmt = conn.prepare(
            "SELECT rowid AS id, bm25(findings_fts) AS score
             FROM findings_fts
             WHERE findings_fts MATCH ?1
             ORDER BY score
             LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let hits = stmt
            .query_map(params![query, limit], |row| {
                Ok((row.get::<_, i64>("id")?, row.get::<_, f64>("score")?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(hits)
    }
}
