use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

use super::{encode_time, Repository};

pub const DAILY_BUDGET: &str = "daily_budget";
pub const DELIVERY_CHANNEL: &str = "delivery_channel";
pub const DEFAULT_DAILY_BUDGET: f64 = 5.0;

impl Repository {
    // Settings

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.call(move |conn| Ok(select_setting(conn, &key)?)).await
    }

    pub async fn get_setting_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .get_setting(key)
            .await?
            .unwrap_or_else(|| default.to_string()))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        let now = encode_time(&self.now());
        self.call(move |conn| {
            conn.execute(
                r#"INSERT INTO settings (key, value, updated_at)
                   VALUES (?1, ?2, ?3)
                   ON CONFLICT(key) DO UPDATE SET
                       value = excluded.value,
                       updated_at = excluded.updated_at"#,
                params![key, value, now],
            )?;
            Ok(())
        })
        .await
    }

    /// The `daily_budget` setting; falls back to the default when unset or
    /// not a number.
    pub async fn daily_budget(&self) -> Result<f64> {
        let budget = self.call(|conn| Ok(select_setting(conn, DAILY_BUDGET)?)).await?;
        Ok(parse_budget(budget.as_deref()))
    }
}

pub(crate) fn select_setting(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM settings WHERE key = ?1",
        params![key],
        |row| row.get("value"),
    )
    .optional()
}

pub(crate) fn parse_budget(raw: Option<&str>) -> f64 {
    match raw.map(|s| s.trim().parse::<f64>()) {
        Some(Ok(v)) if v.is_finite() && v >= 0.0 => v,
        Some(_) => {
            tracing::warn!("Ignoring invalid {} setting {:?}", DAILY_BUDGET, raw);
            DEFAULT_DAILY_BUDGET
        }
        None => DEFAULT_DAILY_BUDGET,
    }
}
