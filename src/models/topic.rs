use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RunStatus;

/// Every day at 08:00.
pub const DAILY_SCHEDULE: &str = "0 8 * * *";
/// Mondays at 08:00.
pub const WEEKLY_SCHEDULE: &str = "0 8 * * 1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: i64,
    pub name: String,
    pub search_queries: Option<Vec<String>>,
    pub schedule: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A topic plus the derived numbers shown by `list`.
#[derive(Debug, Clone, Serialize)]
pub struct TopicSummary {
    #[serde(flatten)]
    pub topic: Topic,
    pub finding_count: i64,
    pub last_run: Option<DateTime<Utc>>,
    /// Status of the most recently created run.
    pub last_status: Option<RunStatus>,
}
