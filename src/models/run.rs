use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Longest error message kept on a failed run.
pub const ERROR_MESSAGE_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

impl ToSql for RunStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RunStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub topic_id: i64,
    pub run_date: DateTime<Utc>,
    pub source_mode: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub token_cost: f64,
    pub duration_seconds: f64,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub findings_new: i64,
    pub findings_updated: i64,
    pub created_at: DateTime<Utc>,
}

/// Parameters for opening a run. Runs always start out `running`.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub topic_id: i64,
    pub source_mode: String,
}

impl NewRun {
    pub fn new(topic_id: i64) -> Self {
        Self {
            topic_id,
            source_mode: "both".to_string(),
        }
    }

    pub fn source_mode(mut self, mode: impl Into<String>) -> Self {
        self.source_mode = mode.into();
        self
    }
}

/// The fields of a run that may change after it was recorded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub error_message: Option<String>,
    pub duration_seconds: Option<f64>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub token_cost: Option<f64>,
    pub findings_new: Option<i64>,
    pub findings_updated: Option<i64>,
}

impl RunPatch {
    pub fn completed() -> Self {
        Self {
            status: Some(RunStatus::Completed),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(RunStatus::Failed),
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn duration(mut self, seconds: f64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    pub fn usage(mut self, prompt_tokens: i64, completion_tokens: i64, token_cost: f64) -> Self {
        self.prompt_tokens = Some(prompt_tokens);
        self.completion_tokens = Some(completion_tokens);
        self.token_cost = Some(token_cost);
        self
    }

    pub fn counts(mut self, new: i64, updated: i64) -> Self {
        self.findings_new = Some(new);
        self.findings_updated = Some(updated);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Finding counts are the only fields a finished run still accepts.
    pub fn is_counts_only(&self) -> bool {
        Self {
            findings_new: None,
            findings_updated: None,
            ..self.clone()
        }
        .is_empty()
    }

    /// Checks the patch on its own, before it is compared against the stored run.
    pub fn validate(&self) -> Result<()> {
        if self.status == Some(RunStatus::Running) {
            return Err(AppError::InvalidPatch(
                "a run cannot be moved back to running".to_string(),
            ));
        }
        for (name, value) in [
            ("duration_seconds", self.duration_seconds),
            ("token_cost", self.token_cost),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(AppError::InvalidPatch(format!("{name} must be >= 0, got {v}")));
                }
            }
        }
        for (name, value) in [
            ("prompt_tokens", self.prompt_tokens),
            ("completion_tokens", self.completion_tokens),
            ("findings_new", self.findings_new),
            ("findings_updated", self.findings_updated),
        ] {
            if let Some(v) = value {
                if v < 0 {
                    return Err(AppError::InvalidPatch(format!("{name} must be >= 0, got {v}")));
                }
            }
        }
        Ok(())
    }

    /// The error message as it will be stored.
    pub(crate) fn stored_error_message(&self) -> Option<String> {
        self.error_message
            .as_deref()
            .map(|m| m.chars().take(ERROR_MESSAGE_LIMIT).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [RunStatus::Running, RunStatus::Completed, RunStatus::Failed] {
            assert_eq!(status.as_str().parse::<RunStatus>(), Ok(status));
        }
        assert!("done".parse::<RunStatus>().is_err());
    }

    #[test]
    fn patch_rejects_running_and_negative_values() {
        let back_to_running = RunPatch {
            status: Some(RunStatus::Running),
            ..RunPatch::default()
        };
        assert!(matches!(back_to_running.validate(), Err(AppError::InvalidPatch(_))));
        assert!(RunPatch::completed().duration(-1.0).validate().is_err());
        assert!(RunPatch::completed().usage(1, 1, f64::NAN).validate().is_err());
        assert!(RunPatch::default().counts(-1, 0).validate().is_err());
        assert!(RunPatch::completed().usage(10, 20, 0.01).validate().is_ok());
    }

    #[test]
    fn counts_only_detection() {
        assert!(RunPatch::default().counts(3, 1).is_counts_only());
        assert!(RunPatch::default().is_counts_only());
        assert!(!RunPatch::completed().counts(3, 1).is_counts_only());
    }

    #[test]
    fn error_message_is_truncated_on_char_boundary() {
        let long = "é".repeat(ERROR_MESSAGE_LIMIT + 20);
        let stored = RunPatch::failed(long).stored_error_message().unwrap();
        assert_eq!(stored.chars().count(), ERROR_MESSAGE_LIMIT);
    }
}
