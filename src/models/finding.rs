use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: i64,
    /// The most recent run that observed this finding.
    pub run_id: Option<i64>,
    pub topic_id: i64,
    pub source: String,
    pub source_url: String,
    pub source_title: String,
    pub author: String,
    pub content: String,
    pub summary: String,
    pub engagement_score: f64,
    pub relevance_score: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub sighting_count: i64,
    pub dismissed: bool,
}

/// A full-text match, best first.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub finding: Finding,
    pub topic_name: Option<String>,
    /// BM25 score; lower is more relevant.
    pub rank: f64,
}

/// One item handed over by a research producer. Everything is best-effort.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidateFinding {
    pub source: Option<String>,
    #[serde(alias = "url")]
    pub source_url: Option<String>,
    #[serde(alias = "title")]
    pub source_title: Option<String>,
    pub author: Option<String>,
    #[serde(alias = "text")]
    pub content: Option<String>,
    pub summary: Option<String>,
    pub engagement_score: Option<f64>,
    pub relevance_score: Option<f64>,
}

impl CandidateFinding {
    pub fn new(source: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            source_url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.source_title = Some(title.into());
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn engagement(mut self, score: f64) -> Self {
        self.engagement_score = Some(score);
        self
    }

    /// The normalized URL this candidate deduplicates on, if it has one.
    pub fn dedup_key(&self) -> Option<String> {
        self.source_url.as_deref().and_then(normalize_url)
    }

    pub(crate) fn source_or_default(&self) -> &str {
        self.source
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("unknown")
    }

    pub(crate) fn engagement_or_zero(&self) -> f64 {
        finite_or_zero(self.engagement_score)
    }

    pub(crate) fn relevance_or_zero(&self) -> f64 {
        finite_or_zero(self.relevance_score)
    }
}

fn finite_or_zero(value: Option<f64>) -> f64 {
    value.filter(|v| v.is_finite()).unwrap_or(0.0)
}

/// Trims, drops the fragment and lets the URL parser canonicalize scheme,
/// host and default port. Unparseable input is kept as trimmed text.
pub(crate) fn normalize_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match Url::parse(trimmed) {
        Ok(mut url) => {
            url.set_fragment(None);
            Some(url.to_string())
        }
        Err(_) => Some(trimmed.to_string()),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestCounts {
    pub new: i64,
    pub updated: i64,
}

/// The fields of a finding that may be edited after ingestion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindingPatch {
    pub source_title: Option<String>,
    pub author: Option<String>,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub engagement_score: Option<f64>,
    pub relevance_score: Option<f64>,
    pub dismissed: Option<bool>,
}

impl FindingPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Whether applying this patch changes any indexed column.
    pub fn touches_text(&self) -> bool {
        self.source_title.is_some()
            || self.author.is_some()
            || self.content.is_some()
            || self.summary.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("engagement_score", self.engagement_score),
            ("relevance_score", self.relevance_score),
        ] {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(AppError::InvalidPatch(format!("{name} must be finite")));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn apply(&self, finding: &mut Finding) {
        if let Some(v) = &self.source_title {
            finding.source_title = v.clone();
        }
        if let Some(v) = &self.author {
            finding.author = v.clone();
        }
        if let Some(v) = &self.content {
            finding.content = v.clone();
        }
        if let Some(v) = &self.summary {
            finding.summary = v.clone();
        }
        if let Some(v) = self.engagement_score {
            finding.engagement_score = v;
        }
        if let Some(v) = self.relevance_score {
            finding.relevance_score = v;
        }
        if let Some(v) = self.dismissed {
            finding.dismissed = v;
        }
    }
}
