use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendingTopic {
    pub id: i64,
    pub name: String,
    pub new_findings: i64,
    pub total_engagement: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub topics_active: i64,
    pub total_findings: i64,
    pub db_size_bytes: u64,
    pub runs_7d: i64,
    pub successful_7d: i64,
    pub failed_7d: i64,
    pub cost_7d: f64,
    pub sources: BTreeMap<String, i64>,
    pub daily_budget: f64,
}
