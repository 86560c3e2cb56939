//! Drives research runs for watched topics.
//!
//! The research itself happens behind [`RunProducer`]; this module records
//! the run, enforces the daily budget and the research timeout, hands the
//! candidates to the store and finalizes the run.

use std::future::Future;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::db::Repository;
use crate::error::Result;
use crate::models::{CandidateFinding, NewRun, RunPatch, Topic};

/// What one research step produced, plus what it cost.
#[derive(Debug, Clone, Default)]
pub struct Research {
    pub candidates: Vec<CandidateFinding>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub token_cost: f64,
}

impl Research {
    /// Token counts and cost, clamped to values the run ledger accepts.
    fn usage(&self) -> (i64, i64, f64) {
        let cost = if self.token_cost.is_finite() {
            self.token_cost.max(0.0)
        } else {
            0.0
        };
        (self.prompt_tokens.max(0), self.completion_tokens.max(0), cost)
    }
}

/// Source of candidate findings for a topic, e.g. a set of web search backends.
pub trait RunProducer: Send + Sync {
    /// Recorded on the run as `source_mode`.
    fn source_mode(&self) -> &str {
        "both"
    }

    fn execute(&self, topic: &Topic) -> impl Future<Output = anyhow::Result<Research>> + Send;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunOutcome {
    Completed { new: i64, updated: i64 },
    Failed { error: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub topic: String,
    pub run_id: Option<i64>,
    #[serde(flatten)]
    pub outcome: RunOutcome,
    pub duration_seconds: f64,
}

pub struct Watchlist<P> {
    repo: Repository,
    producer: P,
    timeout: Duration,
}

impl<P: RunProducer> Watchlist<P> {
    pub fn new(repo: Repository, producer: P) -> Self {
        let timeout = repo.config().research_timeout();
        Self {
            repo,
            producer,
            timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Researches every enabled topic in name order, skipping topics once
    /// today's spend has reached the `daily_budget` setting.
    pub async fn run_all(&self) -> Result<Vec<RunReport>> {
        let topics = self.repo.list_topics().await?;
        let budget = self.repo.daily_budget().await?;
        let mut reports = Vec::new();

        for summary in topics.into_iter().filter(|t| t.topic.enabled) {
            let spent = self.repo.daily_cost_today().await?;
            if spent >= budget {
                tracing::info!(
                    "Skipping {:?}: budget used {:.2}/{:.2}",
                    summary.topic.name,
                    spent,
                    budget
                );
                reports.push(RunReport {
                    topic: summary.topic.name,
                    run_id: None,
                    outcome: RunOutcome::Skipped {
                        reason: format!("Budget exceeded: ${spent:.2}/${budget:.2}"),
                    },
                    duration_seconds: 0.0,
                });
                continue;
            }
            reports.push(self.run_topic(&summary.topic).await?);
        }

        Ok(reports)
    }

    /// Runs one research step for `topic` and records the outcome. Producer
    /// failures and timeouts end as a `failed` run; storage failures also
    /// mark the run failed and are returned as errors.
    pub async fn run_topic(&self, topic: &Topic) -> Result<RunReport> {
        let started = Instant::now();
        let run_id = self
            .repo
            .record_run(NewRun::new(topic.id).source_mode(self.producer.source_mode()))
            .await?;

        let research = match tokio::time::timeout(self.timeout, self.producer.execute(topic)).await
        {
            Ok(Ok(research)) => research,
            Ok(Err(e)) => return self.fail(topic, run_id, started, format!("{e:#}")).await,
            Err(_) => {
                let message = format!("Research timed out after {:?}", self.timeout);
                return self.fail(topic, run_id, started, message).await;
            }
        };

        let (prompt_tokens, completion_tokens, cost) = research.usage();
        let counts = match self
            .repo
            .store_findings(run_id, topic.id, research.candidates)
            .await
        {
            Ok(counts) => counts,
            Err(e) => {
                let patch = RunPatch::failed(e.to_string())
                    .usage(prompt_tokens, completion_tokens, cost)
                    .duration(started.elapsed().as_secs_f64());
                if let Err(mark) = self.repo.update_run(run_id, patch).await {
                    tracing::warn!("Failed to mark run {} as failed: {}", run_id, mark);
                }
                return Err(e);
            }
        };

        let duration = started.elapsed().as_secs_f64();
        self.repo
            .update_run(
                run_id,
                RunPatch::completed()
                    .usage(prompt_tokens, completion_tokens, cost)
                    .duration(duration)
                    .counts(counts.new, counts.updated),
            )
            .await?;

        tracing::info!(
            "Researched {:?}: {} new, {} updated in {:.1}s",
            topic.name,
            counts.new,
            counts.updated,
            duration
        );
        Ok(RunReport {
            topic: topic.name.clone(),
            run_id: Some(run_id),
            outcome: RunOutcome::Completed {
                new: counts.new,
                updated: counts.updated,
            },
            duration_seconds: duration,
        })
    }

    async fn fail(
        &self,
        topic: &Topic,
        run_id: i64,
        started: Instant,
        error: String,
    ) -> Result<RunReport> {
        let duration = started.elapsed().as_secs_f64();
        tracing::warn!("Research for {:?} failed: {}", topic.name, error);
        self.repo
            .update_run(run_id, RunPatch::failed(error.clone()).duration(duration))
            .await?;
        Ok(RunReport {
            topic: topic.name.clone(),
            run_id: Some(run_id),
            outcome: RunOutcome::Failed { error },
            duration_seconds: duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::db::test_support::repo;
    use crate::db::DAILY_BUDGET;
    use crate::models::{RunStatus, DAILY_SCHEDULE};

    #[derive(Clone)]
    enum Scripted {
        Found(Vec<CandidateFinding>, f64),
        Fails(&'static str),
        Hangs,
    }

    #[derive(Default)]
    struct ScriptedProducer {
        script: HashMap<String, Scripted>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProducer {
        fn on(mut self, topic: &str, step: Scripted) -> Self {
            self.script.insert(topic.to_string(), step);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RunProducer for ScriptedProducer {
        async fn execute(&self, topic: &Topic) -> anyhow::Result<Research> {
            self.calls.lock().unwrap().push(topic.name.clone());
            match self.script.get(&topic.name).cloned() {
                Some(Scripted::Found(candidates, cost)) => Ok(Research {
                    candidates,
                    prompt_tokens: 100,
                    completion_tokens: 40,
                    token_cost: cost,
                }),
                Some(Scripted::Fails(message)) => Err(anyhow::anyhow!(message)),
                Some(Scripted::Hangs) => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Research::default())
                }
                None => Ok(Research::default()),
            }
        }
    }

    #[tokio::test]
    async fn completed_run_records_counts_and_usage() {
        let (_dir, _clock, repo) = repo().await;
        let topic = repo.add_topic("AI video tools", None, DAILY_SCHEDULE).await.unwrap();
        let producer = ScriptedProducer::default().on(
            "AI video tools",
            Scripted::Found(
                vec![
                    CandidateFinding::new("x", "https://x.test/1"),
                    CandidateFinding::default(),
                ],
                0.2,
            ),
        );
        let watchlist = Watchlist::new(repo.clone(), producer);

        let report = watchlist.run_topic(&topic).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed { new: 1, updated: 0 });

        let run = repo.get_run(report.run_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!((run.findings_new, run.findings_updated), (1, 0));
        assert_eq!((run.prompt_tokens, run.completion_tokens), (100, 40));
        assert_eq!(run.token_cost, 0.2);
    }

    #[tokio::test]
    async fn producer_error_and_timeout_fail_the_run() {
        let (_dir, _clock, repo) = repo().await;
        let broken = repo.add_topic("broken", None, DAILY_SCHEDULE).await.unwrap();
        let slow = repo.add_topic("slow", None, DAILY_SCHEDULE).await.unwrap();
        let producer = ScriptedProducer::default()
            .on("broken", Scripted::Fails("search backend returned 503"))
            .on("slow", Scripted::Hangs);
        let watchlist =
            Watchlist::new(repo.clone(), producer).with_timeout(Duration::from_millis(50));

        let report = watchlist.run_topic(&broken).await.unwrap();
        assert!(matches!(&report.outcome, RunOutcome::Failed { error } if error.contains("503")));
        let run = repo.get_run(report.run_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_message.as_deref(), Some("search backend returned 503"));

        let report = watchlist.run_topic(&slow).await.unwrap();
        assert!(matches!(&report.outcome, RunOutcome::Failed { error } if error.contains("timed out")));
        let topics = repo.list_topics().await.unwrap();
        assert!(topics
            .iter()
            .all(|t| t.last_status == Some(RunStatus::Failed)));
    }

    #[tokio::test]
    async fn run_all_skips_disabled_topics_and_stops_at_budget() {
        let (_dir, _clock, repo) = repo().await;
        for name in ["a", "b", "c", "d"] {
            repo.add_topic(name, None, DAILY_SCHEDULE).await.unwrap();
        }
        repo.set_topic_enabled("b", false).await.unwrap();
        repo.set_setting(DAILY_BUDGET, "1.00").await.unwrap();

        let producer = ScriptedProducer::default()
            .on("a", Scripted::Found(vec![CandidateFinding::new("x", "https://x.test/a")], 0.6))
            .on("c", Scripted::Found(vec![CandidateFinding::new("x", "https://x.test/c")], 0.6))
            .on("d", Scripted::Found(vec![CandidateFinding::new("x", "https://x.test/d")], 0.6));
        let watchlist = Watchlist::new(repo.clone(), producer);

        let reports = watchlist.run_all().await.unwrap();
        let summary: Vec<_> = reports
            .iter()
            .map(|r| (r.topic.as_str(), matches!(r.outcome, RunOutcome::Skipped { .. })))
            .collect();
        assert_eq!(summary, vec![("a", false), ("c", false), ("d", true)]);
        assert_eq!(watchlist.producer.calls(), vec!["a", "c"]);
        assert_eq!(repo.daily_cost_today().await.unwrap(), 1.2);
    }

    #[test]
    fn report_serializes_flat() {
        let report = RunReport {
            topic: "t".into(),
            run_id: Some(3),
            outcome: RunOutcome::Completed { new: 2, updated: 1 },
            duration_seconds: 1.5,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["new"], 2);
        assert_eq!(json["topic"], "t");
    }
}
