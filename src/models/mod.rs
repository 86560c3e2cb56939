mod finding;
mod run;
mod stats;
mod topic;

pub use finding::{CandidateFinding, Finding, FindingPatch, IngestCounts, SearchHit};
pub use run::{NewRun, Run, RunPatch, RunStatus, ERROR_MESSAGE_LIMIT};
pub use stats::{Stats, TrendingTopic};
pub use topic::{Topic, TopicSummary, DAILY_SCHEDULE, WEEKLY_SCHEDULE};
