use chrono::Duration;
use serde_json::json;

use research_store::db::{DAILY_BUDGET, DELIVERY_CHANNEL};
use research_store::models::{DAILY_SCHEDULE, WEEKLY_SCHEDULE};
use research_store::{AppError, Config, Repository, Result};

const USAGE: &str = "\
Usage: research-store <command>

Commands:
  add <topic> [--schedule CRON | --weekly] [--queries a,b,c]
  remove <topic>
  list
  query <topic> [--since 7d]
  search <query> [--limit 20]
  trending [--days 7]
  stats
  dismiss <finding-id>
  config <budget|delivery> <value>";

#[tokio::main]
async fn main() {
    // Initialize logging (only show warnings and errors by default)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("{USAGE}");
        std::process::exit(1);
    }

    if let Err(e) = run(&args).await {
        println!("{}", json!({ "error": e.to_string() }));
        std::process::exit(1);
    }
}

async fn run(args: &[String]) -> Result<()> {
    let config = Config::load()?;
    let repo = Repository::new(&config).await?;

    let output = match args[0].as_str() {
        "add" => {
            let topic = positional(args, 1, "topic")?;
            let schedule = if has_flag(args, "--weekly") {
                WEEKLY_SCHEDULE.to_string()
            } else {
                flag_value(args, "--schedule").unwrap_or_else(|| DAILY_SCHEDULE.to_string())
            };
            let queries = flag_value(args, "--queries").map(|q| {
                q.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            });
            let topic = repo.add_topic(topic, queries, &schedule).await?;
            json!({ "action": "added", "topic": topic })
        }

        "remove" => {
            let topic = positional(args, 1, "topic")?;
            if repo.remove_topic(topic).await? {
                let remaining = repo.list_topics().await?.len();
                json!({ "action": "removed", "topic": topic, "remaining": remaining })
            } else {
                json!({ "action": "not_found", "topic": topic })
            }
        }

        "list" => {
            let topics = repo.list_topics().await?;
            json!({
                "topics": topics,
                "budget_used": repo.daily_cost_today().await?,
                "budget_limit": repo.daily_budget().await?,
            })
        }

        "query" => {
            let name = positional(args, 1, "topic")?;
            let Some(topic) = repo.get_topic(name).await? else {
                return Err(AppError::Config(format!("Topic not found: {name:?}")));
            };
            let since = match flag_value(args, "--since") {
                Some(raw) => {
                    let days = parse_days(&raw)?;
                    Some(chrono::Utc::now() - Duration::days(days))
                }
                None => None,
            };
            let findings = repo.get_new_findings(topic.id, since).await?;
            json!({ "topic": topic.name, "count": findings.len(), "findings": findings })
        }

        "search" => {
            let query = positional(args, 1, "query")?;
            let limit = match flag_value(args, "--limit") {
                Some(raw) => raw
                    .parse()
                    .map_err(|_| AppError::Config(format!("Invalid --limit: {raw}")))?,
                None => 20,
            };
            let results = repo.search_findings(query, limit).await?;
            json!({ "query": query, "count": results.len(), "results": results })
        }

        "trending" => {
            let days = match flag_value(args, "--days") {
                Some(raw) => raw
                    .parse()
                    .map_err(|_| AppError::Config(format!("Invalid --days: {raw}")))?,
                None => 7,
            };
            json!({ "trending": repo.get_trending(days).await? })
        }

        "stats" => serde_json::to_value(repo.get_stats().await?)?,

        "dismiss" => {
            let raw = positional(args, 1, "finding-id")?;
            let id: i64 = raw
                .parse()
                .map_err(|_| AppError::Config(format!("Invalid finding id: {raw}")))?;
            json!({ "action": "dismissed", "id": id, "found": repo.dismiss_finding(id).await? })
        }

        "config" => {
            let key = match positional(args, 1, "setting")? {
                "budget" => DAILY_BUDGET,
                "delivery" => DELIVERY_CHANNEL,
                other => {
                    return Err(AppError::Config(format!(
                        "Unknown setting: {other}. Use 'delivery' or 'budget'."
                    )))
                }
            };
            let value = positional(args, 2, "value")?;
            if key == DAILY_BUDGET
                && !matches!(value.parse::<f64>(), Ok(v) if v.is_finite() && v >= 0.0)
            {
                return Err(AppError::Config(format!("Invalid budget: {value}")));
            }
            repo.set_setting(key, value).await?;
            json!({ "action": "config", "setting": key, "value": value })
        }

        other => {
            return Err(AppError::Config(format!("Unknown command: {other}\n{USAGE}")));
        }
    };

    println!("{output}");
    Ok(())
}

fn positional<'a>(args: &'a [String], index: usize, name: &str) -> Result<&'a str> {
    args.get(index)
        .filter(|a| !a.starts_with("--"))
        .map(String::as_str)
        .ok_or_else(|| AppError::Config(format!("Missing <{name}>\n{USAGE}")))
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// Accepts "7d" or "7".
fn parse_days(raw: &str) -> Result<i64> {
    raw.trim_end_matches('d')
        .parse()
        .ok()
        .filter(|d: &i64| *d >= 0)
        .ok_or_else(|| AppError::Config(format!("Invalid duration: {raw} (expected e.g. 7d)")))
}
