use crate::manager::WorkerManager;
use hipster_core::config::Config;
use hipster_core::job::Job;
use hipster_core::queue::{InMemoryQueue, JobEventKind};
use hipster_plugins::registry::PluginRegistry;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

/// One line of a job spool file.
#[derive(Debug, Deserialize)]
struct SpoolEntry {
    function: String,
    #[serde(default)]
    unique: Option<String>,
    /// Object of strings for build jobs, a bare token for stop messages.
    #[serde(default)]
    arguments: serde_json::Value,
}

impl SpoolEntry {
    fn into_job(self) -> anyhow::Result<Job> {
        let prefixed = self.function.starts_with("build:") || self.function.starts_with("stop:");
        let function = if prefixed {
            self.function
        } else {
            format!("build:{}", self.function)
        };
        let unique = self
            .unique
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let arguments = match self.arguments {
            serde_json::Value::Null => Vec::new(),
            serde_json::Value::String(token) => token.into_bytes(),
            other => serde_json::to_vec(&other)?,
        };
        Ok(Job::new(unique, function, arguments))
    }
}

fn read_spool(path: &Path) -> anyhow::Result<Vec<Job>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {}", path.display(), e))?;
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
        .map(|(index, line)| {
            let entry: SpoolEntry = serde_json::from_str(line)
                .map_err(|e| anyhow::anyhow!("{}:{}: {}", path.display(), index + 1, e))?;
            entry.into_job()
        })
        .collect()
}

pub async fn run(config: Config, jobs: &Path) -> anyhow::Result<()> {
    let registry = PluginRegistry::load(&config)?;
    if registry.is_empty() {
        println!("No plugins configured.");
        println!("Run `hipster-worker config --init` to create a sample config.");
        return Ok(());
    }

    let jobs = read_spool(jobs)?;
    let queue = Arc::new(InMemoryQueue::new());
    for job in &jobs {
        queue.submit(job.clone()).await;
    }
    queue.close().await;

    let manager = WorkerManager::new(Arc::new(config), registry, queue.clone());
    tokio::select! {
        result = manager.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            println!("Interrupted, stopping.");
            manager.stop().await;
        }
    }

    let events = queue.events().await;
    println!("{:<34} {:<40} {:<10} {}", "JOB", "FUNCTION", "OUTCOME", "RESULT");
    println!("{}", "-".repeat(100));
    for job in &jobs {
        let terminal = events
            .iter()
            .rev()
            .find(|e| e.unique == job.unique && e.kind.is_terminal());
        let (outcome, detail) = match terminal.map(|e| &e.kind) {
            Some(JobEventKind::Complete(work_data)) => {
                let result = work_data.result.as_ref().map(|r| r.as_str());
                let detail = match &work_data.url {
                    Some(url) => format!("{} {}", result.unwrap_or("-"), url),
                    None => result.unwrap_or_default().to_string(),
                };
                ("succeeded", detail)
            }
            Some(JobEventKind::Fail) => ("failed", last_result(&events, &job.unique)),
            Some(JobEventKind::Exception(message)) => ("excepted", message.clone()),
            _ => ("not run", String::new()),
        };
        let finished = terminal
            .map(|e| e.at.format("%H:%M:%S").to_string())
            .unwrap_or_default();
        println!(
            "{:<34} {:<40} {:<10} {} {}",
            job.unique, job.function, outcome, detail, finished
        );
    }
    println!();
    println!("Jobs run: {}", manager.jobs_run());

    Ok(())
}

/// Result carried by the last work data sent for a failed job.
fn last_result(events: &[hipster_core::queue::JobEvent], unique: &str) -> String {
    events
        .iter()
        .rev()
        .filter(|e| e.unique == unique)
        .find_map(|e| match &e.kind {
            JobEventKind::Data(work_data) => {
                let result = work_data.result.as_ref()?;
                Some(match &work_data.reason {
                    Some(reason) => format!("{} ({})", result, reason),
                    None => result.to_string(),
                })
            }
            _ => None,
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spool_lines_become_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let spool = dir.path().join("jobs.jsonl");
        std::fs::write(
            &spool,
            concat!(
                "# nightly\n",
                "{\"function\": \"do_something_shelly\", \"unique\": \"a1\", \"arguments\": {\"ZUUL_PROJECT\": \"openstack/nova\"}}\n",
                "\n",
                "{\"function\": \"stop:th-test\", \"arguments\": \"a1\"}\n",
            ),
        )
        .unwrap();

        let jobs = read_spool(&spool).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].unique, "a1");
        assert_eq!(jobs[0].function, "build:do_something_shelly");
        assert_eq!(jobs[0].arguments, br#"{"ZUUL_PROJECT":"openstack/nova"}"#.to_vec());
        assert_eq!(jobs[1].function, "stop:th-test");
        assert_eq!(jobs[1].arguments_str(), "a1");
        assert_eq!(jobs[1].unique.len(), 32);
    }

    #[tokio::test]
    async fn failed_dirty_job_shows_why_it_failed() {
        use hipster_core::job::{ResultStatus, WorkData};
        use hipster_core::queue::JobQueue;

        let queue = InMemoryQueue::new();
        let job = Job::new("j1", "build:x", Vec::new());
        let mut work_data = WorkData::new("x".into(), "j1".into(), "mgr".into());
        work_data.set_result(ResultStatus::Dirty);
        work_data.reason = Some("Failed: script exited with code 1".into());
        queue.send_work_data(&job, &work_data).await.unwrap();

        assert_eq!(
            last_result(&queue.events().await, "j1"),
            "DIRTY (Failed: script exited with code 1)"
        );
    }

    #[test]
    fn bad_spool_line_reports_its_position() {
        let dir = tempfile::tempdir().unwrap();
        let spool = dir.path().join("jobs.jsonl");
        std::fs::write(&spool, "{\"function\": \"x\"}\n{oops\n").unwrap();

        let err = read_spool(&spool).unwrap_err();
        assert!(err.to_string().contains(":2:"), "{}", err);
    }
}
