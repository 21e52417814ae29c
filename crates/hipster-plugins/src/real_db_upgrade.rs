//! Database migration tests against real-world datasets.
//!
//! Each dataset that matches the job's project gets its own migration run
//! and its own log. Every log is checked for incomplete migrations and the
//! whole set is published with an index.

use crate::analyzer::check_log_file;
use crate::checkout::{checkout_path, grab_patchset};
use crate::dataset::{job_identifier, select_job_datasets, DatasetCatalog, JobDataset};
use crate::results::publish_job_logs;
use futures::future::BoxFuture;
use hipster_core::engine::{Step, TaskContext, TaskHandler};
use hipster_core::error::WorkerError;
use hipster_core::job::ResultStatus;
use hipster_core::publish::PublishedLog;
use hipster_exec::{LogWatcher, WatchedLog};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Runner {
    catalog: Arc<DatasetCatalog>,
    watcher: LogWatcher,
    job_datasets: Vec<JobDataset>,
    job_dir: PathBuf,
    git_path: PathBuf,
}

impl Runner {
    pub fn new(catalog: Arc<DatasetCatalog>) -> Self {
        Self {
            catalog,
            watcher: LogWatcher::new(),
            job_datasets: Vec::new(),
            job_dir: PathBuf::new(),
            git_path: PathBuf::new(),
        }
    }

    pub fn with_watcher(mut self, watcher: LogWatcher) -> Self {
        self.watcher = watcher;
        self
    }

    pub fn job_datasets(&self) -> &[JobDataset] {
        &self.job_datasets
    }

    /// Log the source checkout writes to: the first dataset's log, so the
    /// checkout output is published alongside the migration output.
    fn checkout_log(&self, job_name: &str) -> PathBuf {
        self.job_datasets
            .first()
            .map(|d| d.log_file_path.clone())
            .unwrap_or_else(|| self.job_dir.join(format!("{}.log", job_name)))
    }
}

impl TaskHandler for Runner {
    fn steps(&self) -> Vec<Step<Self>> {
        vec![
            Step::new("get_job_datasets", get_job_datasets),
            Step::new("grab_patchset", grab),
            Step::new("execute_migrations", execute_migrations),
            Step::new("parse_and_check_results", parse_and_check_results),
            Step::new("handle_results", handle_results),
        ]
    }
}

fn get_job_datasets<'a>(
    runner: &'a mut Runner,
    ctx: &'a mut TaskContext,
) -> BoxFuture<'a, Result<(), WorkerError>> {
    Box::pin(async move {
        runner.job_dir = ctx.global_config.jobs_working_dir.join(job_identifier(
            &ctx.job_arguments,
            &ctx.plugin_config.function,
            &ctx.job.unique,
        ));
        runner.job_datasets = select_job_datasets(
            &runner.catalog,
            &ctx.global_config,
            &ctx.plugin_config,
            &ctx.job_arguments,
            &ctx.job.unique,
        );
        info!(
            "{} of {} dataset(s) apply to {}",
            runner.job_datasets.len(),
            runner.catalog.len(),
            ctx.job_arguments.project()
        );
        if runner.job_datasets.is_empty() {
            ctx.fail(format!("Failed: no datasets for {}", ctx.job_arguments.project()));
        }
        Ok(())
    })
}

fn grab<'a>(
    runner: &'a mut Runner,
    ctx: &'a mut TaskContext,
) -> BoxFuture<'a, Result<(), WorkerError>> {
    Box::pin(async move {
        runner.git_path = checkout_path(ctx);
        let log_path = runner.checkout_log(&ctx.job_name);
        grab_patchset(ctx, &log_path).await
    })
}

fn execute_migrations<'a>(
    runner: &'a mut Runner,
    ctx: &'a mut TaskContext,
) -> BoxFuture<'a, Result<(), WorkerError>> {
    Box::pin(async move {
        let watched: Vec<WatchedLog> = ctx
            .global_config
            .logs
            .tagged()
            .into_iter()
            .map(|(tag, path)| WatchedLog::new(tag, path))
            .collect();
        let pip_cache = ctx.global_config.pip_download_cache.clone();

        for dataset in runner.job_datasets.iter_mut() {
            tokio::fs::create_dir_all(&dataset.working_dir).await?;
            let command = dataset.invocation(&ctx.job.unique, &runner.git_path, &pip_cache);
            match runner
                .watcher
                .execute(&command, &dataset.log_file_path, &watched)
                .await
            {
                Ok(code) => {
                    info!(dataset = dataset.name(), exit_code = code, "Migrations finished");
                    dataset.exit_code = Some(code);
                }
                // Left without an exit code; judged as not run.
                Err(WorkerError::Execution(e)) => warn!(dataset = dataset.name(), "{}", e),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    })
}

fn parse_and_check_results<'a>(
    runner: &'a mut Runner,
    ctx: &'a mut TaskContext,
) -> BoxFuture<'a, Result<(), WorkerError>> {
    Box::pin(async move {
        for dataset in runner.job_datasets.iter_mut() {
            match dataset.exit_code {
                Some(0) => {}
                Some(code) => ctx.fail(format!(
                    "Failed: migrations for {} exited with code {}",
                    dataset.name(),
                    code
                )),
                None => ctx.fail(format!("Failed: migrations for {} did not run", dataset.name())),
            }

            let verdict = check_log_file(&dataset.log_file_path).map_err(|e| {
                WorkerError::Analysis(format!(
                    "cannot read {}: {}",
                    dataset.log_file_path.display(),
                    e
                ))
            });
            match verdict {
                Ok(verdict) if verdict.passed() && dataset.exit_code == Some(0) => {
                    dataset.result = ResultStatus::Success;
                }
                Ok(verdict) if verdict.passed() => {
                    dataset.result = ResultStatus::Failed(format!(
                        "Failed: exited with code {}",
                        dataset.exit_code.unwrap_or(-1)
                    ));
                }
                Ok(verdict) => {
                    let message = verdict.to_string();
                    ctx.fail(message.clone());
                    dataset.result = ResultStatus::Failed(message);
                }
                Err(e) => {
                    warn!(dataset = dataset.name(), "{}", e);
                    let message = format!("Failed: {}", e);
                    ctx.fail(message.clone());
                    dataset.result = ResultStatus::Failed(message);
                }
            }
        }
        Ok(())
    })
}

fn handle_results<'a>(
    runner: &'a mut Runner,
    ctx: &'a mut TaskContext,
) -> BoxFuture<'a, Result<(), WorkerError>> {
    Box::pin(async move {
        let mut logs: Vec<PublishedLog> = runner
            .job_datasets
            .iter()
            .map(|d| PublishedLog {
                name: d.name().to_string(),
                log_path: d.log_file_path.clone(),
                result: d.result.to_string(),
                url: None,
            })
            .collect();
        if logs.is_empty() {
            let log_path = runner.checkout_log(&ctx.job_name);
            if log_path.is_file() {
                logs.push(PublishedLog {
                    name: ctx.job_name.clone(),
                    log_path,
                    result: ResultStatus::Untested.to_string(),
                    url: None,
                });
            }
        }

        publish_job_logs(ctx, &runner.job_dir, &mut logs).await;
        for (dataset, log) in runner.job_datasets.iter_mut().zip(&logs) {
            dataset.result_url = log.url.clone();
        }
        Ok(())
    })
}
