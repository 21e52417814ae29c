//! Runs a configured shell command against the change under test.

use crate::checkout::{checkout_path, grab_patchset};
use crate::dataset::job_identifier;
use crate::results::{current_result, publish_job_logs};
use futures::future::BoxFuture;
use hipster_core::engine::{Step, TaskContext, TaskHandler};
use hipster_core::error::WorkerError;
use hipster_core::publish::PublishedLog;
use hipster_exec::{LogWatcher, WatchedCommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Default)]
pub struct ShellTask {
    working_dir: PathBuf,
    log_path: PathBuf,
    git_path: Option<PathBuf>,
    exit_code: Option<i32>,
}

impl ShellTask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_path(&self) -> &std::path::Path {
        &self.log_path
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }
}

impl TaskHandler for ShellTask {
    fn steps(&self) -> Vec<Step<Self>> {
        vec![
            Step::new("grab_patchset", grab),
            Step::new("execute_script", execute),
            Step::new("parse_and_check_results", check),
            Step::new("handle_results", handle),
        ]
    }
}

fn grab<'a>(
    task: &'a mut ShellTask,
    ctx: &'a mut TaskContext,
) -> BoxFuture<'a, Result<(), WorkerError>> {
    Box::pin(async move {
        task.working_dir = ctx.global_config.jobs_working_dir.join(job_identifier(
            &ctx.job_arguments,
            &ctx.plugin_config.function,
            &ctx.job.unique,
        ));
        task.log_path = task.working_dir.join(format!("{}.log", ctx.job_name));
        task.git_path = Some(checkout_path(ctx));
        let log_path = task.log_path.clone();
        grab_patchset(ctx, &log_path).await
    })
}

fn execute<'a>(
    task: &'a mut ShellTask,
    ctx: &'a mut TaskContext,
) -> BoxFuture<'a, Result<(), WorkerError>> {
    Box::pin(async move {
        let script = ctx.plugin_config.script.clone().ok_or_else(|| {
            WorkerError::Config(format!("plugin '{}' has no script", ctx.plugin_config.name))
        })?;

        let mut command = WatchedCommand::shell(script).envs(ctx.job_arguments.iter());
        if let Some(git_path) = &task.git_path {
            command = command.current_dir(git_path);
        }
        let code = LogWatcher::new().execute(&command, &task.log_path, &[]).await?;
        info!(exit_code = code, "Script finished");
        task.exit_code = Some(code);
        Ok(())
    })
}

fn check<'a>(
    task: &'a mut ShellTask,
    ctx: &'a mut TaskContext,
) -> BoxFuture<'a, Result<(), WorkerError>> {
    Box::pin(async move {
        match task.exit_code {
            Some(0) => {}
            Some(code) => ctx.fail(format!("Failed: script exited with code {}", code)),
            None => ctx.fail("Failed: script did not run"),
        }
        Ok(())
    })
}

fn handle<'a>(
    task: &'a mut ShellTask,
    ctx: &'a mut TaskContext,
) -> BoxFuture<'a, Result<(), WorkerError>> {
    Box::pin(async move {
        let mut logs = vec![PublishedLog {
            name: ctx.job_name.clone(),
            log_path: task.log_path.clone(),
            result: current_result(ctx),
            url: None,
        }];
        publish_job_logs(ctx, &task.working_dir, &mut logs).await;
        Ok(())
    })
}
