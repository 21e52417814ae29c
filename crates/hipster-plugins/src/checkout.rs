use hipster_core::engine::TaskContext;
use hipster_core::error::WorkerError;
use hipster_core::job::path_component;
use hipster_exec::{LogWatcher, WatchedCommand};
use std::path::{Path, PathBuf};
use tracing::info;

/// Where the change under test is checked out for this job.
///
/// The checkout is kept per function and project, not per job, so later
/// jobs fetch into an existing clone. A manager runs one build job at a
/// time; managers sharing a host need their own `git_working_dir`.
pub fn checkout_path(ctx: &TaskContext) -> PathBuf {
    let mut path = ctx.global_config.git_working_dir.join(&ctx.job_name);
    for segment in ctx.job_arguments.project().split('/') {
        path.push(path_component(segment));
    }
    path
}

/// Fetch the change under test with the configured git prep script,
/// appending its output to `log_path`. A non-zero exit is recorded as a
/// failure; the caller carries on so the log still gets published.
pub async fn grab_patchset(ctx: &mut TaskContext, log_path: &Path) -> Result<(), WorkerError> {
    let git_path = checkout_path(ctx);
    tokio::fs::create_dir_all(&git_path).await?;

    let git = &ctx.global_config.git;
    let command = WatchedCommand::new(git.prep_script.as_str())
        .arg(git.review_url.as_str())
        .arg(git.zuul_url.as_str())
        .envs(ctx.job_arguments.iter())
        .env("GIT_ORIGIN", git.origin.as_str())
        .current_dir(&git_path);

    info!(path = %git_path.display(), "Checking out {}", ctx.job_arguments.project());
    let code = LogWatcher::new().execute(&command, log_path, &[]).await?;
    if code != 0 {
        ctx.fail(format!("Failed: git prep exited with code {}", code));
    }
    Ok(())
}
