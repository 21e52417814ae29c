use hipster_core::engine::TaskContext;
use hipster_core::publish::{publish_results, store_from_config, PublishedLog};
use std::path::Path;
use tracing::warn;

/// Publish `logs` with an index in `index_dir` and point the job's work
/// data at the index. Publishing problems are logged, never fatal.
pub async fn publish_job_logs(ctx: &mut TaskContext, index_dir: &Path, logs: &mut [PublishedLog]) {
    let store = store_from_config(&ctx.global_config.publish_logs);
    match publish_results(store.as_ref(), &ctx.job.unique, index_dir, logs).await {
        Ok(url) => ctx.work_data.url = Some(url),
        Err(e) => warn!(job = %ctx.job.unique, "Could not publish results: {}", e),
    }
}

/// Result string for a log while the task is still running.
pub fn current_result(ctx: &TaskContext) -> String {
    if ctx.success {
        hipster_core::ResultStatus::SUCCESS.to_string()
    } else {
        ctx.messages
            .first()
            .cloned()
            .unwrap_or_else(|| "Failed".to_string())
    }
}
