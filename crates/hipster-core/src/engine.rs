//! Stepped task lifecycle.
//!
//! A task handler declares an ordered list of [`Step`]s. [`Task::start`]
//! decodes the job, then runs the steps one by one, checking for
//! cancellation before each and reporting `(current, total)` after each.
//! Cancellation is cooperative: a running step is never interrupted.

use crate::config::{Config, PluginConfig};
use crate::error::WorkerError;
use crate::job::{Job, JobArguments, ResultStatus, TaskOutcome, WorkData};
use crate::queue::JobQueue;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info, warn, Instrument};

/// Body of a step. Borrows the handler and the task context for its duration.
pub type StepFn<H> =
    for<'a> fn(&'a mut H, &'a mut TaskContext) -> BoxFuture<'a, Result<(), WorkerError>>;

/// A named unit of progress.
pub struct Step<H> {
    pub name: &'static str,
    pub run: StepFn<H>,
}

impl<H> Step<H> {
    pub fn new(name: &'static str, run: StepFn<H>) -> Self {
        Self { name, run }
    }
}

/// A task type: a fixed, ordered list of steps over some handler state.
pub trait TaskHandler: Send + Sized {
    fn steps(&self) -> Vec<Step<Self>>;
}

/// Shared cancellation flag for one task. The manager keeps a clone so a
/// stop message can reach a task that is busy running a step.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    job_unique: OnceLock<String>,
    cancelled: AtomicBool,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tie the handle to a job. Only the first binding takes effect.
    pub fn bind(&self, job_unique: &str) {
        let _ = self.inner.job_unique.set(job_unique.to_string());
    }

    /// Cancel the task if `token` names its job. Returns whether it did.
    pub fn stop(&self, token: &str) -> bool {
        match self.inner.job_unique.get() {
            Some(unique) if unique == token => {
                self.inner.cancelled.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn job_unique(&self) -> Option<&str> {
        self.inner.job_unique.get().map(String::as_str)
    }
}

/// Per-job state handed to every step.
pub struct TaskContext {
    pub global_config: Arc<Config>,
    pub plugin_config: PluginConfig,
    pub job_name: String,
    pub job: Job,
    pub job_arguments: JobArguments,
    pub current_step: u32,
    pub total_steps: u32,
    pub success: bool,
    pub messages: Vec<String>,
    pub work_data: WorkData,
    cancel: CancelHandle,
}

impl TaskContext {
    /// Record an anticipated test failure. The first message becomes the
    /// task's result string.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(job = %self.job.unique, "{}", message);
        self.success = false;
        self.messages.push(message);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// First recorded diagnostic, the reason a failed task gives.
    pub fn failure_reason(&self) -> String {
        self.messages
            .first()
            .cloned()
            .unwrap_or_else(|| "Failed".to_string())
    }

    fn final_result(&self) -> ResultStatus {
        if self.plugin_config.shutdown_after {
            ResultStatus::Dirty
        } else if self.success {
            ResultStatus::Success
        } else {
            ResultStatus::Failed(self.failure_reason())
        }
    }
}

/// One execution of a job against a plugin.
pub struct Task<H: TaskHandler> {
    handler: H,
    global_config: Arc<Config>,
    plugin_config: PluginConfig,
    job_name: String,
    manager: String,
    cancel: CancelHandle,
    total_steps: u32,
    context: Option<TaskContext>,
}

impl<H: TaskHandler> Task<H> {
    pub fn new(
        handler: H,
        global_config: Arc<Config>,
        plugin_config: PluginConfig,
        job_name: String,
    ) -> Self {
        let total_steps = handler.steps().len() as u32;
        let manager = global_config.manager_identity();
        Self {
            handler,
            global_config,
            plugin_config,
            job_name,
            manager,
            cancel: CancelHandle::new(),
            total_steps,
            context: None,
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Cooperative stop; only honoured when `token` is this task's job id.
    pub fn stop(&self, token: &str) -> bool {
        self.cancel.stop(token)
    }

    pub fn total_steps(&self) -> u32 {
        self.total_steps
    }

    pub fn current_step(&self) -> u32 {
        self.context.as_ref().map(|c| c.current_step).unwrap_or(0)
    }

    pub fn work_data(&self) -> Option<&WorkData> {
        self.context.as_ref().map(|c| &c.work_data)
    }

    pub fn messages(&self) -> &[String] {
        self.context.as_ref().map(|c| c.messages.as_slice()).unwrap_or(&[])
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Run the job to a terminal outcome, reporting everything to `queue`.
    pub async fn start(&mut self, job: Job, queue: &dyn JobQueue) -> TaskOutcome {
        let span = tracing::info_span!("task", job = %job.unique, function = %job.function);
        self.run(job, queue).instrument(span).await
    }

    async fn run(&mut self, job: Job, queue: &dyn JobQueue) -> TaskOutcome {
        self.cancel.bind(&job.unique);

        let job_arguments = match JobArguments::from_payload(&job.arguments) {
            Ok(args) => args,
            Err(e) => {
                let message = e.to_string();
                error!("Rejecting job: {}", message);
                report(queue.send_work_exception(&job, &message).await);
                return TaskOutcome::Excepted(message);
            }
        };
        debug!("Got job arguments {:?}", job_arguments);

        let work_data = WorkData::new(
            self.job_name.clone(),
            job.unique.clone(),
            self.manager.clone(),
        );
        let mut ctx = TaskContext {
            global_config: self.global_config.clone(),
            plugin_config: self.plugin_config.clone(),
            job_name: self.job_name.clone(),
            job,
            job_arguments,
            current_step: 0,
            total_steps: self.total_steps,
            success: true,
            messages: Vec::new(),
            work_data,
            cancel: self.cancel.clone(),
        };

        report(queue.send_work_data(&ctx.job, &ctx.work_data).await);
        report(queue.send_work_status(&ctx.job, 0, ctx.total_steps).await);

        let outcome = self.run_steps(&mut ctx, queue).await;
        self.context = Some(ctx);
        outcome
    }

    async fn run_steps(&mut self, ctx: &mut TaskContext, queue: &dyn JobQueue) -> TaskOutcome {
        for step in self.handler.steps() {
            if ctx.is_cancelled() {
                return cancelled(ctx, queue).await;
            }

            debug!(
                step = step.name,
                "Running step {}/{}",
                ctx.current_step + 1,
                ctx.total_steps
            );
            let caught = AssertUnwindSafe((step.run)(&mut self.handler, ctx))
                .catch_unwind()
                .await;
            let result = match caught {
                Ok(result) => result,
                Err(panic) => {
                    if ctx.is_cancelled() {
                        return cancelled(ctx, queue).await;
                    }
                    let message = format!("{}: {}", step.name, panic_message(panic));
                    return excepted(ctx, queue, message).await;
                }
            };

            if let Err(e) = result {
                if ctx.is_cancelled() || matches!(e, WorkerError::Cancelled) {
                    return cancelled(ctx, queue).await;
                }
                if e.is_test_failure() {
                    // The job's code failed, not the worker; keep going so logs get published.
                    ctx.fail(format!("Failed: {}", e));
                    advance(ctx, queue).await;
                    continue;
                }
                return excepted(ctx, queue, format!("{}: {}", step.name, e)).await;
            }

            advance(ctx, queue).await;
        }

        let result = ctx.final_result();
        if result == ResultStatus::Dirty && !ctx.success {
            let reason = ctx.failure_reason();
            warn!(reason = %reason, "Job failed and left the environment dirty");
            ctx.work_data.reason = Some(reason);
        }
        ctx.work_data.set_result(result);
        report(queue.send_work_data(&ctx.job, &ctx.work_data).await);

        if ctx.success {
            let result = ctx.work_data.result.as_ref().map(|r| r.as_str()).unwrap_or_default();
            info!(result = %result, "Job succeeded");
            report(queue.send_work_complete(&ctx.job, &ctx.work_data).await);
            TaskOutcome::Succeeded(ctx.work_data.clone())
        } else {
            info!(messages = ?ctx.messages, "Job failed");
            report(queue.send_work_fail(&ctx.job).await);
            TaskOutcome::Failed
        }
    }
}

async fn advance(ctx: &mut TaskContext, queue: &dyn JobQueue) {
    ctx.current_step = (ctx.current_step + 1).min(ctx.total_steps);
    report(queue.send_work_status(&ctx.job, ctx.current_step, ctx.total_steps).await);
}

/// An unanticipated fault: record it, report on the exception channel and
/// run no further steps.
async fn excepted(ctx: &mut TaskContext, queue: &dyn JobQueue, message: String) -> TaskOutcome {
    error!("Step failed unexpectedly: {}", message);
    ctx.success = false;
    ctx.messages.push(message.clone());
    ctx.work_data.set_result(ResultStatus::Failed(message.clone()));
    report(queue.send_work_data(&ctx.job, &ctx.work_data).await);
    report(queue.send_work_exception(&ctx.job, &message).await);
    TaskOutcome::Excepted(message)
}

async fn cancelled(ctx: &mut TaskContext, queue: &dyn JobQueue) -> TaskOutcome {
    info!("Job cancelled at step {}/{}", ctx.current_step, ctx.total_steps);
    ctx.success = false;
    ctx.work_data.set_result(ResultStatus::Cancelled);
    report(queue.send_work_data(&ctx.job, &ctx.work_data).await);
    report(queue.send_work_status(&ctx.job, ctx.current_step, ctx.total_steps).await);
    report(queue.send_work_fail(&ctx.job).await);
    TaskOutcome::Cancelled
}

/// Queue packets are best-effort; a lost status update must not fail the job.
fn report(result: Result<(), WorkerError>) {
    if let Err(e) = result {
        warn!("Failed to send packet to queue: {}", e);
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("step panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("step panicked: {}", s)
    } else {
        "step panicked".to_string()
    }
}
