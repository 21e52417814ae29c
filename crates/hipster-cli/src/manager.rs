//! Registers the configured plugins with the job queue and runs their jobs.

use hipster_core::config::Config;
use hipster_core::engine::CancelHandle;
use hipster_core::error::WorkerError;
use hipster_core::job::{Job, ResultStatus, WorkData};
use hipster_core::queue::JobQueue;
use hipster_plugins::registry::PluginRegistry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// The job currently being run, as the control loop sees it.
struct InFlight {
    unique: String,
    cancel: CancelHandle,
}

pub struct WorkerManager {
    config: Arc<Config>,
    registry: PluginRegistry,
    queue: Arc<dyn JobQueue>,
    identity: String,
    shutdown: CancellationToken,
    current: Mutex<Option<InFlight>>,
    jobs_run: AtomicUsize,
}

impl WorkerManager {
    pub fn new(config: Arc<Config>, registry: PluginRegistry, queue: Arc<dyn JobQueue>) -> Self {
        let identity = config.manager_identity();
        Self {
            config,
            registry,
            queue,
            identity,
            shutdown: CancellationToken::new(),
            current: Mutex::new(None),
            jobs_run: AtomicUsize::new(0),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Control function stop messages for this worker arrive on.
    pub fn stop_function(&self) -> String {
        format!("stop:{}", self.identity)
    }

    /// Whether the manager has shut down or is shutting down.
    pub fn stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn jobs_run(&self) -> usize {
        self.jobs_run.load(Ordering::SeqCst)
    }

    /// Register every function and serve jobs until stopped, marked dirty,
    /// or the queue closes.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let span = tracing::info_span!("manager", identity = %self.identity);
        async {
            for function in self.registry.functions() {
                self.queue.register_function(&function).await?;
                info!("Registered {}", function);
            }
            self.queue.register_function(&self.stop_function()).await?;
            info!("Listening for stop messages on {}", self.stop_function());

            let (build, control) = tokio::join!(self.build_loop(), self.control_loop());
            build.and(control)
        }
        .instrument(span)
        .await
    }

    /// Stop accepting work and unregister from the queue. A job already
    /// running is left to finish.
    pub async fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        for function in self
            .registry
            .functions()
            .into_iter()
            .chain(std::iter::once(self.stop_function()))
        {
            if let Err(e) = self.queue.unregister_function(&function).await {
                warn!("Could not unregister {}: {}", function, e);
            }
        }
        info!("Manager stopped");
    }

    async fn build_loop(&self) -> Result<(), WorkerError> {
        let functions = self.registry.functions();
        loop {
            let grabbed = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                grabbed = self.queue.grab_job(&functions) => grabbed,
            };
            let job = match grabbed {
                Ok(Some(job)) => job,
                Ok(None) => {
                    debug!("Queue closed");
                    break;
                }
                Err(e) => {
                    error!("Cannot fetch build jobs: {}", e);
                    self.stop().await;
                    return Err(e);
                }
            };

            let work_data = self.run_job(job).await;
            self.jobs_run.fetch_add(1, Ordering::SeqCst);
            if work_data.as_ref().is_some_and(WorkData::is_dirty) {
                info!("Job left the environment dirty, shutting down");
                break;
            }
        }
        self.stop().await;
        Ok(())
    }

    /// Run one build job to its terminal outcome. Returns the task's final
    /// work data, whatever channel the outcome went out on.
    async fn run_job(&self, job: Job) -> Option<WorkData> {
        let Some(registration) = self.registry.get(&job.function) else {
            let message = WorkerError::PluginNotFound(job.function.clone()).to_string();
            warn!("{}", message);
            if let Err(e) = self.queue.send_work_exception(&job, &message).await {
                warn!("Failed to send packet to queue: {}", e);
            }
            return None;
        };

        let mut task = registration.new_task(self.config.clone());
        let cancel = task.cancel_handle();
        cancel.bind(&job.unique);
        *self.current.lock().await = Some(InFlight {
            unique: job.unique.clone(),
            cancel,
        });

        info!(plugin = %registration.kind, "Starting job {}", job.unique);
        let unique = job.unique.clone();
        let outcome = task.start(job, self.queue.as_ref()).await;
        info!(outcome = %outcome.channel(), "Job {} finished", unique);

        *self.current.lock().await = None;
        task.work_data().cloned()
    }

    async fn control_loop(&self) -> Result<(), WorkerError> {
        let functions = vec![self.stop_function()];
        loop {
            let grabbed = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                grabbed = self.queue.grab_job(&functions) => grabbed,
            };
            let job = match grabbed {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    error!("Cannot fetch stop messages: {}", e);
                    self.stop().await;
                    return Err(e);
                }
            };
            self.handle_stop(&job).await;
        }
        Ok(())
    }

    /// A token naming the running job cancels just that job. Anything else
    /// stops the whole worker once its current job is done.
    async fn handle_stop(&self, job: &Job) {
        let token = job.arguments_str();
        let cancelled = match self.current.lock().await.as_ref() {
            Some(in_flight) if in_flight.unique == token => in_flight.cancel.stop(&token),
            _ => false,
        };

        let mut ack = WorkData::new("stop".to_string(), job.unique.clone(), self.identity.clone());
        ack.set_result(ResultStatus::Success);
        if let Err(e) = self.queue.send_work_complete(job, &ack).await {
            warn!("Failed to acknowledge stop: {}", e);
        }

        if cancelled {
            info!("Cancelling job {} at its next step", token);
        } else {
            info!("Stop requested, no longer accepting jobs");
            self.stop().await;
        }
    }
}
