use crate::error::WorkerError;
use crate::job::{Job, WorkData};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, VecDeque};
use tokio::sync::{Mutex, Notify};

/// The worker's view of the job queue. The transport behind it is not the
/// worker's concern; every queue implementation maps onto these primitives.
#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    /// Advertise a function this worker can run.
    async fn register_function(&self, function: &str) -> Result<(), WorkerError>;

    async fn unregister_function(&self, function: &str) -> Result<(), WorkerError>;

    /// Functions currently registered by this worker.
    async fn functions(&self) -> Vec<String>;

    /// Wait for the next job submitted to one of `functions`.
    /// Returns `None` once the queue is closed and nothing matching is pending.
    async fn grab_job(&self, functions: &[String]) -> Result<Option<Job>, WorkerError>;

    async fn send_work_data(&self, job: &Job, data: &WorkData) -> Result<(), WorkerError>;

    async fn send_work_status(
        &self,
        job: &Job,
        current: u32,
        total: u32,
    ) -> Result<(), WorkerError>;

    async fn send_work_complete(&self, job: &Job, data: &WorkData) -> Result<(), WorkerError>;

    async fn send_work_fail(&self, job: &Job) -> Result<(), WorkerError>;

    async fn send_work_exception(&self, job: &Job, message: &str) -> Result<(), WorkerError>;
}

/// Everything a worker reported about one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEventKind {
    Data(WorkData),
    Status { current: u32, total: u32 },
    Complete(WorkData),
    Fail,
    Exception(String),
}

impl JobEventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEventKind::Complete(_) | JobEventKind::Fail | JobEventKind::Exception(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub unique: String,
    pub kind: JobEventKind,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    functions: BTreeSet<String>,
    pending: VecDeque<Job>,
    events: Vec<JobEvent>,
    closed: bool,
}

/// In-process queue. Backs local runs and tests; records every packet a
/// worker sends so callers can inspect progress and outcomes.
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a job. Jobs for unregistered functions wait until one is
    /// registered.
    pub async fn submit(&self, job: Job) {
        self.state.lock().await.pending.push_back(job);
        self.notify.notify_waiters();
    }

    /// No further jobs will be submitted; idle `grab_job` calls return `None`.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    pub async fn events(&self) -> Vec<JobEvent> {
        self.state.lock().await.events.clone()
    }

    pub async fn events_for(&self, unique: &str) -> Vec<JobEventKind> {
        self.state
            .lock()
            .await
            .events
            .iter()
            .filter(|e| e.unique == unique)
            .map(|e| e.kind.clone())
            .collect()
    }

    /// Terminal event for a job, if one was sent.
    pub async fn outcome_of(&self, unique: &str) -> Option<JobEventKind> {
        self.events_for(unique)
            .await
            .into_iter()
            .rev()
            .find(JobEventKind::is_terminal)
    }

    /// Wait until a terminal event for `unique` has been recorded.
    pub async fn wait_for_outcome(&self, unique: &str) -> JobEventKind {
        loop {
            let notified = self.notify.notified();
            if let Some(outcome) = self.outcome_of(unique).await {
                return outcome;
            }
            notified.await;
        }
    }

    pub async fn pending(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    async fn record(&self, job: &Job, kind: JobEventKind) {
        self.state.lock().await.events.push(JobEvent {
            unique: job.unique.clone(),
            kind,
            at: Utc::now(),
        });
        self.notify.notify_waiters();
    }
}

#[async_trait::async_trait]
impl JobQueue for InMemoryQueue {
    async fn register_function(&self, function: &str) -> Result<(), WorkerError> {
        self.state.lock().await.functions.insert(function.to_string());
        self.notify.notify_waiters();
        Ok(())
    }

    async fn unregister_function(&self, function: &str) -> Result<(), WorkerError> {
        self.state.lock().await.functions.remove(function);
        Ok(())
    }

    async fn functions(&self) -> Vec<String> {
        self.state.lock().await.functions.iter().cloned().collect()
    }

    async fn grab_job(&self, functions: &[String]) -> Result<Option<Job>, WorkerError> {
        loop {
            // Registered before the state check so a submit in between still wakes us.
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                let position = state.pending.iter().position(|job| {
                    functions.contains(&job.function) && state.functions.contains(&job.function)
                });
                if let Some(job) = position.and_then(|i| state.pending.remove(i)) {
                    return Ok(Some(job));
                }
                if state.closed {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    async fn send_work_data(&self, job: &Job, data: &WorkData) -> Result<(), WorkerError> {
        self.record(job, JobEventKind::Data(data.clone())).await;
        Ok(())
    }

    async fn send_work_status(
        &self,
        job: &Job,
        current: u32,
        total: u32,
    ) -> Result<(), WorkerError> {
        self.record(job, JobEventKind::Status { current, total }).await;
        Ok(())
    }

    async fn send_work_complete(&self, job: &Job, data: &WorkData) -> Result<(), WorkerError> {
        self.record(job, JobEventKind::Complete(data.clone())).await;
        Ok(())
    }

    async fn send_work_fail(&self, job: &Job) -> Result<(), WorkerError> {
        self.record(job, JobEventKind::Fail).await;
        Ok(())
    }

    async fn send_work_exception(&self, job: &Job, message: &str) -> Result<(), WorkerError> {
        self.record(job, JobEventKind::Exception(message.to_string())).await;
        Ok(())
    }
}
