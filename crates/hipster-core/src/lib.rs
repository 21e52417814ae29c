pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod publish;
pub mod queue;

pub use config::{Config, PluginConfig};
pub use engine::{CancelHandle, Step, Task, TaskContext, TaskHandler};
pub use error::WorkerError;
pub use job::{
    path_component, Job, JobArguments, OutcomeChannel, ResultStatus, TaskOutcome, WorkData,
};
pub use publish::{ArtifactStore, PublishedLog};
pub use queue::{InMemoryQueue, JobQueue};
