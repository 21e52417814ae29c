use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    /// Malformed plugin configuration or dataset descriptor. Fatal at load time.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Job arguments could not be decoded or lack a required key.
    #[error("Payload error: {0}")]
    Payload(String),

    /// A migration or test script could not be run or exited non-zero.
    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("No plugin registered for: {0}")]
    PluginNotFound(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WorkerError {
    /// Whether this error belongs on the ordinary `failed` channel rather
    /// than the `excepted` one.
    pub fn is_test_failure(&self) -> bool {
        matches!(
            self,
            WorkerError::Execution(_) | WorkerError::Analysis(_) | WorkerError::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
