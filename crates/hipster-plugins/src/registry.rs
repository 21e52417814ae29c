//! Maps plugin names to task handlers.
//!
//! The set of handlers is closed: a plugin entry naming anything else is a
//! configuration error when the registry is loaded.

use crate::dataset::DatasetCatalog;
use crate::real_db_upgrade::Runner;
use crate::shell_script::ShellTask;
use hipster_core::config::{Config, PluginConfig};
use hipster_core::engine::{CancelHandle, Task};
use hipster_core::error::WorkerError;
use hipster_core::job::{Job, TaskOutcome, WorkData};
use hipster_core::queue::JobQueue;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    RealDbUpgrade,
    ShellScript,
}

impl PluginKind {
    pub const ALL: [PluginKind; 2] = [PluginKind::RealDbUpgrade, PluginKind::ShellScript];

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::RealDbUpgrade => "real_db_upgrade",
            PluginKind::ShellScript => "shell_script",
        }
    }
}

impl FromStr for PluginKind {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PluginKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| WorkerError::PluginNotFound(s.to_string()))
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured plugin, ready to build tasks for its queue function.
#[derive(Debug, Clone)]
pub struct PluginRegistration {
    pub queue_function: String,
    pub config: PluginConfig,
    pub kind: PluginKind,
    /// Datasets for `real_db_upgrade` plugins; empty otherwise.
    pub catalog: Arc<DatasetCatalog>,
}

impl PluginRegistration {
    pub fn new(config: PluginConfig) -> Result<Self, WorkerError> {
        let kind: PluginKind = config.name.parse()?;
        let catalog = match kind {
            PluginKind::RealDbUpgrade => {
                let dir = config.datasets_dir.as_deref().ok_or_else(|| {
                    let message = format!("plugin '{}' needs a datasets_dir", config.function);
                    WorkerError::Config(message)
                })?;
                DatasetCatalog::discover(dir)?
            }
            PluginKind::ShellScript => {
                if config.script.is_none() {
                    return Err(WorkerError::Config(format!(
                        "plugin '{}' needs a script",
                        config.function
                    )));
                }
                DatasetCatalog::default()
            }
        };

        Ok(Self {
            queue_function: config.queue_function(),
            config,
            kind,
            catalog: Arc::new(catalog),
        })
    }

    /// A fresh task for one job of this plugin.
    pub fn new_task(&self, global_config: Arc<Config>) -> TaskKind {
        let job_name = self.config.short_function().to_string();
        match self.kind {
            PluginKind::RealDbUpgrade => TaskKind::RealDbUpgrade(Task::new(
                Runner::new(self.catalog.clone()),
                global_config,
                self.config.clone(),
                job_name,
            )),
            PluginKind::ShellScript => TaskKind::ShellScript(Task::new(
                ShellTask::new(),
                global_config,
                self.config.clone(),
                job_name,
            )),
        }
    }
}

/// Every configured plugin, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    registrations: Vec<PluginRegistration>,
}

impl PluginRegistry {
    /// Resolve every plugin in `config`. Any bad entry fails the whole load.
    pub fn load(config: &Config) -> Result<Self, WorkerError> {
        let registrations = config
            .plugins
            .iter()
            .cloned()
            .map(PluginRegistration::new)
            .collect::<Result<Vec<_>, _>>()?;
        for registration in &registrations {
            info!(
                plugin = %registration.kind,
                datasets = registration.catalog.len(),
                "Loaded plugin for {}",
                registration.queue_function
            );
        }
        Ok(Self { registrations })
    }

    pub fn registrations(&self) -> &[PluginRegistration] {
        &self.registrations
    }

    pub fn get(&self, queue_function: &str) -> Option<&PluginRegistration> {
        self.registrations
            .iter()
            .find(|r| r.queue_function == queue_function)
    }

    pub fn functions(&self) -> Vec<String> {
        self.registrations
            .iter()
            .map(|r| r.queue_function.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

/// A task of any registered kind.
pub enum TaskKind {
    RealDbUpgrade(Task<Runner>),
    ShellScript(Task<ShellTask>),
}

impl TaskKind {
    pub async fn start(&mut self, job: Job, queue: &dyn JobQueue) -> TaskOutcome {
        match self {
            TaskKind::RealDbUpgrade(task) => task.start(job, queue).await,
            TaskKind::ShellScript(task) => task.start(job, queue).await,
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        match self {
            TaskKind::RealDbUpgrade(task) => task.cancel_handle(),
            TaskKind::ShellScript(task) => task.cancel_handle(),
        }
    }

    pub fn work_data(&self) -> Option<&WorkData> {
        match self {
            TaskKind::RealDbUpgrade(task) => task.work_data(),
            TaskKind::ShellScript(task) => task.work_data(),
        }
    }

    pub fn current_step(&self) -> u32 {
        match self {
            TaskKind::RealDbUpgrade(task) => task.current_step(),
            TaskKind::ShellScript(task) => task.current_step(),
        }
    }

    pub fn total_steps(&self) -> u32 {
        match self {
            TaskKind::RealDbUpgrade(task) => task.total_steps(),
            TaskKind::ShellScript(task) => task.total_steps(),
        }
    }
}
