use hipster_core::config::{Config, PluginConfig};
use hipster_core::error::WorkerError;
use hipster_core::job::{path_component, JobArguments, ResultStatus};
use hipster_exec::WatchedCommand;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Descriptor file every dataset directory carries.
pub const DESCRIPTOR_FILE: &str = "config.json";

/// Contents of a dataset's `config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub project: String,
    /// Database engine, e.g. `mysql`. Selects the migration script.
    #[serde(rename = "type")]
    pub db_type: String,
    pub db_user: String,
    pub db_pass: String,
    pub database: String,
    /// Relative to the dataset directory.
    pub seed_data: PathBuf,
    /// Relative to the dataset directory.
    pub logging_conf: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub name: String,
    pub dir: PathBuf,
    pub config: DatasetDescriptor,
}

impl Dataset {
    pub fn seed_data_path(&self) -> PathBuf {
        self.dir.join(&self.config.seed_data)
    }

    pub fn logging_conf_path(&self) -> PathBuf {
        self.dir.join(&self.config.logging_conf)
    }
}

/// Datasets found under one plugin's `datasets_dir`. Built once at
/// registration and shared read-only by every job of that plugin.
#[derive(Debug, Clone, Default)]
pub struct DatasetCatalog {
    datasets: Vec<Dataset>,
}

impl DatasetCatalog {
    /// Scan `dir`: each subdirectory holding a `config.json` is a dataset.
    /// Subdirectories without one are skipped; an unparseable descriptor is
    /// a configuration error.
    pub fn discover(dir: &Path) -> Result<Self, WorkerError> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            WorkerError::Config(format!("cannot read datasets dir {}: {}", dir.display(), e))
        })?;

        let mut datasets = Vec::new();
        for entry in entries {
            let entry = entry?;
            let dataset_dir = entry.path();
            let descriptor = dataset_dir.join(DESCRIPTOR_FILE);
            if !dataset_dir.is_dir() || !descriptor.is_file() {
                continue;
            }

            let contents = std::fs::read_to_string(&descriptor)?;
            let config: DatasetDescriptor = serde_json::from_str(&contents).map_err(|e| {
                WorkerError::Config(format!(
                    "invalid dataset descriptor {}: {}",
                    descriptor.display(),
                    e
                ))
            })?;
            datasets.push(Dataset {
                name: entry.file_name().to_string_lossy().into_owned(),
                dir: dataset_dir,
                config,
            });
        }
        datasets.sort_by(|a, b| a.name.cmp(&b.name));

        info!("Found {} dataset(s) in {}", datasets.len(), dir.display());
        Ok(Self { datasets })
    }

    pub fn from_datasets(datasets: Vec<Dataset>) -> Self {
        Self { datasets }
    }

    pub fn datasets(&self) -> &[Dataset] {
        &self.datasets
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}

/// A dataset bound to one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDataset {
    pub dataset: Dataset,
    /// Working directory private to this (job, function, dataset).
    pub working_dir: PathBuf,
    pub log_file_path: PathBuf,
    pub command: PathBuf,
    pub result: ResultStatus,
    pub exit_code: Option<i32>,
    pub result_url: Option<String>,
}

impl JobDataset {
    pub fn name(&self) -> &str {
        &self.dataset.name
    }

    /// Full invocation of the migration script for this dataset.
    /// Positional arguments: unique id, working dir, checkout path, db user,
    /// db password, db name, seed data, logging config, pip cache dir.
    pub fn invocation(
        &self,
        job_unique: &str,
        git_path: &Path,
        pip_cache: &Path,
    ) -> WatchedCommand {
        let config = &self.dataset.config;
        WatchedCommand::new(self.command.to_string_lossy())
            .arg(job_unique)
            .arg(self.working_dir.to_string_lossy())
            .arg(git_path.to_string_lossy())
            .arg(config.db_user.as_str())
            .arg(config.db_pass.as_str())
            .arg(config.database.as_str())
            .arg(self.dataset.seed_data_path().to_string_lossy())
            .arg(self.dataset.logging_conf_path().to_string_lossy())
            .arg(pip_cache.to_string_lossy())
    }
}

/// Migration script for a project and database engine, if one exists.
pub fn project_command(scripts_dir: &Path, args: &JobArguments, db_type: &str) -> Option<PathBuf> {
    let command = scripts_dir.join(format!(
        "{}_{}_migrations.sh",
        args.project_basename(),
        db_type
    ));
    command.is_file().then_some(command)
}

/// Relative path that isolates one job's files from every other job's.
///
/// Built from the change under test when the job carries one (so logs for
/// the same change sit together), always ending in the function and the
/// full job unique id. Every component goes through [`path_component`], so
/// two jobs with different ids never share a directory.
pub fn job_identifier(args: &JobArguments, function: &str, unique: &str) -> PathBuf {
    let function = function.strip_prefix("build:").unwrap_or(function);
    let mut path = PathBuf::new();
    if let (Some(change), Some(patchset)) = (args.get("ZUUL_CHANGE"), args.get("ZUUL_PATCHSET")) {
        let prefix: String = change.chars().take(2).collect();
        path.push(path_component(&prefix));
        path.push(path_component(change));
        path.push(path_component(patchset));
        path.push(path_component(args.get("ZUUL_PIPELINE").unwrap_or("unknown")));
    }
    path.push(path_component(function));
    path.push(path_component(unique));
    path
}

/// Datasets from `catalog` that apply to this job: the descriptor's
/// project must equal the job's project and a migration script for the
/// project and engine must exist. Anything else is left out silently.
pub fn select_job_datasets(
    catalog: &DatasetCatalog,
    global: &Config,
    plugin: &PluginConfig,
    args: &JobArguments,
    unique: &str,
) -> Vec<JobDataset> {
    let scripts_dir = plugin.scripts_dir(global);
    let identifier = job_identifier(args, &plugin.function, unique);

    catalog
        .datasets()
        .iter()
        .filter(|dataset| dataset.config.project == args.project())
        .filter_map(|dataset| {
            let Some(command) = project_command(scripts_dir, args, &dataset.config.db_type) else {
                debug!(
                    "No {} migration script for {} in {}",
                    dataset.config.db_type,
                    args.project(),
                    scripts_dir.display()
                );
                return None;
            };
            let working_dir = global
                .jobs_working_dir
                .join(&identifier)
                .join(path_component(&dataset.name));
            let log_file_path = working_dir.join(format!("{}.log", dataset.name));
            Some(JobDataset {
                dataset: dataset.clone(),
                working_dir,
                log_file_path,
                command,
                result: ResultStatus::Untested,
                exit_code: None,
                result_url: None,
            })
        })
        .collect()
}
