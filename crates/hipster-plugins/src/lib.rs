pub mod analyzer;
pub mod checkout;
pub mod dataset;
pub mod real_db_upgrade;
pub mod registry;
pub mod results;
pub mod shell_script;

pub use analyzer::{check_log_file, check_log_lines, LogVerdict};
pub use dataset::{select_job_datasets, Dataset, DatasetCatalog, JobDataset};
pub use registry::{PluginKind, PluginRegistration, PluginRegistry, TaskKind};
