use crate::error::WorkerError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level worker configuration.
/// Loaded from ~/.config/turbo-hipster/config.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Overrides the host-derived manager identity.
    #[serde(default)]
    pub manager_name: Option<String>,
    #[serde(default = "default_jobs_working_dir")]
    pub jobs_working_dir: PathBuf,
    #[serde(default = "default_git_working_dir")]
    pub git_working_dir: PathBuf,
    #[serde(default = "default_pip_download_cache")]
    pub pip_download_cache: PathBuf,
    /// Where `<project>_<type>_migrations.sh` scripts live unless a plugin
    /// overrides it.
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub logs: WatchedLogs,
    #[serde(default)]
    pub publish_logs: PublishConfig,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

/// One registered job function. The `name` selects the task handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginConfig {
    pub name: String,
    pub function: String,
    #[serde(default)]
    pub datasets_dir: Option<PathBuf>,
    #[serde(default)]
    pub scripts_dir: Option<PathBuf>,
    /// Command run by `shell_script` plugins.
    #[serde(default)]
    pub script: Option<String>,
    /// Jobs of this function leave the environment dirty; the worker shuts
    /// down after running one.
    #[serde(default, alias = "shutdown-th")]
    pub shutdown_after: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_prep_script")]
    pub prep_script: String,
    #[serde(default = "default_review_url")]
    pub review_url: String,
    #[serde(default = "default_zuul_url")]
    pub zuul_url: String,
    #[serde(default = "default_git_origin")]
    pub origin: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            prep_script: default_prep_script(),
            review_url: default_review_url(),
            zuul_url: default_zuul_url(),
            origin: default_git_origin(),
        }
    }
}

/// Auxiliary logs tailed into each dataset log while a migration runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedLogs {
    #[serde(default = "default_syslog")]
    pub syslog: PathBuf,
    #[serde(default = "default_sqlslo")]
    pub sqlslo: PathBuf,
    #[serde(default = "default_sqlerr")]
    pub sqlerr: PathBuf,
}

impl Default for WatchedLogs {
    fn default() -> Self {
        Self {
            syslog: default_syslog(),
            sqlslo: default_sqlslo(),
            sqlerr: default_sqlerr(),
        }
    }
}

impl WatchedLogs {
    /// (tag, path) pairs in the order they are watched.
    pub fn tagged(&self) -> Vec<(String, PathBuf)> {
        vec![
            ("[syslog]".to_string(), self.syslog.clone()),
            ("[sqlslo]".to_string(), self.sqlslo.clone()),
            ("[sqlerr]".to_string(), self.sqlerr.clone()),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PublishType {
    #[default]
    Local,
}

impl std::fmt::Display for PublishType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishType::Local => write!(f, "local"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    #[serde(rename = "type", default)]
    pub publish_type: PublishType,
    #[serde(default = "default_publish_path")]
    pub path: PathBuf,
    #[serde(default = "default_prepend_url")]
    pub prepend_url: String,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            publish_type: PublishType::default(),
            path: default_publish_path(),
            prepend_url: default_prepend_url(),
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("turbo-hipster")
}

fn default_jobs_working_dir() -> PathBuf {
    data_dir().join("jobs")
}

fn default_git_working_dir() -> PathBuf {
    data_dir().join("git")
}

fn default_pip_download_cache() -> PathBuf {
    data_dir().join("pip-cache")
}

fn default_scripts_dir() -> PathBuf {
    data_dir().join("scripts")
}

fn default_publish_path() -> PathBuf {
    data_dir().join("published")
}

fn default_prepend_url() -> String {
    "http://localhost/".to_string()
}

fn default_prep_script() -> String {
    "gerrit-git-prep.sh".to_string()
}

fn default_review_url() -> String {
    "https://review.openstack.org".to_string()
}

fn default_zuul_url() -> String {
    "http://zuul.rcbops.com".to_string()
}

fn default_git_origin() -> String {
    "git://git.openstack.org/".to_string()
}

fn default_syslog() -> PathBuf {
    PathBuf::from("/var/log/syslog")
}

fn default_sqlslo() -> PathBuf {
    PathBuf::from("/var/log/mysql/slow-queries.log")
}

fn default_sqlerr() -> PathBuf {
    PathBuf::from("/var/log/mysql/error.log")
}

impl Config {
    /// Load config from the default path, or an empty config if absent.
    pub fn load_default() -> Result<Self, WorkerError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::empty())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, WorkerError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            WorkerError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, WorkerError> {
        let config: Config = serde_yaml::from_str(contents)
            .map_err(|e| WorkerError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Default config file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("turbo-hipster")
            .join("config.yaml")
    }

    /// Config with defaults everywhere and no plugins.
    pub fn empty() -> Self {
        Self {
            manager_name: None,
            jobs_working_dir: default_jobs_working_dir(),
            git_working_dir: default_git_working_dir(),
            pip_download_cache: default_pip_download_cache(),
            scripts_dir: default_scripts_dir(),
            git: GitConfig::default(),
            logs: WatchedLogs::default(),
            publish_logs: PublishConfig::default(),
            plugins: Vec::new(),
        }
    }

    /// Identity used for the `stop:` function and in work data.
    pub fn manager_identity(&self) -> String {
        if let Some(name) = &self.manager_name {
            return name.clone();
        }
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        format!("turbo-hipster-manager-{}", host)
    }

    /// Find a plugin by its queue function.
    pub fn find_plugin(&self, function: &str) -> Option<&PluginConfig> {
        self.plugins
            .iter()
            .find(|p| p.queue_function() == function || p.function == function)
    }

    fn validate(&self) -> Result<(), WorkerError> {
        let mut seen = std::collections::HashSet::new();
        for plugin in &self.plugins {
            if plugin.name.trim().is_empty() {
                return Err(WorkerError::Config(format!(
                    "plugin for function '{}' has no name",
                    plugin.function
                )));
            }
            if plugin.function.trim().is_empty() {
                return Err(WorkerError::Config(format!(
                    "plugin '{}' has no function",
                    plugin.name
                )));
            }
            if !seen.insert(plugin.queue_function()) {
                return Err(WorkerError::Config(format!(
                    "function '{}' is registered twice",
                    plugin.queue_function()
                )));
            }
        }
        Ok(())
    }
}

impl PluginConfig {
    /// Queue function this plugin is registered under.
    pub fn queue_function(&self) -> String {
        if self.function.starts_with("build:") {
            self.function.clone()
        } else {
            format!("build:{}", self.function)
        }
    }

    /// The function name without the `build:` prefix.
    pub fn short_function(&self) -> &str {
        self.function
            .strip_prefix("build:")
            .unwrap_or(&self.function)
    }

    pub fn scripts_dir<'a>(&'a self, global: &'a Config) -> &'a Path {
        self.scripts_dir
            .as_deref()
            .unwrap_or(global.scripts_dir.as_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
manager_name: th-test
jobs_working_dir: /tmp/th/jobs
logs:
  syslog: /tmp/th/syslog
plugins:
  - name: real_db_upgrade
    function: build:real-db-upgrade_nova_mysql_devstack_131007
    datasets_dir: /var/lib/turbo-hipster/datasets_devstack_131007
  - name: shell_script
    function: do_something_shelly
    script: ./run.sh
    shutdown-th: true
"#;

    #[test]
    fn parses_plugins_in_order() {
        let cfg = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(cfg.plugins.len(), 2);
        assert_eq!(cfg.plugins[0].name, "real_db_upgrade");
        assert_eq!(
            cfg.plugins[0].datasets_dir.as_deref(),
            Some(Path::new("/var/lib/turbo-hipster/datasets_devstack_131007"))
        );
        assert_eq!(cfg.plugins[1].script.as_deref(), Some("./run.sh"));
        assert!(cfg.plugins[1].shutdown_after);
        assert!(!cfg.plugins[0].shutdown_after);
    }

    #[test]
    fn queue_function_is_not_double_prefixed() {
        let cfg = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(
            cfg.plugins[0].queue_function(),
            "build:real-db-upgrade_nova_mysql_devstack_131007"
        );
        assert_eq!(cfg.plugins[1].queue_function(), "build:do_something_shelly");
        assert_eq!(cfg.plugins[0].short_function(), "real-db-upgrade_nova_mysql_devstack_131007");
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let cfg = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(cfg.logs.syslog, PathBuf::from("/tmp/th/syslog"));
        assert_eq!(cfg.logs.sqlslo, PathBuf::from("/var/log/mysql/slow-queries.log"));
        assert_eq!(cfg.logs.sqlerr, PathBuf::from("/var/log/mysql/error.log"));
        assert_eq!(cfg.publish_logs.publish_type, PublishType::Local);
        assert_eq!(cfg.git.origin, "git://git.openstack.org/");
    }

    #[test]
    fn manager_identity_override() {
        let cfg = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(cfg.manager_identity(), "th-test");

        let cfg = Config::empty();
        assert!(cfg.manager_identity().starts_with("turbo-hipster-manager-"));
    }

    #[test]
    fn duplicate_functions_are_rejected() {
        let yaml = r#"
plugins:
  - name: shell_script
    function: build:same
  - name: shell_script
    function: same
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, WorkerError::Config(_)));
    }

    #[test]
    fn malformed_yaml_is_a_config_error() {
        let err = Config::from_yaml("plugins: [ {name: x").unwrap_err();
        assert!(matches!(err, WorkerError::Config(_)));
    }

    #[test]
    fn find_plugin_by_either_name() {
        let cfg = Config::from_yaml(SAMPLE).unwrap();
        assert!(cfg.find_plugin("build:do_something_shelly").is_some());
        assert!(cfg.find_plugin("do_something_shelly").is_some());
        assert!(cfg.find_plugin("nope").is_none());
    }
}
