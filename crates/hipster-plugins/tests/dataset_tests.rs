use hipster_core::config::{Config, PluginConfig};
use hipster_core::error::WorkerError;
use hipster_core::job::{JobArguments, ResultStatus};
use hipster_plugins::dataset::{job_identifier, select_job_datasets, DatasetCatalog};
use std::path::{Path, PathBuf};

fn write_dataset(root: &Path, name: &str, project: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let descriptor = serde_json::json!({
        "project": project,
        "type": "mysql",
        "db_user": "nova",
        "db_pass": "tester",
        "database": "nova",
        "seed_data": "nova.sql",
        "logging_conf": "logging.conf",
    });
    std::fs::write(dir.join("config.json"), descriptor.to_string()).unwrap();
}

fn write_script(scripts: &Path, basename: &str) {
    std::fs::create_dir_all(scripts).unwrap();
    let script = scripts.join(format!("{}_mysql_migrations.sh", basename));
    std::fs::write(script, "#!/bin/sh\n").unwrap();
}

fn args(project: &str) -> JobArguments {
    let payload = serde_json::json!({
        "ZUUL_PROJECT": project,
        "ZUUL_CHANGE": "12345",
        "ZUUL_PATCHSET": "3",
        "ZUUL_PIPELINE": "check",
    });
    JobArguments::from_payload(payload.to_string().as_bytes()).unwrap()
}

struct Fixture {
    _dir: tempfile::TempDir,
    datasets: PathBuf,
    config: Config,
    plugin: PluginConfig,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let datasets = dir.path().join("datasets");
    std::fs::create_dir_all(&datasets).unwrap();

    let mut config = Config::empty();
    config.jobs_working_dir = dir.path().join("jobs");
    config.scripts_dir = dir.path().join("scripts");
    config.pip_download_cache = dir.path().join("pip");

    let plugin = PluginConfig {
        name: "real_db_upgrade".to_string(),
        function: "build:real-db-upgrade_nova_mysql".to_string(),
        datasets_dir: Some(datasets.clone()),
        scripts_dir: None,
        script: None,
        shutdown_after: false,
    };
    Fixture {
        _dir: dir,
        datasets,
        config,
        plugin,
    }
}

#[test]
fn test_discovery_skips_directories_without_descriptor() {
    let fx = fixture();
    write_dataset(&fx.datasets, "user_002", "openstack/nova");
    write_dataset(&fx.datasets, "user_001", "openstack/nova");
    std::fs::create_dir_all(fx.datasets.join("scratch")).unwrap();
    std::fs::write(fx.datasets.join("README"), "not a dataset").unwrap();

    let catalog = DatasetCatalog::discover(&fx.datasets).unwrap();

    let names: Vec<&str> = catalog.datasets().iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["user_001", "user_002"]);
    assert_eq!(catalog.datasets()[0].config.db_type, "mysql");
    assert_eq!(
        catalog.datasets()[0].seed_data_path(),
        fx.datasets.join("user_001").join("nova.sql")
    );
}

#[test]
fn test_malformed_descriptor_is_a_config_error() {
    let fx = fixture();
    let broken = fx.datasets.join("broken");
    std::fs::create_dir_all(&broken).unwrap();
    std::fs::write(broken.join("config.json"), r#"{"project": "openstack/nova""#).unwrap();

    let err = DatasetCatalog::discover(&fx.datasets).unwrap_err();
    assert!(matches!(err, WorkerError::Config(_)));
}

#[test]
fn test_missing_datasets_dir_is_a_config_error() {
    let fx = fixture();
    let err = DatasetCatalog::discover(&fx.datasets.join("nope")).unwrap_err();
    assert!(matches!(err, WorkerError::Config(_)));
}

#[test]
fn test_other_projects_are_excluded_even_with_a_script() {
    let fx = fixture();
    write_dataset(&fx.datasets, "nova_set", "openstack/nova");
    write_dataset(&fx.datasets, "keystone_set", "openstack/keystone");
    write_script(&fx.config.scripts_dir, "nova");
    write_script(&fx.config.scripts_dir, "keystone");
    let catalog = DatasetCatalog::discover(&fx.datasets).unwrap();

    let args = args("openstack/keystone");
    let selected = select_job_datasets(&catalog, &fx.config, &fx.plugin, &args, "abc");

    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].name(), "keystone_set");
}

#[test]
fn test_only_datasets_with_a_migration_script_are_selected() {
    let fx = fixture();
    write_dataset(&fx.datasets, "a", "A");
    write_dataset(&fx.datasets, "b", "B");
    write_script(&fx.config.scripts_dir, "A");
    let catalog = DatasetCatalog::discover(&fx.datasets).unwrap();

    let args_a = args("A");
    let selected = select_job_datasets(&catalog, &fx.config, &fx.plugin, &args_a, "abc");
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].name(), "a");
    assert_eq!(selected[0].result, ResultStatus::Untested);
    assert_eq!(selected[0].command, fx.config.scripts_dir.join("A_mysql_migrations.sh"));

    assert!(select_job_datasets(&catalog, &fx.config, &fx.plugin, &args("B"), "abc").is_empty());
}

#[test]
fn test_plugin_scripts_dir_overrides_global() {
    let mut fx = fixture();
    write_dataset(&fx.datasets, "nova_set", "openstack/nova");
    let own_scripts = fx.datasets.parent().unwrap().join("own-scripts");
    write_script(&own_scripts, "nova");
    fx.plugin.scripts_dir = Some(own_scripts.clone());
    let catalog = DatasetCatalog::discover(&fx.datasets).unwrap();

    let args = args("openstack/nova");
    let selected = select_job_datasets(&catalog, &fx.config, &fx.plugin, &args, "abc");
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].command, own_scripts.join("nova_mysql_migrations.sh"));
}

#[test]
fn test_job_paths_are_isolated_per_job_and_dataset() {
    let fx = fixture();
    write_dataset(&fx.datasets, "user_001", "openstack/nova");
    write_script(&fx.config.scripts_dir, "nova");
    let catalog = DatasetCatalog::discover(&fx.datasets).unwrap();
    let args = args("openstack/nova");

    let first = select_job_datasets(&catalog, &fx.config, &fx.plugin, &args, "job-1");
    let second = select_job_datasets(&catalog, &fx.config, &fx.plugin, &args, "job-2");

    let expected = fx
        .config
        .jobs_working_dir
        .join("12/12345/3/check/real-db-upgrade_nova_mysql/job-1/user_001");
    assert_eq!(first[0].working_dir, expected);
    assert_eq!(first[0].log_file_path, expected.join("user_001.log"));
    assert_ne!(first[0].working_dir, second[0].working_dir);
}

#[test]
fn test_invocation_passes_nine_positional_arguments() {
    let fx = fixture();
    write_dataset(&fx.datasets, "user_001", "openstack/nova");
    write_script(&fx.config.scripts_dir, "nova");
    let catalog = DatasetCatalog::discover(&fx.datasets).unwrap();
    let args = args("openstack/nova");
    let selected = select_job_datasets(&catalog, &fx.config, &fx.plugin, &args, "job-1");

    let command =
        selected[0].invocation("job-1", Path::new("/git/nova"), &fx.config.pip_download_cache);

    let dataset_dir = fx.datasets.join("user_001");
    assert_eq!(
        command.args,
        vec![
            "job-1".to_string(),
            selected[0].working_dir.display().to_string(),
            "/git/nova".to_string(),
            "nova".to_string(),
            "tester".to_string(),
            "nova".to_string(),
            dataset_dir.join("nova.sql").display().to_string(),
            dataset_dir.join("logging.conf").display().to_string(),
            fx.config.pip_download_cache.display().to_string(),
        ]
    );
}

#[test]
fn test_identifier_without_change_details() {
    let args = JobArguments::from_payload(br#"{"ZUUL_PROJECT": "openstack/nova"}"#).unwrap();
    assert_eq!(
        job_identifier(&args, "build:do_something", "f00d"),
        PathBuf::from("do_something/f00d")
    );
}

#[test]
fn test_identifier_components_cannot_escape_the_jobs_dir() {
    let payload = br#"{"ZUUL_PROJECT": "x", "ZUUL_CHANGE": "../..", "ZUUL_PATCHSET": "1/2"}"#;
    let args = JobArguments::from_payload(payload).unwrap();
    let id = job_identifier(&args, "build:f", "..");
    assert!(id.components().all(|c| matches!(c, std::path::Component::Normal(_))), "{:?}", id);
}

#[test]
fn test_distinct_job_ids_get_distinct_identifiers() {
    let args = JobArguments::from_payload(br#"{"ZUUL_PROJECT": "openstack/nova"}"#).unwrap();
    let slashed = job_identifier(&args, "build:f", "a/b");
    let underscored = job_identifier(&args, "build:f", "a_b");
    let coloned = job_identifier(&args, "build:f", "a:b");

    assert_ne!(slashed, underscored);
    assert_ne!(slashed, coloned);
    assert_ne!(underscored, coloned);
    assert_eq!(underscored, PathBuf::from("f/a_b"));
    assert_eq!(slashed.components().count(), 2);
}
