use hipster_core::Config;
use std::path::{Path, PathBuf};

const SAMPLE_CONFIG: &str = r#"# turbo-hipster worker configuration

# manager_name: turbo-hipster-manager-ci01
jobs_working_dir: /var/lib/turbo-hipster/jobs
git_working_dir: /var/lib/turbo-hipster/git
pip_download_cache: /var/cache/pip
scripts_dir: /var/lib/turbo-hipster/scripts

git:
  prep_script: gerrit-git-prep.sh
  review_url: https://review.openstack.org
  zuul_url: http://zuul.rcbops.com
  origin: git://git.openstack.org/

logs:
  syslog: /var/log/syslog
  sqlslo: /var/log/mysql/slow-queries.log
  sqlerr: /var/log/mysql/error.log

publish_logs:
  type: local
  path: /var/www/results
  prepend_url: http://localhost/results/

plugins:
  - name: real_db_upgrade
    function: build:real-db-upgrade_nova_mysql_devstack_150
    datasets_dir: /var/lib/turbo-hipster/datasets_devstack_150

  - name: shell_script
    function: build:do_something_shelly
    script: ./tools/run_tests.sh
    shutdown_after: true
"#;

pub async fn run(config_path: Option<&Path>, path: bool, init: bool) -> anyhow::Result<()> {
    let config_path: PathBuf = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::default_path);

    if path {
        println!("{}", config_path.display());
        return Ok(());
    }

    if init {
        if config_path.exists() {
            println!("Config already exists at: {}", config_path.display());
            println!("Remove it first if you want to reinitialize.");
            return Ok(());
        }

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&config_path, SAMPLE_CONFIG)?;
        println!("Sample config written to: {}", config_path.display());
        return Ok(());
    }

    println!("Config path: {}", config_path.display());
    if config_path.exists() {
        let config = Config::load_from(&config_path)?;
        println!("Manager:     {}", config.manager_identity());
        println!("Jobs dir:    {}", config.jobs_working_dir.display());
        println!("Plugins:     {}", config.plugins.len());
        for p in &config.plugins {
            println!("  - {} ({})", p.queue_function(), p.name);
        }
    } else {
        println!("Status:      not found");
        println!("Run `hipster-worker config --init` to create one.");
    }

    Ok(())
}
