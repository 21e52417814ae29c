use hipster_exec::{LogWatcher, WatchedCommand, WatchedLog};
use std::time::Duration;

fn watcher() -> LogWatcher {
    LogWatcher::with_poll_interval(Duration::from_millis(10))
}

#[tokio::test]
async fn test_returns_exit_status_and_captures_output() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("out").join("job.log");

    let code = watcher()
        .execute(&WatchedCommand::shell("echo hello; echo oops >&2; exit 3"), &log, &[])
        .await
        .unwrap();

    assert_eq!(code, 3);
    let contents = std::fs::read_to_string(&log).unwrap();
    assert!(contents.contains("hello\n"));
    assert!(contents.contains("oops\n"));
}

#[tokio::test]
async fn test_missing_aux_log_is_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("job.log");
    let never = dir.path().join("never-created.log");

    let code = watcher()
        .execute(
            &WatchedCommand::shell("echo only-me"),
            &log,
            &[WatchedLog::new("[syslog]", &never)],
        )
        .await
        .unwrap();

    assert_eq!(code, 0);
    assert_eq!(std::fs::read_to_string(&log).unwrap(), "only-me\n");
}

#[tokio::test]
async fn test_aux_log_created_by_command_is_tailed_with_tag() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("job.log");
    let aux = dir.path().join("mysql-error.log");

    let script = format!(
        "echo 'table locked' > {aux}; sleep 0.5; echo migrated",
        aux = aux.display()
    );
    let code = watcher()
        .execute(&WatchedCommand::shell(script), &log, &[WatchedLog::new("[sqlerr]", &aux)])
        .await
        .unwrap();

    assert_eq!(code, 0);
    let contents = std::fs::read_to_string(&log).unwrap();
    assert!(contents.contains("[sqlerr] table locked\n"), "log was: {}", contents);
    assert!(contents.contains("migrated\n"));
}

#[tokio::test]
async fn test_existing_aux_content_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("job.log");
    let aux = dir.path().join("syslog");
    std::fs::write(&aux, "old line\n").unwrap();

    let script = format!("echo 'new line' >> {aux}; sleep 0.5", aux = aux.display());
    watcher()
        .execute(&WatchedCommand::shell(script), &log, &[WatchedLog::new("[syslog]", &aux)])
        .await
        .unwrap();

    let contents = std::fs::read_to_string(&log).unwrap();
    assert!(!contents.contains("old line"));
    assert!(contents.contains("[syslog] new line\n"), "log was: {}", contents);
}

#[tokio::test]
async fn test_env_and_working_directory_are_applied() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("job.log");

    let command = WatchedCommand::shell("echo \"$ZUUL_PROJECT in $(pwd)\"")
        .env("ZUUL_PROJECT", "openstack/nova")
        .current_dir(dir.path());
    watcher().execute(&command, &log, &[]).await.unwrap();

    let contents = std::fs::read_to_string(&log).unwrap();
    let cwd = dir.path().canonicalize().unwrap();
    assert!(contents.contains(&format!("openstack/nova in {}", cwd.display())));
}

#[tokio::test]
async fn test_log_is_appended_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("job.log");

    watcher().execute(&WatchedCommand::shell("echo first"), &log, &[]).await.unwrap();
    watcher().execute(&WatchedCommand::shell("echo second"), &log, &[]).await.unwrap();

    assert_eq!(std::fs::read_to_string(&log).unwrap(), "first\nsecond\n");
}

#[tokio::test]
async fn test_unknown_program_is_an_execution_error() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("job.log");

    let err = watcher()
        .execute(&WatchedCommand::new("/nonexistent/migrate.sh"), &log, &[])
        .await
        .unwrap_err();

    assert!(matches!(err, hipster_core::WorkerError::Execution(_)));
}

#[test]
fn test_display_quotes_arguments() {
    let command = WatchedCommand::new("/opt/nova_mysql_migrations.sh")
        .arg("abc123")
        .arg("pass word");
    assert_eq!(command.display(), "/opt/nova_mysql_migrations.sh abc123 'pass word'");
}

#[tokio::test]
async fn test_background_process_holding_output_does_not_block() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("job.log");
    let aux = dir.path().join("syslog");

    let started = std::time::Instant::now();
    let code = watcher()
        .output_drain(Duration::from_millis(500))
        .execute(
            &WatchedCommand::shell("sleep 5 & echo started"),
            &log,
            &[WatchedLog::new("[syslog]", &aux)],
        )
        .await
        .unwrap();

    assert_eq!(code, 0);
    assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    assert_eq!(std::fs::read_to_string(&log).unwrap(), "started\n");
}
