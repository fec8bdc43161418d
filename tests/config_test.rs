use std::path::PathBuf;
use std::time::Duration;

use rowq::config::Config;
use rowq::{Database, Error, Queue};

#[test]
fn toml_config_fills_in_defaults() {
    let config = Config::from_toml_str(
        r#"
        database_path = "/var/lib/rowq/jobs.db"
        batch_limit = 25
        "#,
    )
    .unwrap();

    assert_eq!(config.database_path, Some(PathBuf::from("/var/lib/rowq/jobs.db")));
    assert_eq!(config.batch_limit, 25);
    assert_eq!(config.tick_interval_ms, 100);
    assert!(config.commit_hook);
    assert_eq!(config.log_level, "info");

    let queue_config = config.queue_config();
    assert_eq!(
        queue_config.database,
        Database::File(PathBuf::from("/var/lib/rowq/jobs.db"))
    );
    assert_eq!(queue_config.scheduler.tick_interval, Duration::from_millis(100));
}

#[test]
fn toml_config_rejects_unknown_keys_and_zero_ticks() {
    assert!(matches!(
        Config::from_toml_str("batch_size = 5"),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        Config::from_toml_str("tick_interval_ms = 0"),
        Err(Error::Config(_))
    ));
}

#[test]
fn config_loads_from_file_and_opens_a_queue() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("jobs.db");
    let config_path = dir.path().join("rowq.toml");
    std::fs::write(
        &config_path,
        format!(
            "database_path = {:?}\ncommit_hook = false\ntick_interval_ms = 50\n",
            db_path.display().to_string()
        ),
    )
    .unwrap();

    let config = Config::load(&config_path).unwrap();
    assert!(!config.commit_hook);

    let queue = Queue::open(config.queue_config()).unwrap();
    let id = queue
        .send_json("Anything", &serde_json::json!({"n": 1}))
        .unwrap();
    assert_eq!(queue.get(id).unwrap().job_type, "Anything");
    queue.close().unwrap();
    assert!(db_path.exists());
}

#[test]
fn missing_config_file_is_an_io_error() {
    let err = Config::load("/definitely/not/here/rowq.toml").unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}
