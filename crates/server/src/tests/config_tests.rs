use super::{apply_env_settings, apply_file_settings, normalize_database_url, prepare_database_url, Settings};

use std::collections::HashMap;

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(
        normalize_database_url("sqlite:./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(normalize_database_url("  "), Settings::default().database_url);
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
}

#[test]
fn creates_parent_dir_for_sqlite_file() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("data").join("test.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(temp_root.path().join("data").exists());
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("chat.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );
}

#[test]
fn defaults_match_documented_values() {
    let settings = Settings::default();
    assert_eq!(settings.server_bind, "127.0.0.1:3000");
    assert_eq!(settings.session_ttl_seconds, 604_800);
    assert_eq!(settings.max_message_chars, 4000);
    assert!(settings.assistant_api_key.is_none());
}

#[test]
fn env_overrides_file_and_app_prefix_wins() {
    let mut settings = Settings::default();
    let file_cfg = HashMap::from([
        ("bind_addr".to_string(), "0.0.0.0:4000".to_string()),
        ("max_message_chars".to_string(), "200".to_string()),
    ]);
    apply_file_settings(&mut settings, &file_cfg);
    assert_eq!(settings.server_bind, "0.0.0.0:4000");
    assert_eq!(settings.max_message_chars, 200);

    let env = HashMap::from([
        ("SERVER_BIND", "127.0.0.1:5000"),
        ("APP__BIND_ADDR", "127.0.0.1:6000"),
        ("OPENROUTER_API_KEY", "sk-test"),
        ("APP__SESSION_TTL_SECONDS", "not-a-number"),
    ]);
    apply_env_settings(&mut settings, |key| env.get(key).map(|v| v.to_string()));
    assert_eq!(settings.server_bind, "127.0.0.1:6000");
    assert_eq!(settings.assistant_api_key.as_deref(), Some("sk-test"));
    assert_eq!(settings.session_ttl_seconds, 604_800);
}
