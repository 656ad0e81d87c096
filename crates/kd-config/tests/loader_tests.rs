//! ConfigLoader tests against real files

use std::io::Write;

use kd_common::ExhaustedAction;
use kd_config::{AppConfig, ConfigError, ConfigLoader};

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_from_explicit_path() {
    let file = write_config(
        r#"
[pool]
max_active_per_key = 4
max_idle_per_key = 2
max_total = 16
exhausted_action = "fail"

[dispatcher]
http1_only = true
"#,
    );

    let config = ConfigLoader::with_path(file.path()).load().unwrap();

    assert_eq!(config.pool.max_active_per_key, 4);
    assert_eq!(config.pool.max_idle_per_key, 2);
    assert_eq!(config.pool.max_total, 16);
    assert_eq!(config.pool.exhausted_action, ExhaustedAction::Fail);
    assert!(config.dispatcher.http1_only);

    let pool = config.pool.to_pool_config();
    assert_eq!(pool.max_total, Some(16));
}

#[test]
fn test_invalid_file_is_rejected() {
    let file = write_config(
        r#"
[pool]
max_active_per_key = 2
max_idle_per_key = 5
"#,
    );

    let result = ConfigLoader::with_path(file.path()).load();
    assert!(matches!(result, Err(ConfigError::ValidationError(_))));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let file = write_config("[pool\nmax_active_per_key = ");

    let result = AppConfig::from_file(file.path());
    assert!(matches!(result, Err(ConfigError::ParseError(_))));
}

#[test]
fn test_missing_file_is_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = AppConfig::from_file(dir.path().join("absent.toml"));
    assert!(matches!(result, Err(ConfigError::ReadError(_))));
}
