//! Settings loading tests

use std::io::Write;

use rivven_bulksync::config::SyncSettings;
use rivven_bulksync::connection::{DatabaseType, IsolationLevel};
use rivven_bulksync::error::ErrorCategory;

const APPSETTINGS: &str = r#"{
    "Logging": { "LogLevel": { "Default": "Information" } },
    "DatabaseSettings": {
        "ConnectionStringPostgres": "host=localhost user=app password=secret dbname=poc",
        "ConnectionStringSQLServer": "Server=tcp:localhost,1433;User Id=sa;Password=secret;TrustServerCertificate=true"
    },
    "Sync": {
        "operation_timeout_ms": 60000,
        "isolation_level": "read_committed"
    }
}"#;

#[test]
fn test_from_file() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(APPSETTINGS.as_bytes())?;

    let settings = SyncSettings::from_file(file.path())?;
    assert_eq!(
        settings.connection_string(DatabaseType::PostgreSQL),
        Some("host=localhost user=app password=secret dbname=poc")
    );
    assert!(settings
        .connection_string(DatabaseType::SqlServer)
        .is_some_and(|s| s.starts_with("Server=tcp:localhost")));
    Ok(())
}

#[test]
fn test_connection_config_carries_tuning() -> anyhow::Result<()> {
    let settings = SyncSettings::from_json_str(APPSETTINGS)?;
    let config = settings.connection_config(DatabaseType::SqlServer)?;

    assert_eq!(config.operation_timeout_ms, Some(60_000));
    assert_eq!(config.isolation_level, Some(IsolationLevel::ReadCommitted));
    // unset values keep their defaults
    assert_eq!(config.connect_timeout_ms, 10_000);
    assert_eq!(config.application_name.as_deref(), Some("rivven-bulksync"));

    // Debug output never shows the password
    let debug = format!("{:?}", config);
    assert!(!debug.contains("secret"));
    Ok(())
}

#[test]
fn test_missing_connection_string() {
    let settings = SyncSettings::from_json_str(r#"{"DatabaseSettings": {}}"#).unwrap();

    let err = settings
        .connection_config(DatabaseType::PostgreSQL)
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert!(err.to_string().contains("PostgreSQL"));
}

#[test]
fn test_empty_document_uses_defaults() {
    let settings = SyncSettings::from_json_str("{}").unwrap();
    assert_eq!(settings.sync.connect_timeout_ms, 10_000);
    assert_eq!(settings.sync.operation_timeout_ms, None);
    assert_eq!(settings.connection_string(DatabaseType::SqlServer), None);
}

#[test]
fn test_invalid_json() {
    let err = SyncSettings::from_json_str("{ not json").unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);

    let err = SyncSettings::from_json_str(r#"{"Sync": {"isolation_level": "chaos"}}"#)
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = SyncSettings::from_file(dir.path().join("appsettings.json")).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}
