//! Settings loading
//!
//! Reads the `appsettings.json` layout used by the services this engine runs
//! in:
//!
//! ```json
//! {
//!   "DatabaseSettings": {
//!     "ConnectionStringPostgres": "host=localhost user=app password=secret dbname=poc",
//!     "ConnectionStringSQLServer": "Server=tcp:localhost,1433;User Id=sa;Password=secret;"
//!   },
//!   "Sync": { "operation_timeout_ms": 60000, "isolation_level": "read_committed" }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::connection::{ConnectionConfig, DatabaseType, IsolationLevel};
use crate::error::{Error, Result};

/// Connection strings per backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// PostgreSQL connection string
    #[serde(
        rename = "ConnectionStringPostgres",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub postgres: Option<String>,
    /// SQL Server connection string
    #[serde(
        rename = "ConnectionStringSQLServer",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sqlserver: Option<String>,
}

/// Sync tuning shared by both backends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncTuning {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Whole-operation timeout in milliseconds
    pub operation_timeout_ms: Option<u64>,
    /// Transaction isolation level
    pub isolation_level: Option<IsolationLevel>,
    /// Application name reported to the server
    pub application_name: Option<String>,
}

impl Default for SyncTuning {
    fn default() -> Self {
        let defaults = ConnectionConfig::default();
        Self {
            connect_timeout_ms: defaults.connect_timeout_ms,
            operation_timeout_ms: defaults.operation_timeout_ms,
            isolation_level: defaults.isolation_level,
            application_name: defaults.application_name,
        }
    }
}

/// Top-level settings document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Connection strings
    #[serde(rename = "DatabaseSettings", default)]
    pub database: DatabaseSettings,
    /// Tuning
    #[serde(rename = "Sync", default)]
    pub sync: SyncTuning,
}

impl SyncSettings {
    /// Parse settings from a JSON string
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(format!("invalid settings: {}", e)))
    }

    /// Load settings from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read settings {}: {}", path.display(), e))
        })?;
        tracing::debug!(path = %path.display(), "loaded sync settings");
        Self::from_json_str(&content)
    }

    /// Connection string for `database_type`, if configured
    pub fn connection_string(&self, database_type: DatabaseType) -> Option<&str> {
        let s = match database_type {
            DatabaseType::PostgreSQL => self.database.postgres.as_deref(),
            DatabaseType::SqlServer => self.database.sqlserver.as_deref(),
        }?;
        (!s.trim().is_empty()).then_some(s)
    }

    /// Build the connection configuration for `database_type`
    pub fn connection_config(&self, database_type: DatabaseType) -> Result<ConnectionConfig> {
        let connection_string = self.connection_string(database_type).ok_or_else(|| {
            Error::config(format!(
                "no connection string configured for {}",
                database_type
            ))
        })?;

        Ok(ConnectionConfig {
            connection_string: connection_string.to_string(),
            connect_timeout_ms: self.sync.connect_timeout_ms,
            operation_timeout_ms: self.sync.operation_timeout_ms,
            isolation_level: self.sync.isolation_level,
            application_name: self.sync.application_name.clone(),
        })
    }
}
