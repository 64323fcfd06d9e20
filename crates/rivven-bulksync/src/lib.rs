//! # rivven-bulksync
//!
//! Transactional bulk table synchronization for PostgreSQL and SQL Server.
//!
//! A caller hands over a table, its columns (key columns marked) and a batch
//! of rows, together with the operation to apply. The engine stages the rows
//! in a session-scoped temporary table through the backend's native bulk
//! path, then applies them to the target with one set-based statement, all
//! inside a single transaction:
//!
//! ```text
//! BEGIN
//!   CREATE staging table (target's column types)
//!   bulk load rows            -- COPY BINARY / TDS bulk insert
//!   INSERT | UPDATE | DELETE  -- one statement joined on the key columns
//! COMMIT                      -- or ROLLBACK on any failure
//! ```
//!
//! ## Features
//!
//! - **One contract, two backends**: [`TableSync`](executor::TableSync) is
//!   implemented by the same engine over PostgreSQL and SQL Server
//! - **All or nothing**: a failure at any stage rolls the whole batch back
//! - **Validated identifiers**: table, schema and column names are checked
//!   before any SQL is generated; values only travel through the bulk path
//! - **Concurrent callers**: each call uses its own connection and a uniquely
//!   named staging table
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rivven_bulksync::prelude::*;
//!
//! let settings = SyncSettings::from_file("appsettings.json")?;
//! let sync = sync_for(
//!     DatabaseType::PostgreSQL,
//!     settings.connection_config(DatabaseType::PostgreSQL)?,
//! )?;
//!
//! let request = SyncRequest::insert("customer")
//!     .key_column("ID")
//!     .column("Name")
//!     .rows([
//!         Row::default().with("ID", 1).with("Name", "John Doe"),
//!         Row::default().with("ID", 2).with("Name", "Jane Smith"),
//!     ]);
//!
//! let affected = sync.apply(&request).await?;
//! assert_eq!(affected, 2);
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL support via tokio-postgres
//! - `sqlserver` - SQL Server support via tiberius
//! - `full` - All backends (default)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod bulk;
pub mod config;
pub mod connection;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod request;
pub mod security;
pub mod staging;
pub mod types;

// Backend implementations (conditionally compiled)
#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlserver")]
pub mod sqlserver;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, Result};

    // Requests and values
    pub use crate::request::{ColumnDef, Operation, SyncRequest, TableRef};
    pub use crate::types::{Row, Value};

    // Connection traits and config
    pub use crate::bulk::BulkLoader;
    pub use crate::connection::{
        Connection, ConnectionConfig, ConnectionFactory, DatabaseType, IsolationLevel, Transaction,
    };

    // Settings
    pub use crate::config::{DatabaseSettings, SyncSettings, SyncTuning};

    // Dialect types
    pub use crate::dialect::{
        dialect_for, dialect_for_type, PostgresDialect, SqlDialect, SqlServerDialect,
    };

    // Engine
    pub use crate::executor::{
        sync_for, AtomicSyncStats, SyncEngine, SyncPlan, SyncState, SyncStats, TableSync,
    };
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use executor::{sync_for, SyncEngine, TableSync};
pub use request::{ColumnDef, Operation, SyncRequest};
pub use types::{Row, Value};
