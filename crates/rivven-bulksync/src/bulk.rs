//! Bulk loading into staging tables.
//!
//! Rows never travel as SQL literals: each backend streams them through its
//! native bulk channel (binary `COPY` on PostgreSQL, TDS bulk copy on SQL
//! Server). A loader either stages every row or fails; the caller rolls back.

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::request::{ColumnDef, TableRef};
use crate::types::{Row, Value};

/// Rows between progress events
pub const PROGRESS_INTERVAL: u64 = 10_000;

/// High-throughput load of rows into a staging table
#[async_trait]
pub trait BulkLoader: Send + Sync {
    /// Stream `rows` into `staging`, column values in `columns` order.
    ///
    /// Returns the number of rows staged. The staging table must exist and
    /// have exactly `columns`.
    async fn load(&self, staging: &TableRef, columns: &[ColumnDef], rows: &[Row]) -> Result<u64>;
}

/// Values of `row` in `columns` order.
///
/// Fails with a type conversion error if a column is missing; validated
/// requests never hit that path.
pub fn ordered_values<'a>(row: &'a Row, columns: &[ColumnDef]) -> Result<Vec<&'a Value>> {
    columns
        .iter()
        .map(|c| {
            row.get(&c.name).ok_or_else(|| {
                Error::type_conversion(format!("row has no value for column '{}'", c.name))
            })
        })
        .collect()
}
