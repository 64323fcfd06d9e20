//! SQL Server backend implementation for rivven-bulksync
//!
//! Provides Microsoft SQL Server-specific implementations:
//! - Connection and transaction over tiberius (ADO.NET connection strings)
//! - TDS bulk copy into `#` staging tables
//! - Value coercion against the staging table's column types
//!
//! Statements that create session objects or control the transaction run as
//! plain batches (`simple_query`). `execute` goes through `sp_executesql`,
//! whose scope drops a `#temp` table and reverts `SET` options on return.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tiberius::numeric::Numeric;
use tiberius::{Client, ColumnData, Config, IntoSql, TokenRow};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::bulk::{ordered_values, BulkLoader, PROGRESS_INTERVAL};
use crate::connection::{
    Connection, ConnectionConfig, ConnectionFactory, DatabaseType, IsolationLevel, Transaction,
};
use crate::error::{Error, Result};
use crate::request::{ColumnDef, TableRef};
use crate::security::escape_string_literal;
use crate::types::{Row, Value};

type TdsClient = Client<Compat<TcpStream>>;

/// Column of a staging table as reported by `tempdb.sys.columns`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingColumnType {
    /// Column name
    pub name: String,
    /// System type name (`int`, `nvarchar`, `decimal`, ...)
    pub type_name: String,
    /// Numeric scale (0 for non-numeric types)
    pub scale: u8,
}

impl StagingColumnType {
    /// Create a column type
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, scale: u8) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            scale,
        }
    }
}

fn staging_columns_sql(staging: &TableRef) -> String {
    format!(
        "SELECT c.name, t.name, CAST(c.scale AS INT) \
         FROM tempdb.sys.columns AS c \
         JOIN tempdb.sys.types AS t ON t.user_type_id = c.system_type_id \
         WHERE c.object_id = OBJECT_ID(N'tempdb..{}') \
         ORDER BY c.column_id",
        escape_string_literal(&staging.name)
    )
}

fn unsupported_type(column: &StagingColumnType) -> Error {
    Error::unsupported(format!(
        "SQL Server column type {} is not supported for bulk load",
        column.type_name
    ))
}

/// Typed NULL for a column
fn null_for(column: &StagingColumnType) -> Result<ColumnData<'static>> {
    let data = match column.type_name.as_str() {
        "bit" => ColumnData::Bit(None),
        "tinyint" => ColumnData::U8(None),
        "smallint" => ColumnData::I16(None),
        "int" => ColumnData::I32(None),
        "bigint" => ColumnData::I64(None),
        "real" => ColumnData::F32(None),
        "float" => ColumnData::F64(None),
        "decimal" | "numeric" => ColumnData::Numeric(None),
        "char" | "varchar" | "nchar" | "nvarchar" | "text" | "ntext" => ColumnData::String(None),
        "binary" | "varbinary" | "image" => ColumnData::Binary(None),
        "uniqueidentifier" => ColumnData::Guid(None),
        "date" => ColumnData::Date(None),
        "time" => ColumnData::Time(None),
        "datetime2" => ColumnData::DateTime2(None),
        "datetimeoffset" => ColumnData::DateTimeOffset(None),
        "datetime" => ColumnData::DateTime(None),
        "smalldatetime" => ColumnData::SmallDateTime(None),
        _ => return Err(unsupported_type(column)),
    };
    Ok(data)
}

/// Convert a rivven Value to TDS data for `column`
fn value_to_tds(value: &Value, column: &StagingColumnType) -> Result<ColumnData<'static>> {
    if value.is_null() {
        return null_for(column);
    }

    let data = match column.type_name.as_str() {
        "bit" => value.as_bool().map(|b| ColumnData::Bit(Some(b))),
        "tinyint" => narrow::<u8>(value, column)?.map(|n| ColumnData::U8(Some(n))),
        "smallint" => narrow::<i16>(value, column)?.map(|n| ColumnData::I16(Some(n))),
        "int" => narrow::<i32>(value, column)?.map(|n| ColumnData::I32(Some(n))),
        "bigint" => value.as_i64().map(|n| ColumnData::I64(Some(n))),
        "real" => value.as_f64().map(|n| ColumnData::F32(Some(n as f32))),
        "float" => value.as_f64().map(|n| ColumnData::F64(Some(n))),
        "decimal" | "numeric" => value
            .as_decimal()
            .map(|d| ColumnData::Numeric(Some(to_numeric(d, column.scale)))),
        "char" | "varchar" | "nchar" | "nvarchar" | "text" | "ntext" => value
            .as_str()
            .map(|s| ColumnData::String(Some(Cow::Owned(s.to_string())))),
        "binary" | "varbinary" | "image" => value
            .as_bytes()
            .map(|b| ColumnData::Binary(Some(Cow::Owned(b.to_vec())))),
        "uniqueidentifier" => value.as_uuid().map(|u| ColumnData::Guid(Some(u))),
        "date" => match value {
            Value::Date(d) => Some((*d).into_sql()),
            _ => None,
        },
        "time" => match value {
            Value::Time(t) => Some((*t).into_sql()),
            _ => None,
        },
        "datetime2" => value.as_naive_datetime().map(|dt| dt.into_sql()),
        "datetimeoffset" => value.as_datetime_utc().map(|dt| dt.into_sql()),
        "datetime" => value
            .as_naive_datetime()
            .map(legacy_datetime)
            .transpose()?,
        "smalldatetime" => value
            .as_naive_datetime()
            .map(legacy_small_datetime)
            .transpose()?,
        _ => return Err(unsupported_type(column)),
    };

    data.ok_or_else(|| {
        Error::type_conversion(format!(
            "cannot store {} in {}",
            value.sql_type(),
            column.type_name
        ))
    })
}

fn narrow<T: TryFrom<i64>>(value: &Value, column: &StagingColumnType) -> Result<Option<T>> {
    match value.as_i64() {
        Some(n) => T::try_from(n).map(Some).map_err(|_| {
            Error::type_conversion(format!("{} out of range for {}", n, column.type_name))
        }),
        None => Ok(None),
    }
}

fn to_numeric(mut d: rust_decimal::Decimal, scale: u8) -> Numeric {
    d.rescale(u32::from(scale));
    Numeric::new_with_scale(d.mantissa(), scale)
}

fn sql_epoch() -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(1900, 1, 1)
        .ok_or_else(|| Error::type_conversion("invalid datetime epoch"))
}

/// `datetime`: days since 1900-01-01 and 1/300 s ticks since midnight
fn legacy_datetime(dt: NaiveDateTime) -> Result<ColumnData<'static>> {
    let mut days = (dt.date() - sql_epoch()?).num_days();
    let time = dt.time();
    let nanos = u64::from(time.num_seconds_from_midnight()) * 1_000_000_000
        + u64::from(time.nanosecond() % 1_000_000_000);
    let mut fragments = (nanos * 300 + 500_000_000) / 1_000_000_000;
    if fragments >= 300 * 86_400 {
        days += 1;
        fragments = 0;
    }

    let days = i32::try_from(days)
        .map_err(|_| Error::type_conversion(format!("{} out of range for datetime", dt)))?;
    Ok(ColumnData::DateTime(Some(tiberius::time::DateTime::new(
        days,
        fragments as u32,
    ))))
}

/// `smalldatetime`: days since 1900-01-01 and minutes since midnight
fn legacy_small_datetime(dt: NaiveDateTime) -> Result<ColumnData<'static>> {
    let mut days = (dt.date() - sql_epoch()?).num_days();
    let mut minutes = (dt.time().num_seconds_from_midnight() + 30) / 60;
    if minutes >= 1_440 {
        days += 1;
        minutes = 0;
    }

    let days = u16::try_from(days)
        .map_err(|_| Error::type_conversion(format!("{} out of range for smalldatetime", dt)))?;
    Ok(ColumnData::SmallDateTime(Some(
        tiberius::time::SmallDateTime::new(days, minutes as u16),
    )))
}

fn build_token_row(
    idx: usize,
    row: &Row,
    columns: &[ColumnDef],
    types: &[StagingColumnType],
) -> Result<TokenRow<'static>> {
    let values = ordered_values(row, columns)?;
    let mut token_row = TokenRow::new();
    for (value, column) in values.into_iter().zip(types) {
        let data = value_to_tds(value, column).map_err(|e| {
            Error::type_conversion(format!("row {}, column '{}': {}", idx, column.name, e))
        })?;
        token_row.push(data);
    }
    Ok(token_row)
}

/// Run `sql` as a plain batch in the session scope
async fn run_batch(client: &mut TdsClient, sql: &str) -> Result<()> {
    client
        .simple_query(sql)
        .await
        .map_err(|e| Error::query_with_source(sql, e))?
        .into_results()
        .await
        .map_err(|e| Error::query_with_source(sql, e))?;
    Ok(())
}

async fn run_execute(client: &mut TdsClient, sql: &str) -> Result<u64> {
    let result = client
        .execute(sql, &[])
        .await
        .map_err(|e| Error::query_with_source(sql, e))?;
    Ok(result.total())
}

async fn staging_column_types(
    client: &mut TdsClient,
    staging: &TableRef,
) -> Result<Vec<StagingColumnType>> {
    let sql = staging_columns_sql(staging);
    let rows = client
        .simple_query(&sql)
        .await
        .map_err(|e| Error::query_with_source(&sql, e))?
        .into_first_result()
        .await
        .map_err(|e| Error::query_with_source(&sql, e))?;

    rows.iter()
        .map(|row| {
            let name = row
                .try_get::<&str, _>(0)
                .map_err(|e| Error::query_with_source(&sql, e))?;
            let type_name = row
                .try_get::<&str, _>(1)
                .map_err(|e| Error::query_with_source(&sql, e))?;
            let scale = row
                .try_get::<i32, _>(2)
                .map_err(|e| Error::query_with_source(&sql, e))?
                .unwrap_or(0);

            match (name, type_name) {
                (Some(name), Some(type_name)) => Ok(StagingColumnType::new(
                    name,
                    type_name,
                    u8::try_from(scale).unwrap_or(0),
                )),
                _ => Err(Error::query_with_sql("incomplete column metadata", &sql)),
            }
        })
        .collect()
}

fn transaction_error(context: &str, e: Error) -> Error {
    let message = format!("{}: {}", context, e);
    Error::transaction_with_source(message, e)
}

/// SQL Server connection
pub struct SqlServerConnection {
    client: Arc<Mutex<TdsClient>>,
    closed: AtomicBool,
}

impl SqlServerConnection {
    /// Wrap an authenticated tiberius client
    pub fn new(client: TdsClient) -> Self {
        Self {
            client: Arc::new(Mutex::new(client)),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }

    async fn begin_with(&self, sql: &str) -> Result<Box<dyn Transaction>> {
        self.ensure_open()?;
        {
            let mut client = self.client.lock().await;
            run_batch(&mut client, sql)
                .await
                .map_err(|e| transaction_error("failed to begin transaction", e))?;
        }

        Ok(Box::new(SqlServerTransaction {
            client: Arc::clone(&self.client),
        }))
    }
}

#[async_trait]
impl Connection for SqlServerConnection {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.begin_with("BEGIN TRANSACTION").await
    }

    /// SQL Server requires SET TRANSACTION ISOLATION LEVEL *before*
    /// BEGIN TRANSACTION, in the same session scope.
    async fn begin_with_isolation(
        &self,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn Transaction>> {
        self.begin_with(&format!(
            "SET TRANSACTION ISOLATION LEVEL {}; BEGIN TRANSACTION",
            isolation.to_sql()
        ))
        .await
    }

    async fn is_valid(&self) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        let mut client = self.client.lock().await;
        run_batch(&mut client, "SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// SQL Server transaction
pub struct SqlServerTransaction {
    client: Arc<Mutex<TdsClient>>,
}

#[async_trait]
impl BulkLoader for SqlServerTransaction {
    async fn load(&self, staging: &TableRef, columns: &[ColumnDef], rows: &[Row]) -> Result<u64> {
        let mut client = self.client.lock().await;

        let types = staging_column_types(&mut client, staging).await?;
        let matches = types.len() == columns.len()
            && types.iter().zip(columns).all(|(t, c)| t.name == c.name);
        if !matches {
            return Err(Error::query(format!(
                "staging table {} does not have the requested columns",
                staging
            )));
        }

        let bulk_sql = format!("INSERT BULK {}", staging.name);
        let mut req = client
            .bulk_insert(&staging.name)
            .await
            .map_err(|e| Error::query_with_source(&bulk_sql, e))?;

        let mut staged: u64 = 0;
        for (idx, row) in rows.iter().enumerate() {
            let token_row = match build_token_row(idx, row, columns, &types) {
                Ok(token_row) => token_row,
                Err(e) => {
                    // close the bulk stream so the session can still roll back
                    if let Err(finalize) = req.finalize().await {
                        tracing::debug!(staging = %staging, error = %finalize, "finalize after failed row");
                    }
                    return Err(e);
                }
            };
            req.send(token_row)
                .await
                .map_err(|e| Error::query_with_source(&bulk_sql, e))?;

            staged += 1;
            if staged % PROGRESS_INTERVAL == 0 {
                tracing::trace!(staging = %staging, rows = staged, "bulk load progress");
            }
        }

        let result = req
            .finalize()
            .await
            .map_err(|e| Error::query_with_source(&bulk_sql, e))?;
        Ok(result.total())
    }
}

#[async_trait]
impl Transaction for SqlServerTransaction {
    async fn execute(&self, sql: &str) -> Result<u64> {
        let mut client = self.client.lock().await;
        run_execute(&mut client, sql).await
    }

    async fn execute_batch(&self, sql: &str) -> Result<()> {
        let mut client = self.client.lock().await;
        run_batch(&mut client, sql).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut client = self.client.lock().await;
        run_batch(&mut client, "COMMIT TRANSACTION")
            .await
            .map_err(|e| transaction_error("failed to commit", e))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut client = self.client.lock().await;
        // severe errors abort the transaction server-side already
        run_batch(&mut client, "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION")
            .await
            .map_err(|e| transaction_error("failed to rollback", e))
    }
}

/// SQL Server connection factory
#[derive(Debug, Clone, Default)]
pub struct SqlServerConnectionFactory;

impl SqlServerConnectionFactory {
    fn tds_config(config: &ConnectionConfig) -> Result<Config> {
        let mut tds = Config::from_ado_string(&config.connection_string).map_err(|e| {
            Error::config(format!("invalid SQL Server connection string: {}", e))
        })?;

        let explicit_name = config
            .connection_string
            .to_ascii_lowercase()
            .contains("application name");
        if !explicit_name {
            if let Some(name) = &config.application_name {
                tds.application_name(name);
            }
        }
        Ok(tds)
    }
}

#[async_trait]
impl ConnectionFactory for SqlServerConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let tds = Self::tds_config(config)?;

        let connect = async move {
            let tcp = TcpStream::connect(tds.get_addr())
                .await
                .map_err(|e| Error::connection_with_source("failed to connect", e))?;
            tcp.set_nodelay(true).ok();

            Client::connect(tds, tcp.compat_write())
                .await
                .map_err(|e| Error::connection_with_source("failed to authenticate", e))
        };

        let client = if config.connect_timeout_ms > 0 {
            tokio::time::timeout(Duration::from_millis(config.connect_timeout_ms), connect)
                .await
                .map_err(|_| {
                    Error::timeout(format!(
                        "connect did not finish within {}ms",
                        config.connect_timeout_ms
                    ))
                })??
        } else {
            connect.await?
        };

        Ok(Box::new(SqlServerConnection::new(client)))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::SqlServer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use rust_decimal::Decimal;

    fn col(type_name: &str) -> StagingColumnType {
        StagingColumnType::new("c", type_name, 0)
    }

    #[test]
    fn test_staging_columns_sql() {
        let sql = staging_columns_sql(&TableRef::new("#customer__1_0"));
        assert!(sql.contains("OBJECT_ID(N'tempdb..#customer__1_0')"));
        assert!(sql.contains("ORDER BY c.column_id"));

        let sql = staging_columns_sql(&TableRef::new("#o'brien"));
        assert!(sql.contains("tempdb..#o''brien"));
    }

    #[test]
    fn test_integer_coercion() {
        assert!(matches!(
            value_to_tds(&Value::Int64(42), &col("int")).unwrap(),
            ColumnData::I32(Some(42))
        ));
        assert!(matches!(
            value_to_tds(&Value::Int32(200), &col("tinyint")).unwrap(),
            ColumnData::U8(Some(200))
        ));

        let err = value_to_tds(&Value::Int32(-1), &col("tinyint")).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::TypeConversion);
        let err = value_to_tds(&Value::String("1".into()), &col("bigint")).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::TypeConversion);
    }

    #[test]
    fn test_typed_nulls() {
        assert!(matches!(
            value_to_tds(&Value::Null, &col("nvarchar")).unwrap(),
            ColumnData::String(None)
        ));
        assert!(matches!(
            value_to_tds(&Value::Null, &col("int")).unwrap(),
            ColumnData::I32(None)
        ));
        let err = value_to_tds(&Value::Null, &col("geography")).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Other);
    }

    #[test]
    fn test_decimal_rescaled_to_column() {
        let column = StagingColumnType::new("price", "decimal", 4);
        let data = value_to_tds(&Value::Decimal(Decimal::new(1234, 2)), &column).unwrap();
        assert!(matches!(
            data,
            ColumnData::Numeric(Some(n)) if n == Numeric::new_with_scale(123_400, 4)
        ));
    }

    #[test]
    fn test_legacy_datetime() {
        let noon = NaiveDate::from_ymd_opt(1900, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let data = legacy_datetime(noon).unwrap();
        assert!(matches!(
            data,
            ColumnData::DateTime(Some(dt)) if dt == tiberius::time::DateTime::new(0, 12_960_000)
        ));

        let next_day = NaiveDate::from_ymd_opt(1900, 1, 2)
            .unwrap()
            .and_hms_opt(0, 1, 0)
            .unwrap();
        let data = legacy_small_datetime(next_day).unwrap();
        assert!(matches!(
            data,
            ColumnData::SmallDateTime(Some(dt)) if dt == tiberius::time::SmallDateTime::new(1, 1)
        ));
    }

    #[test]
    fn test_tds_config_rejects_garbage() {
        let config = ConnectionConfig::new("Server=tcp:localhost,notaport;User Id=sa;");
        let err = SqlServerConnectionFactory::tds_config(&config).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }
}
