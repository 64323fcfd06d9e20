//! PostgreSQL backend implementation for rivven-bulksync
//!
//! Provides PostgreSQL-specific implementations:
//! - Connection and transaction over tokio-postgres
//! - Binary `COPY ... FROM STDIN` bulk loading into staging tables
//! - Value coercion against the staging table's column types

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::types::{ToSql, Type};

use crate::bulk::{ordered_values, BulkLoader, PROGRESS_INTERVAL};
use crate::connection::{
    Connection, ConnectionConfig, ConnectionFactory, DatabaseType, IsolationLevel, Transaction,
};
use crate::dialect::{PostgresDialect, SqlDialect};
use crate::error::{Error, Result};
use crate::request::{ColumnDef, TableRef};
use crate::types::{Row, Value};

type PgParam = Box<dyn ToSql + Sync + Send>;

/// Convert a rivven Value to a parameter of PostgreSQL type `ty`.
///
/// NULLs are typed so the binary encoder accepts them for the column.
fn value_to_pg(value: &Value, ty: &Type) -> Result<PgParam> {
    if value.is_null() {
        return typed_null(ty);
    }

    let converted: Option<PgParam> = match *ty {
        Type::BOOL => value.as_bool().map(|b| Box::new(b) as PgParam),
        Type::INT2 => narrow::<i16>(value, ty)?.map(|n| Box::new(n) as PgParam),
        Type::INT4 => narrow::<i32>(value, ty)?.map(|n| Box::new(n) as PgParam),
        Type::INT8 => value.as_i64().map(|n| Box::new(n) as PgParam),
        Type::FLOAT4 => value.as_f64().map(|n| Box::new(n as f32) as PgParam),
        Type::FLOAT8 => value.as_f64().map(|n| Box::new(n) as PgParam),
        Type::NUMERIC => value.as_decimal().map(|d| Box::new(d) as PgParam),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            value.as_str().map(|s| Box::new(s.to_string()) as PgParam)
        }
        Type::BYTEA => value.as_bytes().map(|b| Box::new(b.to_vec()) as PgParam),
        Type::DATE => match value {
            Value::Date(d) => Some(Box::new(*d) as PgParam),
            _ => None,
        },
        Type::TIME => match value {
            Value::Time(t) => Some(Box::new(*t) as PgParam),
            _ => None,
        },
        Type::TIMESTAMP => value.as_naive_datetime().map(|dt| Box::new(dt) as PgParam),
        Type::TIMESTAMPTZ => value.as_datetime_utc().map(|dt| Box::new(dt) as PgParam),
        Type::UUID => value.as_uuid().map(|u| Box::new(u) as PgParam),
        Type::JSON | Type::JSONB => match value {
            Value::Json(j) => Some(Box::new(j.clone()) as PgParam),
            _ => None,
        },
        _ => {
            return Err(Error::unsupported(format!(
                "PostgreSQL column type {} is not supported for bulk load",
                ty
            )))
        }
    };

    converted.ok_or_else(|| {
        Error::type_conversion(format!("cannot store {} in {}", value.sql_type(), ty))
    })
}

fn narrow<T: TryFrom<i64>>(value: &Value, ty: &Type) -> Result<Option<T>> {
    match value.as_i64() {
        Some(n) => T::try_from(n)
            .map(Some)
            .map_err(|_| Error::type_conversion(format!("{} out of range for {}", n, ty))),
        None => Ok(None),
    }
}

fn typed_null(ty: &Type) -> Result<PgParam> {
    let null: PgParam = match *ty {
        Type::BOOL => Box::new(Option::<bool>::None),
        Type::INT2 => Box::new(Option::<i16>::None),
        Type::INT4 => Box::new(Option::<i32>::None),
        Type::INT8 => Box::new(Option::<i64>::None),
        Type::FLOAT4 => Box::new(Option::<f32>::None),
        Type::FLOAT8 => Box::new(Option::<f64>::None),
        Type::NUMERIC => Box::new(Option::<rust_decimal::Decimal>::None),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => Box::new(Option::<String>::None),
        Type::BYTEA => Box::new(Option::<Vec<u8>>::None),
        Type::DATE => Box::new(Option::<chrono::NaiveDate>::None),
        Type::TIME => Box::new(Option::<chrono::NaiveTime>::None),
        Type::TIMESTAMP => Box::new(Option::<chrono::NaiveDateTime>::None),
        Type::TIMESTAMPTZ => Box::new(Option::<chrono::DateTime<chrono::Utc>>::None),
        Type::UUID => Box::new(Option::<uuid::Uuid>::None),
        Type::JSON | Type::JSONB => Box::new(Option::<serde_json::Value>::None),
        _ => {
            return Err(Error::unsupported(format!(
                "PostgreSQL column type {} is not supported for bulk load",
                ty
            )))
        }
    };
    Ok(null)
}

/// Server-reported text for `e`; the driver's `Display` is only "db error"
fn pg_message(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => format!("{} (SQLSTATE {})", db.message(), db.code().code()),
        None => e.to_string(),
    }
}

fn query_error(sql: &str, e: tokio_postgres::Error) -> Error {
    Error::Query {
        message: pg_message(&e),
        sql: Some(sql.to_string()),
        source: Some(Box::new(e)),
    }
}

fn transaction_error(e: tokio_postgres::Error) -> Error {
    Error::Transaction {
        message: pg_message(&e),
        source: Some(Box::new(e)),
    }
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    client: Arc<tokio_postgres::Client>,
    closed: AtomicBool,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client: Arc::new(client),
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
        self.client
            .batch_execute(sql)
            .await
            .map_err(transaction_error)?;

        Ok(Box::new(PgTransaction {
            client: Arc::clone(&self.client),
        }))
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.begin_with("BEGIN").await
    }

    async fn begin_with_isolation(
        &self,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn Transaction>> {
        if isolation == IsolationLevel::Snapshot {
            return Err(Error::unsupported(
                "SNAPSHOT isolation is not available on PostgreSQL",
            ));
        }
        // SET TRANSACTION outside a transaction block is a no-op here
        self.begin_with(&format!("BEGIN ISOLATION LEVEL {}", isolation.to_sql()))
            .await
    }

    async fn is_valid(&self) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// PostgreSQL transaction
pub struct PgTransaction {
    client: Arc<tokio_postgres::Client>,
}

#[async_trait]
impl BulkLoader for PgTransaction {
    async fn load(&self, staging: &TableRef, columns: &[ColumnDef], rows: &[Row]) -> Result<u64> {
        let dialect = PostgresDialect;
        let table = dialect.qualified_table(staging);
        let column_list = dialect.column_list(columns);

        // binary COPY needs the exact column types; the staging table has them
        let shape = format!("SELECT {} FROM {}", column_list, table);
        let statement = self
            .client
            .prepare(&shape)
            .await
            .map_err(|e| query_error(&shape, e))?;
        let types: Vec<Type> = statement
            .columns()
            .iter()
            .map(|c| c.type_().clone())
            .collect();

        let copy_sql = format!(
            "COPY {} ({}) FROM STDIN (FORMAT BINARY)",
            table, column_list
        );
        let sink = self
            .client
            .copy_in(&copy_sql)
            .await
            .map_err(|e| query_error(&copy_sql, e))?;

        let writer = BinaryCopyInWriter::new(sink, &types);
        futures::pin_mut!(writer);

        let mut staged: u64 = 0;
        for (idx, row) in rows.iter().enumerate() {
            let values = ordered_values(row, columns)?;
            let params = values
                .iter()
                .zip(&types)
                .zip(columns)
                .map(|((value, ty), column)| {
                    value_to_pg(value, ty).map_err(|e| {
                        Error::type_conversion(format!(
                            "row {}, column '{}': {}",
                            idx, column.name, e
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let refs: Vec<&(dyn ToSql + Sync)> = params
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();

            writer
                .as_mut()
                .write(&refs)
                .await
                .map_err(|e| query_error(&copy_sql, e))?;

            staged += 1;
            if staged % PROGRESS_INTERVAL == 0 {
                tracing::trace!(staging = %staging, rows = staged, "bulk load progress");
            }
        }

        writer
            .finish()
            .await
            .map_err(|e| query_error(&copy_sql, e))
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn execute(&self, sql: &str) -> Result<u64> {
        self.client
            .execute(sql, &[])
            .await
            .map_err(|e| query_error(sql, e))
    }

    async fn execute_batch(&self, sql: &str) -> Result<()> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| query_error(sql, e))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.client
            .batch_execute("COMMIT")
            .await
            .map_err(transaction_error)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.client
            .batch_execute("ROLLBACK")
            .await
            .map_err(transaction_error)
    }
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

impl PgConnectionFactory {
    fn pg_config(config: &ConnectionConfig) -> Result<tokio_postgres::Config> {
        let mut pg: tokio_postgres::Config = config
            .connection_string
            .parse()
            .map_err(|e| Error::config(format!("invalid PostgreSQL connection string: {}", e)))?;

        if pg.get_application_name().is_none() {
            if let Some(name) = &config.application_name {
                pg.application_name(name);
            }
        }
        if pg.get_connect_timeout().is_none() && config.connect_timeout_ms > 0 {
            pg.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        }
        Ok(pg)
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let pg = Self::pg_config(config)?;
        let (client, connection) = pg
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| {
                Error::connection_with_source(format!("failed to connect: {}", pg_message(&e)), e)
            })?;

        // Ends when the client is dropped
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("PostgreSQL connection error: {}", e);
            }
        });

        Ok(Box::new(PgConnection::new(client)))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }
}
