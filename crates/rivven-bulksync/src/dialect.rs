//! SQL dialect abstraction for rivven-bulksync
//!
//! Generates the statements of one sync: staging table DDL, the optional
//! staging cleanup, and the set-based merge (insert, correlated update,
//! correlated delete). Generation is pure and deterministic; nothing here
//! talks to a database.
//!
//! PostgreSQL uses sea-query where it has coverage (SELECT, INSERT ... SELECT).
//! SQL Server has no sea-query backend and is built by hand.
//!
//! Names resolve the way each server resolves them when written plainly:
//! PostgreSQL folds plain identifiers to lower case, SQL Server compares them
//! with the database collation.

use sea_query::{Alias, IntoIden, PostgresQueryBuilder, Query};
use std::borrow::Cow;

use crate::connection::DatabaseType;
use crate::error::{Error, Result};
use crate::request::{ColumnDef, Operation, TableRef};
use crate::staging::staging_name;

// ---------------------------------------------------------------------------
// Helper: build a sea-query TableRef from optional schema + table name
// ---------------------------------------------------------------------------

fn sea_table_ref(table: &TableRef) -> sea_query::TableRef {
    match &table.schema {
        Some(s) => sea_query::TableRef::SchemaTable(
            pg_alias(s).into_iden(),
            pg_alias(&table.name).into_iden(),
        ),
        None => sea_query::TableRef::Table(pg_alias(&table.name).into_iden()),
    }
}

fn pg_alias(name: &str) -> Alias {
    Alias::new(fold_pg_identifier(name).into_owned())
}

/// Resolve `name` the way PostgreSQL resolves it unquoted.
///
/// Plain names (`[A-Za-z_][A-Za-z0-9_]*`) fold to lower case, so `ID` finds a
/// column declared as `ID` or `id` in ordinary DDL. Any other name is taken
/// exactly as given.
///
/// ```
/// use rivven_bulksync::dialect::fold_pg_identifier;
///
/// assert_eq!(fold_pg_identifier("ID"), "id");
/// assert_eq!(fold_pg_identifier("Order Details"), "Order Details");
/// ```
pub fn fold_pg_identifier(name: &str) -> Cow<'_, str> {
    let mut chars = name.chars();
    let plain = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if plain && name.bytes().any(|b| b.is_ascii_uppercase()) {
        Cow::Owned(name.to_ascii_lowercase())
    } else {
        Cow::Borrowed(name)
    }
}

fn key_columns<'a>(table: &TableRef, columns: &'a [ColumnDef]) -> Result<Vec<&'a str>> {
    let keys: Vec<&str> = columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| c.name.as_str())
        .collect();
    if keys.is_empty() {
        return Err(Error::validation(format!(
            "{}: correlated statement requires at least one primary key column",
            table
        )));
    }
    Ok(keys)
}

fn value_columns<'a>(table: &TableRef, columns: &'a [ColumnDef]) -> Result<Vec<&'a str>> {
    let values: Vec<&str> = columns
        .iter()
        .filter(|c| !c.primary_key)
        .map(|c| c.name.as_str())
        .collect();
    if values.is_empty() {
        return Err(Error::validation(format!(
            "{}: update requires at least one non-key column",
            table
        )));
    }
    Ok(values)
}

/// SQL dialect for vendor-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Backend this dialect generates SQL for
    fn database_type(&self) -> DatabaseType;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Longest identifier the backend accepts for a staging table, in bytes
    fn max_identifier_length(&self) -> usize;

    /// Quote a possibly schema-qualified table
    fn qualified_table(&self, table: &TableRef) -> String {
        match &table.schema {
            Some(s) => format!(
                "{}.{}",
                self.quote_identifier(s),
                self.quote_identifier(&table.name)
            ),
            None => self.quote_identifier(&table.name),
        }
    }

    /// Staging table for `target` with the given uniqueness token
    fn staging_table(&self, target: &TableRef, token: &str) -> TableRef;

    /// Create an empty staging table with exactly `columns`, typed like the target
    fn staging_ddl_sql(&self, target: &TableRef, staging: &TableRef, columns: &[ColumnDef])
        -> String;

    /// Statement that drops the staging table before commit, if the backend
    /// does not tie it to the transaction
    fn staging_cleanup_sql(&self, staging: &TableRef) -> Option<String>;

    /// Insert every staged row into the target
    fn insert_sql(
        &self,
        target: &TableRef,
        staging: &TableRef,
        columns: &[ColumnDef],
    ) -> Result<String>;

    /// Overwrite non-key columns of target rows matching a staged row on all keys
    fn update_sql(
        &self,
        target: &TableRef,
        staging: &TableRef,
        columns: &[ColumnDef],
    ) -> Result<String>;

    /// Delete target rows matching a staged row on all keys
    fn delete_sql(
        &self,
        target: &TableRef,
        staging: &TableRef,
        columns: &[ColumnDef],
    ) -> Result<String>;

    /// Merge statement for `operation`
    fn merge_sql(
        &self,
        operation: Operation,
        target: &TableRef,
        staging: &TableRef,
        columns: &[ColumnDef],
    ) -> Result<String> {
        match operation {
            Operation::Insert => self.insert_sql(target, staging, columns),
            Operation::Update => self.update_sql(target, staging, columns),
            Operation::Delete => self.delete_sql(target, staging, columns),
        }
    }

    /// Comma-separated quoted column list in declaration order
    fn column_list(&self, columns: &[ColumnDef]) -> String {
        columns
            .iter()
            .map(|c| self.quote_identifier(&c.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `t.k1 = s.k1 AND t.k2 = s.k2` over the key columns
    fn key_predicate(&self, keys: &[&str]) -> String {
        keys.iter()
            .map(|k| {
                let q = self.quote_identifier(k);
                format!("t.{} = s.{}", q, q)
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

// ===========================================================================
// PostgreSQL: sea-query for SELECT and INSERT ... SELECT
// ===========================================================================

/// PostgreSQL dialect
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    /// NAMEDATALEN - 1
    pub const MAX_IDENTIFIER_LENGTH: usize = 63;

    fn select_columns(table: &TableRef, columns: &[ColumnDef]) -> sea_query::SelectStatement {
        let mut stmt = Query::select();
        stmt.columns(columns.iter().map(|c| pg_alias(&c.name)))
            .from(sea_table_ref(table));
        stmt
    }
}

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", fold_pg_identifier(name).replace('"', "\"\""))
    }

    fn max_identifier_length(&self) -> usize {
        Self::MAX_IDENTIFIER_LENGTH
    }

    fn staging_table(&self, target: &TableRef, token: &str) -> TableRef {
        // temp tables live in pg_temp and cannot be schema-qualified
        TableRef::new(staging_name(
            "",
            &target.name,
            token,
            Self::MAX_IDENTIFIER_LENGTH,
        ))
    }

    fn staging_ddl_sql(
        &self,
        target: &TableRef,
        staging: &TableRef,
        columns: &[ColumnDef],
    ) -> String {
        let mut select = Self::select_columns(target, columns);
        select.limit(0);
        format!(
            "CREATE TEMP TABLE {} ON COMMIT DROP AS {}",
            self.qualified_table(staging),
            select.to_string(PostgresQueryBuilder)
        )
    }

    fn staging_cleanup_sql(&self, _staging: &TableRef) -> Option<String> {
        None
    }

    fn insert_sql(
        &self,
        target: &TableRef,
        staging: &TableRef,
        columns: &[ColumnDef],
    ) -> Result<String> {
        let select = Self::select_columns(staging, columns);

        let mut stmt = Query::insert();
        stmt.into_table(sea_table_ref(target))
            .columns(columns.iter().map(|c| pg_alias(&c.name)))
            .select_from(select)
            .map_err(|e| Error::validation(format!("{}: {}", target, e)))?;

        Ok(stmt.to_string(PostgresQueryBuilder))
    }

    fn update_sql(
        &self,
        target: &TableRef,
        staging: &TableRef,
        columns: &[ColumnDef],
    ) -> Result<String> {
        let keys = key_columns(target, columns)?;
        let values = value_columns(target, columns)?;

        let assignments = values
            .iter()
            .map(|c| {
                let q = self.quote_identifier(c);
                format!("{} = s.{}", q, q)
            })
            .collect::<Vec<_>>()
            .join(", ");

        Ok(format!(
            "UPDATE {} AS t SET {} FROM {} AS s WHERE {}",
            self.qualified_table(target),
            assignments,
            self.qualified_table(staging),
            self.key_predicate(&keys)
        ))
    }

    fn delete_sql(
        &self,
        target: &TableRef,
        staging: &TableRef,
        columns: &[ColumnDef],
    ) -> Result<String> {
        let keys = key_columns(target, columns)?;

        Ok(format!(
            "DELETE FROM {} AS t USING {} AS s WHERE {}",
            self.qualified_table(target),
            self.qualified_table(staging),
            self.key_predicate(&keys)
        ))
    }
}

// ===========================================================================
// SQL Server: hand-built SQL (no sea-query backend)
// ===========================================================================

/// SQL Server dialect
#[derive(Debug, Clone, Default)]
pub struct SqlServerDialect;

impl SqlServerDialect {
    /// Temp table names are capped below `sysname` to leave room for the
    /// server's own uniqueness suffix
    pub const MAX_TEMP_TABLE_LENGTH: usize = 116;
}

impl SqlDialect for SqlServerDialect {
    fn name(&self) -> &'static str {
        "SQL Server"
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::SqlServer
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("[{}]", name.replace(']', "]]"))
    }

    fn max_identifier_length(&self) -> usize {
        Self::MAX_TEMP_TABLE_LENGTH
    }

    fn staging_table(&self, target: &TableRef, token: &str) -> TableRef {
        TableRef::new(staging_name(
            "#",
            &target.name,
            token,
            Self::MAX_TEMP_TABLE_LENGTH,
        ))
    }

    fn staging_ddl_sql(
        &self,
        target: &TableRef,
        staging: &TableRef,
        columns: &[ColumnDef],
    ) -> String {
        // a UNION keeps SELECT INTO from copying IDENTITY onto the staging
        // columns; bulk insert skips identity columns
        let cols = self.column_list(columns);
        let target = self.qualified_table(target);
        format!(
            "SELECT TOP 0 {} INTO {} FROM {} UNION ALL SELECT TOP 0 {} FROM {}",
            cols,
            self.qualified_table(staging),
            target,
            cols,
            target
        )
    }

    fn staging_cleanup_sql(&self, staging: &TableRef) -> Option<String> {
        Some(format!("DROP TABLE {}", self.qualified_table(staging)))
    }

    fn insert_sql(
        &self,
        target: &TableRef,
        staging: &TableRef,
        columns: &[ColumnDef],
    ) -> Result<String> {
        let cols = self.column_list(columns);
        Ok(format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            self.qualified_table(target),
            cols,
            cols,
            self.qualified_table(staging)
        ))
    }

    fn update_sql(
        &self,
        target: &TableRef,
        staging: &TableRef,
        columns: &[ColumnDef],
    ) -> Result<String> {
        let keys = key_columns(target, columns)?;
        let values = value_columns(target, columns)?;

        let assignments = values
            .iter()
            .map(|c| {
                let q = self.quote_identifier(c);
                format!("t.{} = s.{}", q, q)
            })
            .collect::<Vec<_>>()
            .join(", ");

        Ok(format!(
            "UPDATE t SET {} FROM {} AS t INNER JOIN {} AS s ON {}",
            assignments,
            self.qualified_table(target),
            self.qualified_table(staging),
            self.key_predicate(&keys)
        ))
    }

    fn delete_sql(
        &self,
        target: &TableRef,
        staging: &TableRef,
        columns: &[ColumnDef],
    ) -> Result<String> {
        let keys = key_columns(target, columns)?;

        Ok(format!(
            "DELETE t FROM {} AS t INNER JOIN {} AS s ON {}",
            self.qualified_table(target),
            self.qualified_table(staging),
            self.key_predicate(&keys)
        ))
    }
}

/// Get dialect by backend tag
pub fn dialect_for(name: &str) -> Result<Box<dyn SqlDialect>> {
    match name.to_lowercase().as_str() {
        "postgres" | "postgresql" => Ok(Box::new(PostgresDialect)),
        "sqlserver" | "mssql" => Ok(Box::new(SqlServerDialect)),
        other => Err(Error::config(format!("unknown database dialect '{}'", other))),
    }
}

/// Get dialect for a backend
pub fn dialect_for_type(database_type: DatabaseType) -> Box<dyn SqlDialect> {
    match database_type {
        DatabaseType::PostgreSQL => Box::new(PostgresDialect),
        DatabaseType::SqlServer => Box::new(SqlServerDialect),
    }
}
