//! Table sync requests
//!
//! A [`SyncRequest`] names a target table, its columns (with primary-key
//! markers), the operation to apply and the rows to apply it with. It is
//! built by the caller, borrowed by the engine for one call and never kept.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::security::validate_identifier;
use crate::types::Row;

/// Operation applied to the target table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Insert every staged row
    #[serde(alias = "create")]
    Insert,
    /// Overwrite non-key columns of rows whose keys match a staged row
    Update,
    /// Remove rows whose keys match a staged row
    Delete,
}

impl Operation {
    /// Whether the operation correlates staged rows to target rows by key
    #[inline]
    pub const fn requires_key(self) -> bool {
        matches!(self, Self::Update | Self::Delete)
    }

    /// Lowercase name, used in logs
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "insert" | "create" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::validation(format!("unknown operation '{}'", other))),
        }
    }
}

/// Column of the target table taking part in the sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name, matched exactly
    pub name: String,
    /// Whether the column is part of the correlation key
    #[serde(default)]
    pub primary_key: bool,
}

impl ColumnDef {
    /// Non-key column
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: false,
        }
    }

    /// Primary-key column
    pub fn key(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: true,
        }
    }
}

/// Optionally schema-qualified table name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    /// Schema (None = connection default)
    pub schema: Option<String>,
    /// Table name
    pub name: String,
}

impl TableRef {
    /// Unqualified table
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    /// Schema-qualified table
    pub fn with_schema(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }

    /// Get fully qualified name (unquoted, for logs)
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(s) => format!("{}.{}", s, self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(s) => write!(f, "{}.{}", s, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Unit of work handed to [`TableSync::apply`](crate::executor::TableSync::apply)
#[derive(Debug, Clone)]
pub struct SyncRequest {
    /// Target table
    pub table: TableRef,
    /// Operation to apply
    pub operation: Operation,
    /// Columns in target table order
    pub columns: Vec<ColumnDef>,
    /// Rows to stage
    pub rows: Vec<Row>,
}

impl SyncRequest {
    /// Create an empty request for `table`
    pub fn new(table: impl Into<String>, operation: Operation) -> Self {
        Self {
            table: TableRef::new(table),
            operation,
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Create an insert request
    pub fn insert(table: impl Into<String>) -> Self {
        Self::new(table, Operation::Insert)
    }

    /// Create an update request
    pub fn update(table: impl Into<String>) -> Self {
        Self::new(table, Operation::Update)
    }

    /// Create a delete request
    pub fn delete(table: impl Into<String>) -> Self {
        Self::new(table, Operation::Delete)
    }

    /// Set the schema qualifier
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.table.schema = Some(schema.into());
        self
    }

    /// Add a non-key column
    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.columns.push(ColumnDef::new(name));
        self
    }

    /// Add a primary-key column
    pub fn key_column(mut self, name: impl Into<String>) -> Self {
        self.columns.push(ColumnDef::key(name));
        self
    }

    /// Set the column definitions
    pub fn with_columns(mut self, columns: impl IntoIterator<Item = ColumnDef>) -> Self {
        self.columns = columns.into_iter().collect();
        self
    }

    /// Append rows from any producer
    pub fn rows(mut self, rows: impl IntoIterator<Item = Row>) -> Self {
        self.rows.extend(rows);
        self
    }

    /// Append one row
    pub fn push_row(&mut self, row: Row) {
        self.rows.push(row);
    }

    /// Primary-key columns in declaration order
    pub fn key_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| c.primary_key)
    }

    /// Non-key columns in declaration order
    pub fn value_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| !c.primary_key)
    }

    /// Check the request before any I/O.
    ///
    /// Rejects empty table names, empty or duplicated column sets, Update and
    /// Delete without a key column, and rows whose keys do not match the
    /// column set exactly.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.table.name)
            .map_err(|e| Error::validation(format!("table name: {}", e)))?;
        if let Some(schema) = &self.table.schema {
            validate_identifier(schema)
                .map_err(|e| Error::validation(format!("schema name: {}", e)))?;
        }

        if self.columns.is_empty() {
            return Err(Error::validation(format!(
                "{}: at least one column is required",
                self.table
            )));
        }

        let mut seen = HashSet::with_capacity(self.columns.len());
        for column in &self.columns {
            validate_identifier(&column.name)
                .map_err(|e| Error::validation(format!("{}: column name: {}", self.table, e)))?;
            if !seen.insert(column.name.as_str()) {
                return Err(Error::validation(format!(
                    "{}: duplicate column '{}'",
                    self.table, column.name
                )));
            }
        }

        if self.operation.requires_key() && self.key_columns().next().is_none() {
            return Err(Error::validation(format!(
                "{}: {} requires at least one primary key column",
                self.table, self.operation
            )));
        }

        for (idx, row) in self.rows.iter().enumerate() {
            self.validate_row(idx, row, &seen)?;
        }

        Ok(())
    }

    fn validate_row(&self, idx: usize, row: &Row, columns: &HashSet<&str>) -> Result<()> {
        let mut present = HashSet::with_capacity(row.len());
        for name in row.columns() {
            if !columns.contains(name.as_str()) {
                return Err(Error::validation(format!(
                    "{}: row {} has unknown column '{}'",
                    self.table, idx, name
                )));
            }
            if !present.insert(name.as_str()) {
                return Err(Error::validation(format!(
                    "{}: row {} repeats column '{}'",
                    self.table, idx, name
                )));
            }
        }

        if let Some(missing) = self
            .columns
            .iter()
            .find(|c| !present.contains(c.name.as_str()))
        {
            return Err(Error::validation(format!(
                "{}: row {} is missing column '{}'",
                self.table, idx, missing.name
            )));
        }

        Ok(())
    }
}
