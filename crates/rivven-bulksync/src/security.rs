//! Identifier hygiene for generated SQL.
//!
//! Every identifier reaches SQL through the dialect's quoting, so the checks
//! here are about shape rather than character whitelists:
//! - Target table, schema and column names must be non-empty, bounded, and
//!   free of control characters (they are matched exactly, case included)
//! - Staging table names are derived from the target name and reduced to
//!   `[A-Za-z0-9_]` so they never need quoting to be safe
//! - String literals embedded in catalog lookups are escaped

use crate::error::Error;

/// Longest identifier accepted for target tables and columns.
///
/// SQL Server's `sysname` limit; PostgreSQL truncates at 63 bytes but
/// reports that as a notice, not an error.
pub const MAX_IDENTIFIER_CHARS: usize = 128;

/// Validate a target identifier (table, schema, or column name).
///
/// Identifiers are always quoted, so any printable character is allowed.
///
/// # Examples
///
/// ```
/// use rivven_bulksync::security::validate_identifier;
///
/// assert!(validate_identifier("ID").is_ok());
/// assert!(validate_identifier("order details").is_ok());
///
/// assert!(validate_identifier("").is_err());
/// assert!(validate_identifier("x\0").is_err());
/// ```
pub fn validate_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::validation("identifier cannot be empty"));
    }

    let chars = name.chars().count();
    if chars > MAX_IDENTIFIER_CHARS {
        return Err(Error::validation(format!(
            "identifier too long: {} chars (max {})",
            chars, MAX_IDENTIFIER_CHARS
        )));
    }

    if let Some(c) = name.chars().find(|c| c.is_control()) {
        return Err(Error::validation(format!(
            "identifier {:?} contains control character {:?}",
            name, c
        )));
    }

    Ok(())
}

/// Reduce `name` to a fragment usable in a staging table name.
///
/// Keeps ASCII letters, digits and underscores; every other character
/// becomes `_`. A leading digit gets an underscore prefix.
///
/// ```
/// use rivven_bulksync::security::sanitize_identifier_fragment;
///
/// assert_eq!(sanitize_identifier_fragment("ticks"), "ticks");
/// assert_eq!(sanitize_identifier_fragment("order details"), "order_details");
/// assert_eq!(sanitize_identifier_fragment("1st"), "_1st");
/// ```
pub fn sanitize_identifier_fragment(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 1);
    if name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.push('_');
    }
    out.extend(name.chars().map(|c| {
        if c.is_ascii_alphanumeric() || c == '_' {
            c
        } else {
            '_'
        }
    }));
    if out.is_empty() {
        out.push('t');
    }
    out
}

/// Escape a string value for a single-quoted SQL literal.
///
/// Only used for catalog lookups that take a name as a string (for example
/// `OBJECT_ID('tempdb..#stg')`); row data always travels through the
/// bulk-load channel.
///
/// ```
/// use rivven_bulksync::security::escape_string_literal;
///
/// assert_eq!(escape_string_literal("users"), "users");
/// assert_eq!(escape_string_literal("don't"), "don''t");
/// ```
pub fn escape_string_literal(value: &str) -> String {
    // Fast path: no escaping needed (common case)
    if !value.contains('\'') {
        return value.to_string();
    }
    value.replace('\'', "''")
}
