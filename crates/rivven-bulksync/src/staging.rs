//! Staging table naming.
//!
//! A staging table is named `<table>__<token>`. The token joins the current
//! UTC time in microseconds with a process-wide sequence number, so two
//! calls in the same microsecond (or on a clock that stepped backwards) still
//! get distinct names. Names are built from `[A-Za-z0-9_]` only and cut to the
//! dialect's identifier limit from the table side, keeping the token intact.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::security::sanitize_identifier_fragment;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Separator between the table fragment and the token
pub const TOKEN_SEPARATOR: &str = "__";

/// Generate a fresh uniqueness token
pub fn next_token() -> String {
    let micros = Utc::now().timestamp_micros();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{}_{}", micros, seq)
}

/// Build a staging table name for `table`.
///
/// `prefix` is prepended verbatim (`#` for SQL Server session temp tables)
/// and counts towards `max_len`. The result never exceeds `max_len` bytes
/// unless the prefix and token alone already do.
pub fn staging_name(prefix: &str, table: &str, token: &str, max_len: usize) -> String {
    let fragment = sanitize_identifier_fragment(table);
    let fixed = prefix.len() + TOKEN_SEPARATOR.len() + token.len();
    let keep = max_len.saturating_sub(fixed).max(1);
    // sanitized fragments are ASCII, so byte truncation is char-safe
    let fragment = &fragment[..fragment.len().min(keep)];

    let mut name = String::with_capacity(fixed + fragment.len());
    name.push_str(prefix);
    name.push_str(fragment);
    name.push_str(TOKEN_SEPARATOR);
    name.push_str(token);
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tokens_are_unique() {
        let tokens: HashSet<_> = (0..1000).map(|_| next_token()).collect();
        assert_eq!(tokens.len(), 1000);
    }

    #[test]
    fn test_staging_name_shape() {
        let name = staging_name("", "customer", "123_4", 63);
        assert_eq!(name, "customer__123_4");

        let name = staging_name("#", "order details", "1_0", 116);
        assert_eq!(name, "#order_details__1_0");
    }

    #[test]
    fn test_staging_name_truncates_table_part() {
        let token = next_token();
        let long = "t".repeat(200);

        let pg = staging_name("", &long, &token, 63);
        assert_eq!(pg.len(), 63);
        assert!(pg.ends_with(&format!("__{}", token)));

        let mssql = staging_name("#", &long, &token, 116);
        assert_eq!(mssql.len(), 116);
        assert!(mssql.starts_with("#ttt"));
    }
}
