//! Unit tests for rivven-bulksync request validation

use rivven_bulksync::error::ErrorCategory;
use rivven_bulksync::request::{ColumnDef, Operation, SyncRequest, TableRef};
use rivven_bulksync::types::{Row, Value};

fn customer_row(id: i32, name: &str) -> Row {
    Row::default()
        .with("ID", id)
        .with("Name", name)
        .with("Source", "Sync POC")
}

fn customer(op: Operation) -> SyncRequest {
    SyncRequest::new("customer", op)
        .with_schema("poc")
        .key_column("ID")
        .column("Name")
        .column("Source")
}

#[test]
fn test_customer_insert_is_valid() {
    let request = customer(Operation::Insert).rows([
        customer_row(1, "John Doe"),
        customer_row(2, "Jane Smith"),
    ]);

    assert!(request.validate().is_ok());
    assert_eq!(request.rows.len(), 2);
    assert_eq!(request.table, TableRef::with_schema("poc", "customer"));
}

#[test]
fn test_rows_from_any_producer() {
    let request = customer(Operation::Insert)
        .rows((1..=1000).map(|i| customer_row(i, &format!("customer {}", i))));

    assert_eq!(request.rows.len(), 1000);
    assert!(request.validate().is_ok());
}

#[test]
fn test_empty_batch_is_valid() {
    assert!(customer(Operation::Delete).validate().is_ok());
}

#[test]
fn test_delete_with_key_only_rows() {
    let request = SyncRequest::delete("customer")
        .key_column("ID")
        .rows([Row::default().with("ID", 1)]);

    assert!(request.validate().is_ok());
}

#[test]
fn test_update_without_key_is_validation_error() {
    let request = SyncRequest::update("customer")
        .column("Name")
        .rows([Row::default().with("Name", "x")]);

    let err = request.validate().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Validation);
    assert!(err.to_string().contains("primary key"));
}

#[test]
fn test_no_columns_is_validation_error() {
    let err = SyncRequest::insert("customer").validate().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Validation);
}

#[test]
fn test_duplicate_column_is_validation_error() {
    let request = SyncRequest::insert("customer")
        .key_column("ID")
        .column("ID");

    let err = request.validate().unwrap_err();
    assert!(err.to_string().contains("duplicate column 'ID'"));
}

#[test]
fn test_names_are_case_sensitive() {
    // "id" and "ID" are different columns, so the row misses "ID"
    let request = SyncRequest::delete("customer")
        .key_column("ID")
        .rows([Row::default().with("id", 1)]);

    let err = request.validate().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Validation);
    assert!(err.to_string().contains("unknown column 'id'"));
}

#[test]
fn test_row_missing_column() {
    let request = customer(Operation::Update)
        .rows([Row::default().with("ID", 1).with("Name", "x")]);

    let err = request.validate().unwrap_err();
    assert!(err.to_string().contains("row 0 is missing column 'Source'"));
}

#[test]
fn test_row_repeated_column() {
    let row = customer_row(1, "x").with("ID", 2);
    let err = customer(Operation::Insert).rows([row]).validate().unwrap_err();
    assert!(err.to_string().contains("repeats column 'ID'"));
}

#[test]
fn test_bad_identifiers_rejected() {
    let err = SyncRequest::insert("")
        .column("a")
        .validate()
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Validation);

    let err = SyncRequest::insert("customer")
        .with_schema("po\0c")
        .column("a")
        .validate()
        .unwrap_err();
    assert!(err.to_string().contains("schema name"));

    let err = SyncRequest::insert("customer")
        .column("bad\ncolumn")
        .validate()
        .unwrap_err();
    assert!(err.to_string().contains("column name"));
}

#[test]
fn test_quote_characters_are_legal_names() {
    // quoting happens in the dialect; these names are valid
    let request = SyncRequest::insert("odd\"table]")
        .column("it's")
        .rows([Row::default().with("it's", Value::Null)]);
    assert!(request.validate().is_ok());
}

#[test]
fn test_with_columns() {
    let request = SyncRequest::update("order_line").with_columns([
        ColumnDef::key("OrderId"),
        ColumnDef::key("LineNo"),
        ColumnDef::new("Qty"),
    ]);

    let keys: Vec<_> = request.key_columns().map(|c| c.name.as_str()).collect();
    let values: Vec<_> = request.value_columns().map(|c| c.name.as_str()).collect();
    assert_eq!(keys, ["OrderId", "LineNo"]);
    assert_eq!(values, ["Qty"]);
}

#[test]
fn test_operation_serde() {
    let op: Operation = serde_json::from_str("\"create\"").unwrap();
    assert_eq!(op, Operation::Insert);
    let op: Operation = serde_json::from_str("\"delete\"").unwrap();
    assert_eq!(op, Operation::Delete);
    assert_eq!(serde_json::to_string(&Operation::Update).unwrap(), "\"update\"");

    assert!(Operation::Update.requires_key());
    assert!(!Operation::Insert.requires_key());
}
