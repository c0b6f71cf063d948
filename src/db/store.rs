//! The storage collaborator seam.
//!
//! Every stored row is written through [`Store::upsert`]. Reads are limited
//! to [`Store::select_all`], used at startup to restore runtime state.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::error::DbError;
use super::types::{DbValue, UpdatePolicy, UpsertOutcome, UpsertRequest};

/// Atomic per-key insert-or-update.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Insert the row, or merge it into the row holding the same conflict key
    /// according to each column's [`UpdatePolicy`]. Must be atomic per key.
    async fn upsert(&self, request: UpsertRequest) -> Result<UpsertOutcome, DbError>;

    /// Every row of `table`, restricted to `columns`.
    async fn select_all(&self, table: &str, columns: &[&str]) -> Result<Vec<StoredRow>, DbError>;
}

/// Reject requests that cannot produce a well-formed row.
pub fn validate_request(request: &UpsertRequest) -> Result<(), DbError> {
    let invalid = |reason: String| DbError::InvalidUpsert {
        table: request.table.clone(),
        reason,
    };

    if request.conflict_columns.is_empty() {
        return Err(invalid("no conflict columns".to_string()));
    }

    for name in &request.conflict_columns {
        match request.column(name) {
            None => return Err(invalid(format!("conflict column '{}' has no value", name))),
            Some(c) if c.value.is_null() => {
                return Err(invalid(format!("conflict column '{}' is NULL", name)))
            }
            Some(_) => {}
        }
    }

    if let Some(name) = &request.order_column {
        match request.column(name) {
            Some(c) if matches!(c.value, DbValue::Int64(_)) => {}
            _ => return Err(invalid(format!("order column '{}' has no integer value", name))),
        }
    }

    Ok(())
}

/// Whether `request` is behind `row` on the request's order column.
fn is_stale(request: &UpsertRequest, row: &StoredRow) -> bool {
    let Some(name) = &request.order_column else {
        return false;
    };
    match (row.get(name), request.column(name).map(|c| &c.value)) {
        (Some(DbValue::Int64(stored)), Some(DbValue::Int64(incoming))) => stored > incoming,
        _ => false,
    }
}

pub type StoredRow = HashMap<String, DbValue>;

/// In-process store with the same merge semantics as the PostgreSQL upsert.
///
/// Used by `--dry-run` and by tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, HashMap<Vec<String>, StoredRow>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the row stored under `key` (conflict values in order, as text).
    pub fn get(&self, table: &str, key: &[&str]) -> Option<StoredRow> {
        let key: Vec<String> = key.iter().map(|k| k.to_string()).collect();
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.get(table).and_then(|rows| rows.get(&key)).cloned()
    }

    /// Snapshot of every row in `table`.
    pub fn rows(&self, table: &str) -> Vec<StoredRow> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.get(table).map(|rows| rows.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert(&self, request: UpsertRequest) -> Result<UpsertOutcome, DbError> {
        validate_request(&request)?;

        let key: Vec<String> = request
            .conflict_values()
            .into_iter()
            .map(|v| v.to_string())
            .collect();

        // One critical section per upsert: no await while the lock is held.
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let rows = tables.entry(request.table.clone()).or_default();

        match rows.get_mut(&key) {
            Some(row) if is_stale(&request, row) => Ok(UpsertOutcome::Stale),
            None => {
                let row = request
                    .columns
                    .into_iter()
                    .map(|c| (c.column, c.value))
                    .collect();
                rows.insert(key, row);
                Ok(UpsertOutcome::Inserted)
            }
            Some(row) => {
                for write in request.columns {
                    match write.policy {
                        UpdatePolicy::Overwrite => {
                            row.insert(write.column, write.value);
                        }
                        UpdatePolicy::InsertOnly => {}
                        UpdatePolicy::PreserveExisting => {
                            let existing_is_null =
                                row.get(&write.column).map(DbValue::is_null).unwrap_or(true);
                            if existing_is_null {
                                row.insert(write.column, write.value);
                            }
                        }
                    }
                }
                Ok(UpsertOutcome::Updated)
            }
        }
    }

    async fn select_all(&self, table: &str, columns: &[&str]) -> Result<Vec<StoredRow>, DbError> {
        Ok(self
            .rows(table)
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .filter(|(column, _)| columns.contains(&column.as_str()))
                    .collect()
            })
            .collect())
    }
}
