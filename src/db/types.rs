use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value as JsonValue;

/// A value that can be stored in the database.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    /// NULL value
    Null,
    /// Boolean
    Bool(bool),
    /// Signed 64-bit integer
    Int64(i64),
    /// Double precision float
    Float64(f64),
    /// Text (unlimited length)
    Text(String),
    /// Arbitrary precision number kept as its decimal string
    Numeric(String),
    /// Timezone-aware timestamp
    Timestamp(DateTime<Utc>),
    /// JSON value
    Json(JsonValue),
}

impl DbValue {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DbValue::Null)
    }

    /// Textual form sent to PostgreSQL and cast server-side to the column type.
    /// Returns `None` for NULL.
    pub fn to_text(&self) -> Option<String> {
        match self {
            DbValue::Null => None,
            DbValue::Bool(v) => Some(v.to_string()),
            DbValue::Int64(v) => Some(v.to_string()),
            DbValue::Float64(v) => Some(v.to_string()),
            DbValue::Text(v) | DbValue::Numeric(v) => Some(v.clone()),
            DbValue::Timestamp(v) => Some(v.to_rfc3339_opts(SecondsFormat::Secs, true)),
            DbValue::Json(v) => Some(v.to_string()),
        }
    }
}

impl fmt::Display for DbValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("NULL"),
        }
    }
}

/// Storage column type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Varchar,
    /// VARCHAR with a length limit
    VarcharN(u16),
    Text,
    Integer,
    BigInt,
    DoublePrecision,
    Numeric,
    Boolean,
    TimestampTz,
    Json,
    JsonB,
}

impl ColumnType {
    /// PostgreSQL type name, usable in casts.
    pub fn sql_name(&self) -> String {
        match self {
            ColumnType::Varchar => "varchar".to_string(),
            ColumnType::VarcharN(n) => format!("varchar({})", n),
            ColumnType::Text => "text".to_string(),
            ColumnType::Integer => "integer".to_string(),
            ColumnType::BigInt => "bigint".to_string(),
            ColumnType::DoublePrecision => "double precision".to_string(),
            ColumnType::Numeric => "numeric".to_string(),
            ColumnType::Boolean => "boolean".to_string(),
            ColumnType::TimestampTz => "timestamp with time zone".to_string(),
            ColumnType::Json => "json".to_string(),
            ColumnType::JsonB => "jsonb".to_string(),
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self, ColumnType::Json | ColumnType::JsonB)
    }
}

/// How a column behaves when the conflict key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Written on insert and on update.
    Overwrite,
    /// Written on insert only; an existing row keeps its value.
    InsertOnly,
    /// Written on insert; on update the stored value wins unless it is NULL.
    PreserveExisting,
}

/// One column of an upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnWrite {
    pub column: String,
    pub value: DbValue,
    pub column_type: ColumnType,
    pub policy: UpdatePolicy,
}

impl ColumnWrite {
    pub fn new(
        column: impl Into<String>,
        value: DbValue,
        column_type: ColumnType,
        policy: UpdatePolicy,
    ) -> Self {
        Self {
            column: column.into(),
            value,
            column_type,
            policy,
        }
    }
}

/// Insert-or-update keyed by a uniqueness constraint.
///
/// Every entry of `conflict_columns` must also appear in `columns`, and so
/// must `order_column` when set.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertRequest {
    pub table: String,
    pub conflict_columns: Vec<String>,
    pub columns: Vec<ColumnWrite>,
    /// Integer column ordering writes to one key. An update carrying a lower
    /// value than the stored row is skipped entirely.
    pub order_column: Option<String>,
}

impl UpsertRequest {
    pub fn with_order_column(mut self, column: impl Into<String>) -> Self {
        self.order_column = Some(column.into());
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnWrite> {
        self.columns.iter().find(|c| c.column == name)
    }

    /// Values of the conflict columns, in conflict-key order.
    pub fn conflict_values(&self) -> Vec<&DbValue> {
        self.conflict_columns
            .iter()
            .filter_map(|name| self.column(name).map(|c| &c.value))
            .collect()
    }

    /// Human readable conflict key, e.g. `project_id=1007, chain_id=1`.
    pub fn conflict_key_display(&self) -> String {
        self.conflict_columns
            .iter()
            .map(|name| match self.column(name) {
                Some(c) => format!("{}={}", name, c.value),
                None => format!("{}=?", name),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Which path an upsert took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The stored row is ahead of this write on `order_column`; nothing changed.
    Stale,
}
