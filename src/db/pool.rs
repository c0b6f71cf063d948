use async_trait::async_trait;
use bytes::BytesMut;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::types::{IsNull, ToSql, Type};
use tokio_postgres::NoTls;

use super::error::DbError;
use super::store::{validate_request, Store, StoredRow};
use super::types::{ColumnType, ColumnWrite, DbValue, UpdatePolicy, UpsertOutcome, UpsertRequest};

pub struct DbPool {
    pool: Pool,
}

impl DbPool {
    pub async fn new(database_url: &str, max_size: usize) -> Result<Self, DbError> {
        let config = database_url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| DbError::InvalidConnectionString(e.to_string()))?;

        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let manager = Manager::from_config(config, NoTls, manager_config);

        let pool = Pool::builder(manager)
            .max_size(max_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(DbError::BuildError)?;

        let _conn = pool.get().await?;
        tracing::info!("Database connection pool created successfully (max_size={})", max_size);

        Ok(Self { pool })
    }

    pub fn inner(&self) -> &Pool {
        &self.pool
    }

    pub async fn run_migrations(&self, migrations_dir: Option<&str>) -> Result<(), DbError> {
        super::migrations::run(&self.pool, migrations_dir).await
    }
}

#[async_trait]
impl Store for DbPool {
    async fn upsert(&self, request: UpsertRequest) -> Result<UpsertOutcome, DbError> {
        validate_request(&request)?;

        let UpsertSql {
            sql,
            params,
            does_update,
        } = build_upsert_sql(&request);
        let params_refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

        let client = self.pool.get().await?;
        let row = match client.query_opt(&sql, &params_refs[..]).await {
            Ok(row) => row,
            Err(e) => {
                let db_err: DbError = e.into();
                tracing::error!("SQL execution failed\n  SQL: {}\n  Error: {}", sql, db_err);
                return Err(db_err);
            }
        };

        // No row back: DO NOTHING hit an existing key, or the order guard
        // rejected the update.
        Ok(match row.map(|r| r.get::<_, bool>(0)) {
            Some(true) => UpsertOutcome::Inserted,
            Some(false) => UpsertOutcome::Updated,
            None if does_update && request.order_column.is_some() => {
                tracing::debug!(
                    "Skipped stale write to {} ({})",
                    request.table,
                    request.conflict_key_display()
                );
                UpsertOutcome::Stale
            }
            None => UpsertOutcome::Updated,
        })
    }

    async fn select_all(&self, table: &str, columns: &[&str]) -> Result<Vec<StoredRow>, DbError> {
        let select = columns
            .iter()
            .map(|c| format!("{}::text", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {} FROM {}", select, quote_table(table));

        let client = self.pool.get().await?;
        let rows = client.query(&sql, &[]).await?;

        Ok(rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .enumerate()
                    .map(|(i, column)| {
                        let value = match row.get::<_, Option<String>>(i) {
                            Some(text) => DbValue::Text(text),
                            None => DbValue::Null,
                        };
                        (column.to_string(), value)
                    })
                    .collect()
            })
            .collect())
    }
}

#[derive(Debug)]
enum SqlParam {
    Null,
    Text(String),
    Json(serde_json::Value),
}

impl ToSql for SqlParam {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlParam::Null => Ok(IsNull::Yes),
            SqlParam::Text(v) => v.to_sql(ty, out),
            SqlParam::Json(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(ty: &Type) -> bool {
        <String as ToSql>::accepts(ty) || <serde_json::Value as ToSql>::accepts(ty)
    }

    tokio_postgres::types::to_sql_checked!();
}

fn convert_column(write: &ColumnWrite) -> SqlParam {
    match (&write.value, write.column_type.is_json()) {
        (DbValue::Null, _) => SqlParam::Null,
        (DbValue::Json(v), true) => SqlParam::Json(v.clone()),
        (value, _) => match value.to_text() {
            Some(text) => SqlParam::Text(text),
            None => SqlParam::Null,
        },
    }
}

/// Generate the SQL placeholder for a column at the given parameter index.
///
/// Scalars travel as text and are cast by PostgreSQL to the column type, so
/// big integers and timestamps never pass through a lossy client-side type.
fn placeholder_for(column_type: ColumnType, param_idx: usize) -> String {
    if column_type.is_json() {
        format!("${}::{}", param_idx, column_type.sql_name())
    } else {
        format!("${}::text::{}", param_idx, column_type.sql_name())
    }
}

/// Wrap a column name in double quotes to handle reserved keywords.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified table name: `allo.projects` -> `"allo"."projects"`.
fn quote_table(table: &str) -> String {
    table.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

const EXISTING_ALIAS: &str = "existing";

struct UpsertSql {
    sql: String,
    params: Vec<SqlParam>,
    /// `DO UPDATE` rather than `DO NOTHING`
    does_update: bool,
}

fn build_upsert_sql(request: &UpsertRequest) -> UpsertSql {
    let cols = request
        .columns
        .iter()
        .map(|c| quote_ident(&c.column))
        .collect::<Vec<_>>()
        .join(", ");

    let placeholders = request
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| placeholder_for(c.column_type, i + 1))
        .collect::<Vec<_>>()
        .join(", ");

    let conflict_cols = request
        .conflict_columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let updates: Vec<String> = request
        .columns
        .iter()
        .filter(|c| !request.conflict_columns.contains(&c.column))
        .filter_map(|c| {
            let col = quote_ident(&c.column);
            match c.policy {
                UpdatePolicy::Overwrite => Some(format!("{} = EXCLUDED.{}", col, col)),
                UpdatePolicy::PreserveExisting => Some(format!(
                    "{} = COALESCE({}.{}, EXCLUDED.{})",
                    col, EXISTING_ALIAS, col, col
                )),
                UpdatePolicy::InsertOnly => None,
            }
        })
        .collect();

    let guard = match &request.order_column {
        Some(column) => format!(
            " WHERE {}.{} <= EXCLUDED.{}",
            EXISTING_ALIAS,
            quote_ident(column),
            quote_ident(column)
        ),
        None => String::new(),
    };

    let does_update = !updates.is_empty();
    let sql = if !does_update {
        format!(
            "INSERT INTO {} AS {} ({}) VALUES ({}) ON CONFLICT ({}) DO NOTHING RETURNING true",
            quote_table(&request.table),
            EXISTING_ALIAS,
            cols,
            placeholders,
            conflict_cols
        )
    } else {
        format!(
            "INSERT INTO {} AS {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}{} RETURNING (xmax = 0)",
            quote_table(&request.table),
            EXISTING_ALIAS,
            cols,
            placeholders,
            conflict_cols,
            updates.join(", "),
            guard
        )
    };

    let params = request.columns.iter().map(convert_column).collect();
    UpsertSql {
        sql,
        params,
        does_update,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_request() -> UpsertRequest {
        UpsertRequest {
            table: "allo.projects".to_string(),
            conflict_columns: vec!["project_id".to_string(), "chain_id".to_string()],
            columns: vec![
                ColumnWrite::new("project_id", DbValue::Int64(1007), ColumnType::BigInt, UpdatePolicy::Overwrite),
                ColumnWrite::new("chain_id", DbValue::Text("1".into()), ColumnType::Varchar, UpdatePolicy::Overwrite),
                ColumnWrite::new(
                    "created_at",
                    DbValue::Text("2023-01-01T00:00:00Z".into()),
                    ColumnType::TimestampTz,
                    UpdatePolicy::PreserveExisting,
                ),
                ColumnWrite::new("is_active", DbValue::Bool(true), ColumnType::Boolean, UpdatePolicy::InsertOnly),
                ColumnWrite::new(
                    "metadata",
                    DbValue::Json(serde_json::json!({"name": "x"})),
                    ColumnType::Json,
                    UpdatePolicy::Overwrite,
                ),
            ],
            order_column: None,
        }
    }

    #[test]
    fn test_upsert_sql_shape() {
        let UpsertSql {
            sql,
            params,
            does_update,
        } = build_upsert_sql(&project_request());

        assert_eq!(
            sql,
            "INSERT INTO \"allo\".\"projects\" AS existing \
             (\"project_id\", \"chain_id\", \"created_at\", \"is_active\", \"metadata\") \
             VALUES ($1::text::bigint, $2::text::varchar, $3::text::timestamp with time zone, $4::text::boolean, $5::json) \
             ON CONFLICT (\"project_id\", \"chain_id\") \
             DO UPDATE SET \"created_at\" = COALESCE(existing.\"created_at\", EXCLUDED.\"created_at\"), \
             \"metadata\" = EXCLUDED.\"metadata\" RETURNING (xmax = 0)"
        );
        assert!(does_update);
        assert_eq!(params.len(), 5);
        assert!(matches!(&params[0], SqlParam::Text(v) if v == "1007"));
        assert!(matches!(&params[4], SqlParam::Json(_)));
    }

    #[test]
    fn test_upsert_without_updatable_columns_does_nothing() {
        let request = UpsertRequest {
            table: "live_object_contract_groups".to_string(),
            conflict_columns: vec!["chain_id".to_string(), "address".to_string()],
            columns: vec![
                ColumnWrite::new("chain_id", DbValue::Text("1".into()), ColumnType::Varchar, UpdatePolicy::Overwrite),
                ColumnWrite::new("address", DbValue::Text("0xabc".into()), ColumnType::Varchar, UpdatePolicy::Overwrite),
                ColumnWrite::new("block_number", DbValue::Int64(5), ColumnType::BigInt, UpdatePolicy::InsertOnly),
            ],
            order_column: None,
        };
        let upsert = build_upsert_sql(&request);
        assert!(!upsert.does_update);
        assert!(upsert
            .sql
            .ends_with("ON CONFLICT (\"chain_id\", \"address\") DO NOTHING RETURNING true"));
    }

    #[test]
    fn test_order_column_guards_the_update() {
        let mut request = project_request().with_order_column("block_number");
        request.columns.push(ColumnWrite::new(
            "block_number",
            DbValue::Int64(11),
            ColumnType::BigInt,
            UpdatePolicy::Overwrite,
        ));

        let upsert = build_upsert_sql(&request);
        assert!(upsert.sql.ends_with(
            "\"block_number\" = EXCLUDED.\"block_number\" \
             WHERE existing.\"block_number\" <= EXCLUDED.\"block_number\" RETURNING (xmax = 0)"
        ));
    }

    #[test]
    fn test_json_value_in_text_column_is_serialized() {
        let write = ColumnWrite::new(
            "tags",
            DbValue::Json(serde_json::json!(["a"])),
            ColumnType::Text,
            UpdatePolicy::Overwrite,
        );
        assert!(matches!(convert_column(&write), SqlParam::Text(v) if v == "[\"a\"]"));
    }

    #[test]
    fn test_quote_table() {
        assert_eq!(quote_table("projects"), "\"projects\"");
        assert_eq!(quote_table("allo.projects"), "\"allo\".\"projects\"");
    }
}
