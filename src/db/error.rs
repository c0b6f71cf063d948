use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Pool error: {0}")]
    PoolError(#[from] deadpool_postgres::PoolError),

    #[error("{}", format_pg_error(.0))]
    PostgresError(#[from] tokio_postgres::Error),

    #[error("Build error: {0}")]
    BuildError(#[from] deadpool_postgres::BuildError),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("Invalid upsert on {table}: {reason}")]
    InvalidUpsert { table: String, reason: String },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl DbError {
    /// Unique/foreign key/check violations are permanent for the given row;
    /// everything else may succeed on redelivery.
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            DbError::PostgresError(e) => e
                .as_db_error()
                .map(|db_err| db_err.code().code().starts_with("23"))
                .unwrap_or(false),
            DbError::InvalidUpsert { .. } => true,
            _ => false,
        }
    }
}

fn format_pg_error(e: &tokio_postgres::Error) -> String {
    if let Some(db_err) = e.as_db_error() {
        let mut msg = format!(
            "PostgreSQL error [{}]: {}",
            db_err.code().code(),
            db_err.message()
        );
        if let Some(detail) = db_err.detail() {
            msg.push_str(&format!("\n  Detail: {}", detail));
        }
        if let Some(hint) = db_err.hint() {
            msg.push_str(&format!("\n  Hint: {}", hint));
        }
        if let Some(table) = db_err.table() {
            msg.push_str(&format!("\n  Table: {}", table));
        }
        if let Some(column) = db_err.column() {
            msg.push_str(&format!("\n  Column: {}", column));
        }
        if let Some(constraint) = db_err.constraint() {
            msg.push_str(&format!("\n  Constraint: {}", constraint));
        }
        msg
    } else {
        format!("PostgreSQL error: {}", e)
    }
}
