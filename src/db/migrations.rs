use std::collections::HashSet;
use std::path::{Path, PathBuf};

use deadpool_postgres::Pool;

use super::error::DbError;

/// Table the Contract Group Extender writes newly discovered addresses to.
pub const CONTRACT_GROUPS_TABLE: &str = "live_object_contract_groups";

const RUNTIME_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS _migrations (
        id SERIAL PRIMARY KEY,
        name VARCHAR(255) NOT NULL UNIQUE,
        applied_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
    );
    CREATE TABLE IF NOT EXISTS live_object_contract_groups (
        chain_id VARCHAR NOT NULL,
        group_name VARCHAR NOT NULL,
        address VARCHAR(50) NOT NULL,
        registered_by_event VARCHAR NOT NULL,
        block_number BIGINT NOT NULL,
        registered_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
        PRIMARY KEY (chain_id, group_name, address)
    );
";

/// Create the runtime's own tables, then apply any `.sql` files in
/// `migrations_dir` that have not been applied yet, in file name order.
///
/// Live object tables themselves are owned by these files; the runtime never
/// derives DDL from property declarations. Runs on a single pooled
/// connection, so a pool of size one is enough.
pub async fn run(pool: &Pool, migrations_dir: Option<&str>) -> Result<(), DbError> {
    let mut client = pool.get().await?;
    client.batch_execute(RUNTIME_TABLES).await?;

    let Some(dir) = migrations_dir else {
        tracing::info!("No migrations directory configured, skipping migrations");
        return Ok(());
    };

    let migrations_path = Path::new(dir);
    if !migrations_path.exists() {
        tracing::info!("Migrations directory {} not found, skipping migrations", dir);
        return Ok(());
    }

    let rows = client.query("SELECT name FROM _migrations", &[]).await?;
    let applied: HashSet<String> = rows.iter().map(|row| row.get(0)).collect();

    for (name, path) in pending_migrations(migrations_path, &applied)? {
        let sql = std::fs::read_to_string(&path)?;

        let tx = client.transaction().await?;

        tx.batch_execute(&sql).await.map_err(|e| {
            DbError::MigrationError(format!("Failed to run migration {}: {}", name, e))
        })?;

        tx.execute("INSERT INTO _migrations (name) VALUES ($1)", &[&name])
            .await?;

        tx.commit().await?;

        tracing::info!("Applied migration: {}", name);
    }

    tracing::info!("All migrations up to date");
    Ok(())
}

/// `.sql` files in `dir` not yet in `applied`, sorted by file name.
fn pending_migrations(dir: &Path, applied: &HashSet<String>) -> Result<Vec<(String, PathBuf)>, DbError> {
    let mut pending: Vec<(String, PathBuf)> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|path| path.extension().map(|x| x == "sql").unwrap_or(false))
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().to_string();
            (!applied.contains(&name)).then_some((name, path))
        })
        .collect();

    pending.sort();
    Ok(pending)
}
