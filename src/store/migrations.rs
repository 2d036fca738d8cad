//! Schema setup for the libSQL store.
//!
//! The applied schema version lives in SQLite's `user_version` pragma. A
//! database below [`SCHEMA_VERSION`] gets the schema applied in one batch.

use libsql::Connection;
use tracing::{debug, info};

use crate::error::StoreError;

pub(crate) const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        record TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
    CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at);

    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        record TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_workflows_status ON workflows(status);
"#;

/// Bring the database up to [`SCHEMA_VERSION`]. No-op when already there.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    let version = schema_version(conn).await?;
    if version >= SCHEMA_VERSION {
        debug!(version, "Store schema up to date");
        return Ok(());
    }

    info!(from = version, to = SCHEMA_VERSION, "Applying store schema");
    conn.execute_batch(SCHEMA)
        .await
        .map_err(|e| StoreError::Migration(format!("schema V{SCHEMA_VERSION}: {e}")))?;
    // PRAGMA does not take bound parameters.
    conn.execute(&format!("PRAGMA user_version = {SCHEMA_VERSION}"), ())
        .await
        .map_err(|e| StoreError::Migration(format!("recording schema version: {e}")))?;
    Ok(())
}

pub(crate) async fn schema_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("PRAGMA user_version", ())
        .await
        .map_err(|e| StoreError::Migration(format!("reading schema version: {e}")))?;
    match rows.next().await? {
        Some(row) => Ok(row.get(0)?),
        None => Ok(0),
    }
}
