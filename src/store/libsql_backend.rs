//! libSQL backend for `RecordStore`.
//!
//! Records are stored as JSON in a `record` column next to the few columns
//! we index on. Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::RecordStore;
use crate::tasks::model::Task;
use crate::workflows::model::Workflow;

/// libSQL record store.
///
/// A single connection is reused for all operations. Writes are serialized
/// through `write_lock` so a multi-statement transaction never interleaves
/// with another write on the same connection.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db)?;
        migrations::run_migrations(&store.conn).await?;
        info!(path = %path.display(), "Record store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!("Failed to create in-memory database: {e}"))
            })?;

        let store = Self::from_database(db)?;
        migrations::run_migrations(&store.conn).await?;
        Ok(store)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Unavailable(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    async fn query_records(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<String>, StoreError> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row.get::<String>(0)?);
        }
        Ok(records)
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn decode<T: serde::de::DeserializeOwned>(record: &str) -> Result<T, StoreError> {
    serde_json::from_str(record).map_err(StoreError::from)
}

async fn insert_task(conn: &Connection, task: &Task) -> Result<(), StoreError> {
    let record = serde_json::to_string(task)?;
    conn.execute(
        "INSERT INTO tasks (id, status, record, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET status = excluded.status, record = excluded.record, updated_at = excluded.updated_at",
        params![
            task.id.clone(),
            task.status.to_string(),
            record,
            task.created_at.to_rfc3339(),
            Utc::now().to_rfc3339(),
        ],
    )
    .await?;
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl RecordStore for LibSqlStore {
    // ── Tasks ───────────────────────────────────────────────────────

    async fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        insert_task(&self.conn, task).await
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let records = self
            .query_records("SELECT record FROM tasks WHERE id = ?1", params![id])
            .await?;
        records.first().map(|r| decode(r)).transpose()
    }

    async fn get_all_tasks(&self) -> Result<Vec<Task>, StoreError> {
        self.query_records("SELECT record FROM tasks ORDER BY created_at ASC", ())
            .await?
            .iter()
            .map(|r| decode(r))
            .collect()
    }

    async fn delete_task(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let affected = self
            .conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .await?;
        Ok(affected > 0)
    }

    async fn save_tasks(&self, tasks: &[Task]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await?;
        tx.execute("DELETE FROM tasks", ()).await?;
        for task in tasks {
            insert_task(&tx, task).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ── Workflows ───────────────────────────────────────────────────

    async fn put_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let record = serde_json::to_string(workflow)?;
        self.conn
            .execute(
                "INSERT INTO workflows (id, status, record, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status, record = excluded.record, updated_at = excluded.updated_at",
                params![
                    workflow.id.clone(),
                    workflow.status.to_string(),
                    record,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>, StoreError> {
        let records = self
            .query_records("SELECT record FROM workflows WHERE id = ?1", params![id])
            .await?;
        records.first().map(|r| decode(r)).transpose()
    }

    async fn get_all_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        self.query_records("SELECT record FROM workflows ORDER BY updated_at ASC", ())
            .await?
            .iter()
            .map(|r| decode(r))
            .collect()
    }
}
