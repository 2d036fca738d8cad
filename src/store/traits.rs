//! `RecordStore` trait: the async interface for task and workflow records.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::tasks::model::Task;
use crate::workflows::model::Workflow;

/// Backend-agnostic key-value store for task and workflow records.
///
/// Writes are atomic per record. Every error is recoverable: callers log it
/// and keep their in-memory state.
#[async_trait]
pub trait RecordStore: Send + Sync {
    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert or replace a task record.
    async fn put_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Get a task by id.
    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError>;

    /// Get all task records, oldest first.
    async fn get_all_tasks(&self) -> Result<Vec<Task>, StoreError>;

    /// Delete a task record. Returns whether it existed.
    async fn delete_task(&self, id: &str) -> Result<bool, StoreError>;

    /// Replace the stored task list with `tasks`.
    async fn save_tasks(&self, tasks: &[Task]) -> Result<(), StoreError>;

    // ── Workflows ───────────────────────────────────────────────────

    /// Insert or replace a workflow record.
    async fn put_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

    /// Get a workflow by id.
    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>, StoreError>;

    /// Get all workflow records.
    async fn get_all_workflows(&self) -> Result<Vec<Workflow>, StoreError>;
}
