//! In-memory `RecordStore` with write counters.
//!
//! Used by tests and by embedders that do not need durability. It can be
//! switched into an unavailable mode to exercise degraded operation.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::traits::RecordStore;
use crate::tasks::model::Task;
use crate::workflows::model::Workflow;

#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<Vec<Task>>,
    workflows: RwLock<HashMap<String, Workflow>>,
    unavailable: AtomicBool,
    task_writes: AtomicUsize,
    workflow_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful task writes (`put_task`, `save_tasks`, `delete_task`).
    pub fn task_writes(&self) -> usize {
        self.task_writes.load(Ordering::SeqCst)
    }

    /// Number of successful workflow writes.
    pub fn workflow_writes(&self) -> usize {
        self.workflow_writes.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store switched off".to_string()))
        } else {
            Ok(())
        }
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Unavailable(format!("Lock error: {e}"))
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        self.check()?;
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        match tasks.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => *existing = task.clone(),
            None => tasks.push(task.clone()),
        }
        self.task_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        self.check()?;
        let tasks = self.tasks.read().map_err(poisoned)?;
        Ok(tasks.iter().find(|t| t.id == id).cloned())
    }

    async fn get_all_tasks(&self) -> Result<Vec<Task>, StoreError> {
        self.check()?;
        Ok(self.tasks.read().map_err(poisoned)?.clone())
    }

    async fn delete_task(&self, id: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        let before = tasks.len();
        tasks.retain(|t| t.id != id);
        self.task_writes.fetch_add(1, Ordering::SeqCst);
        Ok(tasks.len() < before)
    }

    async fn save_tasks(&self, tasks: &[Task]) -> Result<(), StoreError> {
        self.check()?;
        *self.tasks.write().map_err(poisoned)? = tasks.to_vec();
        self.task_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn put_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.check()?;
        self.workflows
            .write()
            .map_err(poisoned)?
            .insert(workflow.id.clone(), workflow.clone());
        self.workflow_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>, StoreError> {
        self.check()?;
        Ok(self.workflows.read().map_err(poisoned)?.get(id).cloned())
    }

    async fn get_all_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        self.check()?;
        Ok(self.workflows.read().map_err(poisoned)?.values().cloned().collect())
    }
}
