//! The authoritative in-memory task list of the foreground, with broadcast
//! fan-out of change events and debounced persistence.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use tokio::sync::{RwLock, broadcast};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, warn};

use super::model::{Task, TaskEvent, TaskPatch, TaskStatus};
use super::persist::DebouncedWriter;
use crate::config::SyncConfig;
use crate::error::{StoreError, TaskError};
use crate::llm::GenerationRequest;
use crate::store::RecordStore;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// In-memory task queue backed by a broadcast channel for fan-out.
///
/// The queue is the only mutator of tasks. Every mutation emits a
/// [`TaskEvent`] and re-arms the debounced write of the full list.
pub struct TaskQueue {
    tasks: Arc<RwLock<Vec<Task>>>,
    tx: broadcast::Sender<TaskEvent>,
    store: Option<Arc<dyn RecordStore>>,
    writer: Option<DebouncedWriter>,
}

impl TaskQueue {
    /// Create a queue without persistence.
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self {
            tasks: Arc::new(RwLock::new(Vec::new())),
            tx,
            store: None,
            writer: None,
        })
    }

    /// Create a queue that persists to `store`. Must be called inside a
    /// Tokio runtime.
    pub fn with_store(store: Arc<dyn RecordStore>, config: &SyncConfig) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        let tasks = Arc::new(RwLock::new(Vec::new()));
        let writer = DebouncedWriter::spawn(
            Arc::clone(&tasks),
            Arc::clone(&store),
            config.debounce,
            config.persist_failure_threshold,
            tx.clone(),
        );
        Arc::new(Self {
            tasks,
            tx,
            store: Some(store),
            writer: Some(writer),
        })
    }

    /// Subscribe to raw change events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// A lazy, unbounded stream of change events. Each call is an independent
    /// subscription that starts at the next event; dropping it unsubscribes.
    pub fn observe_task_updates(&self) -> impl Stream<Item = TaskEvent> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                warn!(missed = n, "Task update observer lagged behind");
                None
            }
        })
    }

    fn emit(&self, event: TaskEvent) {
        // Broadcast; ok if nobody is listening
        let _ = self.tx.send(event);
        if let Some(ref writer) = self.writer {
            writer.touch();
        }
    }

    /// Seed in-memory state from the store. Storage failure is logged and
    /// the queue starts empty.
    pub async fn load_from_store(&self) -> usize {
        let Some(ref store) = self.store else {
            return 0;
        };
        match store.get_all_tasks().await {
            Ok(records) => self.restore_tasks(records).await,
            Err(e) => {
                warn!(error = %e, "Could not load tasks, continuing with in-memory state");
                0
            }
        }
    }

    /// Replace in-memory state with `records`.
    ///
    /// Tasks left `processing` by a previous foreground are reset to
    /// `pending`. Returns how many were reset.
    pub async fn restore_tasks(&self, records: Vec<Task>) -> usize {
        let mut restored: Vec<Task> = Vec::with_capacity(records.len());
        let mut recovered = 0;
        for mut task in records {
            if task.recover_interrupted() {
                debug!(task_id = %task.id, "Reset interrupted task to pending");
                recovered += 1;
            }
            match restored.iter_mut().find(|t| t.id == task.id) {
                Some(existing) => *existing = task,
                None => restored.push(task),
            }
        }

        let count = restored.len();
        *self.tasks.write().await = restored;

        info!(count, recovered, "Restored tasks");
        self.emit(TaskEvent::Restored { count, recovered });
        recovered
    }

    /// Create a new pending task.
    pub async fn submit(&self, payload: GenerationRequest) -> Task {
        let task = Task::new(payload);
        info!(task_id = %task.id, kind = %task.payload.kind, "Task submitted");

        self.tasks.write().await.push(task.clone());
        self.emit(TaskEvent::Created { task: task.clone() });
        task
    }

    /// Change a task's status and apply `patch`. The sole task mutator.
    pub async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        patch: TaskPatch,
    ) -> Result<Task, TaskError> {
        self.transition(id, status, patch, |current| current.can_transition_to(status))
            .await
    }

    /// Begin an execution attempt. Only a `pending` or `retrying` task can
    /// start, so a task already being processed is never started twice.
    pub async fn start_attempt(&self, id: &str) -> Result<Task, TaskError> {
        self.transition(id, TaskStatus::Processing, TaskPatch::result(""), |current| {
            matches!(current, TaskStatus::Pending | TaskStatus::Retrying)
        })
        .await
    }

    async fn transition(
        &self,
        id: &str,
        status: TaskStatus,
        patch: TaskPatch,
        allowed: impl FnOnce(TaskStatus) -> bool,
    ) -> Result<Task, TaskError> {
        let updated = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| TaskError::NotFound { id: id.to_string() })?;

            if !allowed(task.status) {
                return Err(TaskError::InvalidTransition {
                    id: id.to_string(),
                    status: task.status.to_string(),
                    target: status.to_string(),
                });
            }

            let previous = task.status;
            task.apply_status(status);
            patch.apply(task);

            if previous != status {
                debug!(task_id = %id, from = %previous, to = %status, "Task status changed");
            }
            task.clone()
        };

        self.emit(TaskEvent::Updated {
            task: updated.clone(),
        });
        Ok(updated)
    }

    /// Get a task by id.
    pub async fn get(&self, id: &str) -> Option<Task> {
        self.tasks.read().await.iter().find(|t| t.id == id).cloned()
    }

    /// All tasks, in submission order.
    pub async fn all(&self) -> Vec<Task> {
        self.tasks.read().await.clone()
    }

    /// Tasks eligible for scheduling.
    pub async fn pending(&self) -> Vec<Task> {
        self.tasks
            .read()
            .await
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect()
    }

    /// Remove a task.
    pub async fn remove(&self, id: &str) -> bool {
        let removed = {
            let mut tasks = self.tasks.write().await;
            let before = tasks.len();
            tasks.retain(|t| t.id != id);
            tasks.len() < before
        };
        if removed {
            info!(task_id = %id, "Task removed");
            self.emit(TaskEvent::Removed { id: id.to_string() });
        }
        removed
    }

    /// Drop terminal tasks older than `retention`, then keep at most
    /// `max_terminal` of the newest terminal tasks. Returns the number pruned.
    pub async fn prune(&self, retention: Duration, max_terminal: usize) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::weeks(1));

        let pruned: Vec<String> = {
            let mut tasks = self.tasks.write().await;
            let mut pruned = Vec::new();

            tasks.retain(|t| {
                let expired = t.status.is_terminal()
                    && t.completed_at.unwrap_or(t.created_at) < cutoff;
                if expired {
                    pruned.push(t.id.clone());
                }
                !expired
            });

            let terminal = tasks.iter().filter(|t| t.status.is_terminal()).count();
            let mut excess = terminal.saturating_sub(max_terminal);
            if excess > 0 {
                // Oldest first, since tasks are kept in submission order
                tasks.retain(|t| {
                    if excess > 0 && t.status.is_terminal() {
                        excess -= 1;
                        pruned.push(t.id.clone());
                        false
                    } else {
                        true
                    }
                });
            }
            pruned
        };

        if !pruned.is_empty() {
            info!(count = pruned.len(), "Pruned tasks");
        }
        for id in &pruned {
            self.emit(TaskEvent::Removed { id: id.clone() });
        }
        pruned.len()
    }

    /// Get the total number of tasks.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Check if the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Write the current task list now, bypassing the debounce window.
    pub async fn flush(&self) -> Result<(), StoreError> {
        match self.writer {
            Some(ref writer) => writer.flush().await,
            None => Ok(()),
        }
    }
}

/// Spawn a background task that periodically prunes old terminal tasks.
pub fn spawn_prune_task(queue: Arc<TaskQueue>, config: SyncConfig) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            queue
                .prune(config.retention, config.max_retained_terminal)
                .await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn request() -> GenerationRequest {
        GenerationRequest::chat("draw a cat")
    }

    fn config() -> SyncConfig {
        SyncConfig {
            debounce: Duration::from_millis(500),
            persist_failure_threshold: Some(2),
            ..SyncConfig::default()
        }
    }

    #[tokio::test]
    async fn submit_and_update() {
        let queue = TaskQueue::new();
        let task = queue.submit(request()).await;
        assert_eq!(queue.pending().await.len(), 1);

        let updated = queue
            .update_task_status(&task.id, TaskStatus::Processing, TaskPatch::default())
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Processing);
        assert!(updated.started_at.is_some());
        assert!(queue.pending().await.is_empty());
    }

    #[tokio::test]
    async fn attempt_starts_only_once() {
        let queue = TaskQueue::new();
        let task = queue.submit(request()).await;

        let started = queue.start_attempt(&task.id).await.unwrap();
        assert_eq!(started.status, TaskStatus::Processing);

        let err = queue.start_attempt(&task.id).await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));

        // Streamed chunks still land on a processing task.
        let appended = queue
            .update_task_status(&task.id, TaskStatus::Processing, TaskPatch::append("x"))
            .await
            .unwrap();
        assert_eq!(appended.result.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn update_unknown_task_fails() {
        let queue = TaskQueue::new();
        let err = queue
            .update_task_status("nope", TaskStatus::Processing, TaskPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::NotFound { .. }));
    }

    #[tokio::test]
    async fn invalid_transition_rejected() {
        let queue = TaskQueue::new();
        let task = queue.submit(request()).await;
        let err = queue
            .update_task_status(&task.id, TaskStatus::Succeeded, TaskPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn restore_resets_processing_tasks() {
        let queue = TaskQueue::new();
        let mut interrupted = Task::new(request());
        interrupted.apply_status(TaskStatus::Processing);
        let mut done = Task::new(request());
        done.apply_status(TaskStatus::Processing);
        done.apply_status(TaskStatus::Succeeded);

        let recovered = queue
            .restore_tasks(vec![interrupted.clone(), done.clone()])
            .await;
        assert_eq!(recovered, 1);

        let restored = queue.get(&interrupted.id).await.unwrap();
        assert_eq!(restored.status, TaskStatus::Pending);
        assert!(restored.started_at.is_none());
        assert_eq!(
            queue.get(&done.id).await.unwrap().status,
            TaskStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn observers_are_independent() {
        let queue = TaskQueue::new();
        let mut first = Box::pin(queue.observe_task_updates());
        let mut second = Box::pin(queue.observe_task_updates());

        let task = queue.submit(request()).await;

        match first.next().await.unwrap() {
            TaskEvent::Created { task: t } => assert_eq!(t.id, task.id),
            other => panic!("Expected Created, got {other:?}"),
        }
        match second.next().await.unwrap() {
            TaskEvent::Created { task: t } => assert_eq!(t.id, task.id),
            other => panic!("Expected Created, got {other:?}"),
        }

        drop(first);
        queue
            .update_task_status(&task.id, TaskStatus::Processing, TaskPatch::default())
            .await
            .unwrap();
        assert!(matches!(
            second.next().await.unwrap(),
            TaskEvent::Updated { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_updates_coalesce_into_one_write() {
        let store = Arc::new(MemoryStore::new());
        let queue = TaskQueue::with_store(store.clone(), &config());
        let task = queue.submit(request()).await;
        queue
            .update_task_status(&task.id, TaskStatus::Processing, TaskPatch::default())
            .await
            .unwrap();

        for i in 0..10 {
            queue
                .update_task_status(
                    &task.id,
                    TaskStatus::Processing,
                    TaskPatch::append(format!("{i}")),
                )
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(store.task_writes(), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.task_writes(), 1);

        let persisted = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(persisted.result.as_deref(), Some("0123456789"));
        assert_eq!(persisted.status, TaskStatus::Processing);
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_failure_is_retried_next_window() {
        let store = Arc::new(MemoryStore::new());
        let queue = TaskQueue::with_store(store.clone(), &config());
        let mut events = queue.subscribe();

        store.set_unavailable(true);
        let task = queue.submit(request()).await;
        assert_eq!(queue.len().await, 1);

        // Two failed windows reach the threshold.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let mut degraded = false;
        while let Ok(event) = events.try_recv() {
            if let TaskEvent::PersistenceDegraded {
                consecutive_failures,
            } = event
            {
                assert_eq!(consecutive_failures, 2);
                degraded = true;
            }
        }
        assert!(degraded);
        assert_eq!(store.task_writes(), 0);

        store.set_unavailable(false);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.task_writes(), 1);
        assert!(store.get_task(&task.id).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_writes_immediately() {
        let store = Arc::new(MemoryStore::new());
        let queue = TaskQueue::with_store(store.clone(), &config());
        queue.submit(request()).await;

        queue.flush().await.unwrap();
        assert_eq!(store.task_writes(), 1);

        // The flush disarmed the timer.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.task_writes(), 1);
    }

    #[tokio::test]
    async fn prune_keeps_active_tasks() {
        let queue = TaskQueue::new();
        let active = queue.submit(request()).await;
        let mut finished_ids = Vec::new();
        for _ in 0..3 {
            let t = queue.submit(request()).await;
            queue
                .update_task_status(&t.id, TaskStatus::Processing, TaskPatch::default())
                .await
                .unwrap();
            queue
                .update_task_status(&t.id, TaskStatus::Succeeded, TaskPatch::result("ok"))
                .await
                .unwrap();
            finished_ids.push(t.id);
        }

        let pruned = queue.prune(Duration::from_secs(3600), 1).await;
        assert_eq!(pruned, 2);
        assert!(queue.get(&active.id).await.is_some());
        assert!(queue.get(&finished_ids[2]).await.is_some());
        assert!(queue.get(&finished_ids[0]).await.is_none());
    }

    #[tokio::test]
    async fn remove_emits_event() {
        let queue = TaskQueue::new();
        let task = queue.submit(request()).await;
        let mut rx = queue.subscribe();
        assert!(queue.remove(&task.id).await);
        assert!(!queue.remove(&task.id).await);
        assert_eq!(
            rx.recv().await.unwrap(),
            TaskEvent::Removed { id: task.id }
        );
    }
}
