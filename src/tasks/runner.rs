//! Drives tasks through execution: processing → succeeded, or retrying → failed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::model::{Task, TaskPatch, TaskStatus};
use super::queue::TaskQueue;
use crate::bridge::GenerationDispatcher;
use crate::error::{Result, TaskError};
use crate::llm::GenerationRequest;

pub struct TaskRunner {
    queue: Arc<TaskQueue>,
    dispatcher: Arc<GenerationDispatcher>,
    max_attempts: u32,
    retry_delay: Duration,
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl TaskRunner {
    pub fn new(
        queue: Arc<TaskQueue>,
        dispatcher: Arc<GenerationDispatcher>,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            dispatcher,
            max_attempts: max_attempts.max(1),
            retry_delay,
            running: Mutex::new(HashMap::new()),
        })
    }

    /// Submit a task and start running it in the background.
    pub async fn submit(self: &Arc<Self>, payload: GenerationRequest) -> (Task, JoinHandle<()>) {
        let task = self.queue.submit(payload).await;
        let handle = self.spawn(task.id.clone());
        (task, handle)
    }

    /// Start every pending task, e.g. after recovery at startup.
    pub async fn resume_pending(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let pending = self.queue.pending().await;
        if !pending.is_empty() {
            info!(count = pending.len(), "Resuming pending tasks");
        }
        pending
            .into_iter()
            .map(|task| self.spawn(task.id))
            .collect()
    }

    /// Run a task in the background. A task that is already running is
    /// left alone and the returned handle finishes immediately.
    pub fn spawn(self: &Arc<Self>, task_id: String) -> JoinHandle<()> {
        let Some(cancel) = self.reserve(&task_id) else {
            debug!(task_id = %task_id, "Task already running, not spawning again");
            return tokio::spawn(async {});
        };
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = runner.run_reserved(&task_id, cancel).await {
                warn!(task_id = %task_id, error = %e, "Task run aborted");
            }
        })
    }

    /// Cancel a running task. Returns whether it was running.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(task_id)
    }

    /// Run a task until it reaches a terminal status.
    pub async fn run(&self, task_id: &str) -> Result<Task> {
        let cancel = self.reserve(task_id).ok_or_else(|| TaskError::AlreadyRunning {
            id: task_id.to_string(),
        })?;
        self.run_reserved(task_id, cancel).await
    }

    /// Check-and-insert into the running set under one lock.
    fn reserve(&self, task_id: &str) -> Option<CancellationToken> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.contains_key(task_id) {
            return None;
        }
        let cancel = CancellationToken::new();
        running.insert(task_id.to_string(), cancel.clone());
        Some(cancel)
    }

    async fn run_reserved(&self, task_id: &str, cancel: CancellationToken) -> Result<Task> {
        let result = self.run_attempts(task_id, &cancel).await;

        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id);
        result
    }

    async fn run_attempts(&self, task_id: &str, cancel: &CancellationToken) -> Result<Task> {
        loop {
            let task = self.queue.start_attempt(task_id).await?;
            info!(task_id = %task_id, attempt = task.attempt, "Task started");

            let outcome = self.attempt(&task, cancel).await;

            let (status, patch) = match outcome {
                Ok(content) => (TaskStatus::Succeeded, TaskPatch::result(content)),
                Err(e) if e.is_cancelled() => (TaskStatus::Failed, TaskPatch::error("cancelled")),
                Err(e) if e.is_retryable() && task.attempt + 1 < self.max_attempts => {
                    warn!(task_id = %task_id, attempt = task.attempt, error = %e, "Task attempt failed, retrying");
                    self.queue
                        .update_task_status(task_id, TaskStatus::Retrying, TaskPatch::error(e.to_string()))
                        .await?;
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let task = self
                                .queue
                                .update_task_status(task_id, TaskStatus::Failed, TaskPatch::error("cancelled"))
                                .await?;
                            return Ok(task);
                        }
                        _ = tokio::time::sleep(self.retry_delay) => continue,
                    }
                }
                Err(e) => (TaskStatus::Failed, TaskPatch::error(e.to_string())),
            };

            let task = self.queue.update_task_status(task_id, status, patch).await?;
            info!(task_id = %task_id, status = %task.status, "Task finished");
            return Ok(task);
        }
    }

    /// One dispatch. Chunks are appended to the task as they stream in.
    async fn attempt(&self, task: &Task, cancel: &CancellationToken) -> Result<String> {
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<String>();
        let queue = Arc::clone(&self.queue);
        let task_id = task.id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                let _ = queue
                    .update_task_status(&task_id, TaskStatus::Processing, TaskPatch::append(chunk))
                    .await;
            }
        });

        let result = self
            .dispatcher
            .dispatch(task.payload.kind, task.payload.clone(), cancel, |chunk| {
                let _ = chunk_tx.send(chunk.to_string());
            })
            .await
            .map(|(content, _)| content);

        drop(chunk_tx);
        let _ = forwarder.await;
        result
    }
}
