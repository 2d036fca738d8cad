//! Debounced persistence of the task list.
//!
//! A single writer task owns the debounce timer. Every change re-arms it;
//! when it finally fires, the *current* task list is read and written, so a
//! write never carries state older than the change that scheduled it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use tracing::{debug, error, warn};

use super::model::{Task, TaskEvent};
use crate::error::StoreError;
use crate::store::RecordStore;

enum Command {
    /// A mutation happened; re-arm the timer.
    Touch,
    /// Write now and report the outcome.
    Flush(oneshot::Sender<Result<(), StoreError>>),
}

/// Handle to the debounced writer task.
///
/// Dropping the handle closes the command channel; a write that is still
/// armed at that point is performed before the task exits.
pub(crate) struct DebouncedWriter {
    tx: mpsc::UnboundedSender<Command>,
}

impl DebouncedWriter {
    pub fn spawn(
        tasks: Arc<RwLock<Vec<Task>>>,
        store: Arc<dyn RecordStore>,
        window: Duration,
        failure_threshold: Option<u32>,
        events: broadcast::Sender<TaskEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            tasks,
            store,
            window,
            failure_threshold,
            events,
            consecutive_failures: 0,
        };
        tokio::spawn(worker.run(rx));
        Self { tx }
    }

    /// Schedule a write after the debounce window, resetting any pending one.
    pub fn touch(&self) {
        let _ = self.tx.send(Command::Touch);
    }

    /// Write immediately.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply_tx))
            .map_err(|_| StoreError::Unavailable("persistence task stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| StoreError::Unavailable("persistence task stopped".to_string()))?
    }
}

struct Worker {
    tasks: Arc<RwLock<Vec<Task>>>,
    store: Arc<dyn RecordStore>,
    window: Duration,
    failure_threshold: Option<u32>,
    events: broadcast::Sender<TaskEvent>,
    consecutive_failures: u32,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        // Idle: nothing to write until a command arrives.
        while let Some(cmd) = rx.recv().await {
            if let Command::Flush(reply) = cmd {
                let _ = reply.send(self.write().await);
                continue;
            }

            // Armed: each Touch restarts the window; a failed write re-arms it.
            loop {
                tokio::select! {
                    cmd = rx.recv() => match cmd {
                        Some(Command::Touch) => continue,
                        Some(Command::Flush(reply)) => {
                            let result = self.write().await;
                            let ok = result.is_ok();
                            let _ = reply.send(result);
                            if ok {
                                break;
                            }
                        }
                        None => {
                            let _ = self.write().await;
                            return;
                        }
                    },
                    _ = tokio::time::sleep(self.window) => {
                        if self.write().await.is_ok() {
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn write(&mut self) -> Result<(), StoreError> {
        let snapshot = self.tasks.read().await.clone();
        match self.store.save_tasks(&snapshot).await {
            Ok(()) => {
                if self.consecutive_failures > 0 {
                    debug!(
                        after_failures = self.consecutive_failures,
                        "Task persistence recovered"
                    );
                }
                self.consecutive_failures = 0;
                debug!(count = snapshot.len(), "Persisted task list");
                Ok(())
            }
            Err(e) => {
                self.consecutive_failures += 1;
                error!(
                    error = %e,
                    consecutive_failures = self.consecutive_failures,
                    "Failed to persist task list, retrying next window"
                );
                if self.failure_threshold == Some(self.consecutive_failures) {
                    warn!(
                        consecutive_failures = self.consecutive_failures,
                        "Task persistence degraded"
                    );
                    let _ = self.events.send(TaskEvent::PersistenceDegraded {
                        consecutive_failures: self.consecutive_failures,
                    });
                }
                Err(e)
            }
        }
    }
}
