//! Task records, their status machine, and queue change events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::GenerationRequest;

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be scheduled.
    Pending,
    /// Being executed.
    Processing,
    /// A failed attempt is waiting for its next try.
    Retrying,
    /// Finished with a result.
    Succeeded,
    /// Finished without a result.
    Failed,
}

impl TaskStatus {
    /// Check if this status allows moving to `target`.
    ///
    /// Re-entering the current status is allowed so that progress patches can
    /// be applied without a transition.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        *self == target
            || matches!(
                (self, target),
                (Pending, Processing) | (Pending, Failed) |
                (Processing, Succeeded) | (Processing, Failed) |
                (Processing, Retrying) | (Processing, Pending) |
                (Retrying, Processing) | (Retrying, Pending) | (Retrying, Failed) |
                // Manual retry of a failed task
                (Failed, Pending)
            )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One unit of background AI work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub payload: GenerationRequest,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    /// Create a new pending task with a fresh id.
    pub fn new(payload: GenerationRequest) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: TaskStatus::Pending,
            payload,
            attempt: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// Apply a status change and its timestamp side effects.
    pub(crate) fn apply_status(&mut self, status: TaskStatus) {
        if status == self.status {
            return;
        }
        match status {
            TaskStatus::Processing => {
                self.started_at = Some(Utc::now());
                self.completed_at = None;
                self.error = None;
            }
            TaskStatus::Retrying => {
                self.attempt += 1;
            }
            TaskStatus::Pending => {
                self.started_at = None;
                self.completed_at = None;
            }
            TaskStatus::Succeeded | TaskStatus::Failed => {
                self.completed_at = Some(Utc::now());
            }
        }
        self.status = status;
    }

    /// Reset interrupted work found at startup.
    ///
    /// Returns `true` if the task was `processing` and has been reset.
    pub(crate) fn recover_interrupted(&mut self) -> bool {
        if self.status != TaskStatus::Processing {
            return false;
        }
        self.status = TaskStatus::Pending;
        self.started_at = None;
        true
    }
}

/// Partial update applied together with a status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    /// Replace the result.
    pub result: Option<String>,
    /// Append to the result (streamed chunks).
    pub append: Option<String>,
    /// Replace the error message.
    pub error: Option<String>,
}

impl TaskPatch {
    pub fn result(text: impl Into<String>) -> Self {
        Self {
            result: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn append(chunk: impl Into<String>) -> Self {
        Self {
            append: Some(chunk.into()),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub(crate) fn apply(self, task: &mut Task) {
        if let Some(result) = self.result {
            task.result = Some(result);
        }
        if let Some(chunk) = self.append {
            task.result.get_or_insert_with(String::new).push_str(&chunk);
        }
        if let Some(error) = self.error {
            task.error = Some(error);
        }
    }
}

/// Change events emitted by the task queue.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// A task was submitted.
    Created { task: Task },
    /// A task changed status or content.
    Updated { task: Task },
    /// A task was removed.
    Removed { id: String },
    /// The queue was seeded from the store.
    Restored { count: usize, recovered: usize },
    /// Persistence has failed this many times in a row.
    PersistenceDegraded { consecutive_failures: u32 },
}
