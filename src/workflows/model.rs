//! Workflow data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Overall status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Status of a single workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    /// Waiting for the foreground to run a step the host cannot.
    PendingMainThread,
}

impl StepStatus {
    /// `pending` and `running` are the states a terminal workflow must not
    /// contain.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// One stage of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    /// Name of the step handler that runs this step.
    pub mcp: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub description: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Execution time in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

impl WorkflowStep {
    pub fn new(
        mcp: impl Into<String>,
        args: serde_json::Value,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            mcp: mcp.into(),
            args,
            description: description.into(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            duration: None,
            options: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = status;
        self
    }
}

/// A multi-step unit of orchestrated work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            id: id.into(),
            status: WorkflowStatus::Pending,
            steps,
            error: None,
            completed_at: None,
        }
    }

    pub fn with_status(mut self, status: WorkflowStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut WorkflowStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Whether any step is still `pending` or `running`.
    pub fn has_unresolved_steps(&self) -> bool {
        self.steps.iter().any(|s| s.status.is_unresolved())
    }

    /// A terminal workflow that still has unresolved steps.
    pub fn is_inconsistent(&self) -> bool {
        self.is_terminal() && self.has_unresolved_steps()
    }

    /// Move to a terminal status and close out unresolved steps so the
    /// terminal invariant holds: running steps inherit the failure (or are
    /// skipped on success/cancel), pending steps are skipped.
    pub fn finish(&mut self, status: WorkflowStatus, error: Option<String>) {
        debug_assert!(status.is_terminal());
        for step in &mut self.steps {
            match step.status {
                StepStatus::Running if status == WorkflowStatus::Failed => {
                    step.status = StepStatus::Failed;
                    if step.error.is_none() {
                        step.error = error.clone();
                    }
                }
                StepStatus::Running | StepStatus::Pending => step.status = StepStatus::Skipped,
                _ => {}
            }
        }
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
    }
}
