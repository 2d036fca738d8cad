//! Wire protocol between the foreground and the background host.
//!
//! Frames are JSON objects tagged by `type`. The same enums are used by the
//! in-process connector, so both transports carry identical messages.

use serde::{Deserialize, Serialize};

use crate::llm::GenerationRequest;
use crate::workflows::model::{Workflow, WorkflowStatus};

/// Foreground → host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Begin a generation; progress is reported under `correlation_id`.
    Start {
        correlation_id: String,
        params: GenerationRequest,
    },
    /// Abort a running generation.
    Stop { correlation_id: String },
    /// Ask for the authoritative status of a workflow.
    Claim { workflow_id: String },
    /// Liveness probe.
    Ping { nonce: u64 },
    /// Execute a workflow in the host.
    RunWorkflow { workflow: Workflow },
}

/// Host → foreground.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Chunk {
        correlation_id: String,
        content: String,
    },
    Done {
        correlation_id: String,
        content: String,
    },
    Error {
        correlation_id: String,
        message: String,
    },
    Pong { nonce: u64 },
    ClaimResult {
        workflow_id: String,
        #[serde(flatten)]
        reply: ClaimReply,
    },
}

/// The host's answer to a claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimReply {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkflowStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ClaimReply {
    pub fn accepted(status: WorkflowStatus, error: Option<String>) -> Self {
        Self {
            accepted: true,
            status: Some(status),
            error,
        }
    }

    pub fn rejected(error: Option<String>) -> Self {
        Self {
            accepted: false,
            status: None,
            error,
        }
    }
}
