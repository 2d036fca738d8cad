//! The background host: the long-lived side of the bridge.
//!
//! It executes generation requests and workflows on behalf of foreground
//! connections, answers claims, and persists every workflow transition so
//! that a foreground reload can pick the state back up from the store.

pub mod server;
pub mod steps;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::protocol::{ClaimReply, Event, Request};
use crate::bridge::transport::Connection;
use crate::error::{ProviderError, StepError};
use crate::llm::{GenerationProvider, GenerationRequest, stream_generation};
use crate::store::RecordStore;
use crate::workflows::model::{StepStatus, Workflow, WorkflowStatus};
use steps::{StepContext, StepRegistry};

/// Reason recorded on a workflow that was still marked running in the store
/// but had no live run in this host.
pub const ORPHANED_MESSAGE: &str = "workflow stopped when the background host restarted";

type ActiveGenerations = Arc<Mutex<HashMap<String, CancellationToken>>>;

pub struct Host {
    store: Arc<dyn RecordStore>,
    provider: Arc<dyn GenerationProvider>,
    steps: Arc<StepRegistry>,
    runs: Mutex<HashMap<String, CancellationToken>>,
}

impl Host {
    pub fn new(
        store: Arc<dyn RecordStore>,
        provider: Arc<dyn GenerationProvider>,
        steps: Arc<StepRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            provider,
            steps,
            runs: Mutex::new(HashMap::new()),
        })
    }

    /// Open a new foreground connection.
    pub fn connect(self: &Arc<Self>) -> Connection {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(Arc::clone(self).serve(req_rx, event_tx));
        Connection {
            requests: req_tx,
            events: event_rx,
        }
    }

    async fn serve(
        self: Arc<Self>,
        mut requests: mpsc::UnboundedReceiver<Request>,
        events: mpsc::UnboundedSender<Event>,
    ) {
        let active: ActiveGenerations = Arc::new(Mutex::new(HashMap::new()));
        debug!("Bridge connection opened");

        while let Some(request) = requests.recv().await {
            match request {
                Request::Start {
                    correlation_id,
                    params,
                } => self.start_generation(correlation_id, params, &active, &events),
                Request::Stop { correlation_id } => {
                    let token = active
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&correlation_id);
                    match token {
                        Some(token) => {
                            token.cancel();
                            info!(correlation_id = %correlation_id, "Generation stopped");
                        }
                        None => debug!(correlation_id = %correlation_id, "Stop for unknown generation"),
                    }
                }
                Request::Claim { workflow_id } => {
                    let host = Arc::clone(&self);
                    let events = events.clone();
                    tokio::spawn(async move {
                        let reply = host.answer_claim(&workflow_id).await;
                        let _ = events.send(Event::ClaimResult { workflow_id, reply });
                    });
                }
                Request::Ping { nonce } => {
                    let _ = events.send(Event::Pong { nonce });
                }
                Request::RunWorkflow { workflow } => {
                    self.run_workflow(workflow);
                }
            }
        }

        // Nobody is left to read the output of this connection's generations.
        let abandoned: Vec<_> = active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (_, token) in &abandoned {
            token.cancel();
        }
        debug!(abandoned = abandoned.len(), "Bridge connection closed");
    }

    fn start_generation(
        &self,
        correlation_id: String,
        params: GenerationRequest,
        active: &ActiveGenerations,
        events: &mpsc::UnboundedSender<Event>,
    ) {
        let token = CancellationToken::new();
        {
            let mut active = active.lock().unwrap_or_else(|e| e.into_inner());
            if active.contains_key(&correlation_id) {
                let _ = events.send(Event::Error {
                    correlation_id,
                    message: "duplicate correlation id".to_string(),
                });
                return;
            }
            active.insert(correlation_id.clone(), token.clone());
        }
        info!(correlation_id = %correlation_id, kind = %params.kind, "Generation started");

        let provider = Arc::clone(&self.provider);
        let active = Arc::clone(active);
        let events = events.clone();
        tokio::spawn(async move {
            let chunk_events = events.clone();
            let chunk_id = correlation_id.clone();
            let result = stream_generation(provider.as_ref(), &params, &token, |chunk| {
                let _ = chunk_events.send(Event::Chunk {
                    correlation_id: chunk_id.clone(),
                    content: chunk.to_string(),
                });
            })
            .await;

            active
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&correlation_id);

            match result {
                Ok(content) => {
                    debug!(correlation_id = %correlation_id, "Generation finished");
                    let _ = events.send(Event::Done {
                        correlation_id,
                        content,
                    });
                }
                Err(ProviderError::Cancelled) => {}
                Err(e) => {
                    warn!(correlation_id = %correlation_id, error = %e, "Generation failed");
                    let _ = events.send(Event::Error {
                        correlation_id,
                        message: e.to_string(),
                    });
                }
            }
        });
    }

    // ── Claims ──────────────────────────────────────────────────────

    /// Authoritative status of a workflow, from live runs first, then the store.
    pub async fn answer_claim(&self, workflow_id: &str) -> ClaimReply {
        let live = self.is_running(workflow_id);

        match self.store.get_workflow(workflow_id).await {
            Ok(Some(workflow)) if live => ClaimReply::accepted(workflow.status, None),
            Ok(None) if live => ClaimReply::accepted(WorkflowStatus::Running, None),
            Ok(Some(workflow)) if workflow.is_terminal() => {
                ClaimReply::accepted(workflow.status, workflow.error.clone())
            }
            Ok(Some(mut orphan)) => {
                // Recorded as running, but nothing here is executing it.
                orphan.finish(WorkflowStatus::Failed, Some(ORPHANED_MESSAGE.to_string()));
                self.persist(&orphan).await;
                info!(workflow_id = %workflow_id, "Claimed orphaned workflow, marked failed");
                ClaimReply::rejected(Some(ORPHANED_MESSAGE.to_string()))
            }
            Ok(None) => ClaimReply::rejected(None),
            Err(e) if live => {
                debug!(workflow_id = %workflow_id, error = %e, "Store unavailable, answering from live run");
                ClaimReply::accepted(WorkflowStatus::Running, None)
            }
            Err(e) => ClaimReply::rejected(Some(format!("workflow store unavailable: {e}"))),
        }
    }

    // ── Workflows ───────────────────────────────────────────────────

    pub fn is_running(&self, workflow_id: &str) -> bool {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(workflow_id)
    }

    /// Names of the step handlers this host can run.
    pub async fn step_names(&self) -> Vec<String> {
        self.steps.list().await
    }

    pub fn running_count(&self) -> usize {
        self.runs.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Start executing `workflow` in the background. Returns `false` if a run
    /// with the same id is already live.
    pub fn run_workflow(self: &Arc<Self>, workflow: Workflow) -> bool {
        let cancel = CancellationToken::new();
        {
            let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
            if runs.contains_key(&workflow.id) {
                warn!(workflow_id = %workflow.id, "Workflow already running, ignoring");
                return false;
            }
            runs.insert(workflow.id.clone(), cancel.clone());
        }

        let host = Arc::clone(self);
        tokio::spawn(async move {
            let id = workflow.id.clone();
            let finished = host.execute_workflow(workflow, cancel).await;
            host.runs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            info!(workflow_id = %id, status = %finished.status, "Workflow finished");
        });
        true
    }

    /// Cancel a live run. Returns whether it was running.
    pub fn cancel_workflow(&self, workflow_id: &str) -> bool {
        match self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(workflow_id)
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run the pending steps of `workflow` in order, persisting after every
    /// transition. Steps that are not `pending` are left as they are.
    pub async fn execute_workflow(&self, mut workflow: Workflow, cancel: CancellationToken) -> Workflow {
        workflow.status = WorkflowStatus::Running;
        workflow.error = None;
        workflow.completed_at = None;
        self.persist(&workflow).await;
        info!(workflow_id = %workflow.id, steps = workflow.steps.len(), "Workflow started");

        let mut previous: HashMap<String, serde_json::Value> = workflow
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .filter_map(|s| Some((s.id.clone(), s.result.clone()?)))
            .collect();

        for index in 0..workflow.steps.len() {
            if workflow.steps[index].status != StepStatus::Pending {
                continue;
            }
            if cancel.is_cancelled() {
                workflow.finish(WorkflowStatus::Cancelled, None);
                self.persist(&workflow).await;
                return workflow;
            }

            workflow.steps[index].status = StepStatus::Running;
            self.persist(&workflow).await;

            let step = workflow.steps[index].clone();
            let ctx = StepContext {
                workflow_id: workflow.id.clone(),
                step_id: step.id.clone(),
                previous: previous.clone(),
                cancel: cancel.clone(),
            };
            let started = Instant::now();
            let outcome = match self.steps.get(&step.mcp).await {
                Some(handler) => tokio::select! {
                    _ = cancel.cancelled() => None,
                    result = handler.run(&step.args, &ctx) => Some(result),
                },
                None => Some(Err(StepError::UnknownHandler(step.mcp.clone()))),
            };

            let current = &mut workflow.steps[index];
            current.duration = Some(started.elapsed().as_millis() as u64);
            match outcome {
                None => {
                    info!(workflow_id = %workflow.id, step_id = %step.id, "Workflow cancelled");
                    workflow.finish(WorkflowStatus::Cancelled, None);
                    self.persist(&workflow).await;
                    return workflow;
                }
                Some(Ok(result)) => {
                    current.status = StepStatus::Completed;
                    current.result = Some(result.clone());
                    previous.insert(step.id.clone(), result);
                    debug!(workflow_id = %workflow.id, step_id = %step.id, mcp = %step.mcp, "Step completed");
                    self.persist(&workflow).await;
                }
                Some(Err(e)) => {
                    let message = e.to_string();
                    current.status = StepStatus::Failed;
                    current.error = Some(message.clone());
                    warn!(workflow_id = %workflow.id, step_id = %step.id, mcp = %step.mcp, error = %message, "Step failed");
                    workflow.finish(
                        WorkflowStatus::Failed,
                        Some(format!("step '{}' failed: {message}", step.description)),
                    );
                    self.persist(&workflow).await;
                    return workflow;
                }
            }
        }

        workflow.finish(WorkflowStatus::Completed, None);
        self.persist(&workflow).await;
        workflow
    }

    async fn persist(&self, workflow: &Workflow) {
        if let Err(e) = self.store.put_workflow(workflow).await {
            warn!(workflow_id = %workflow.id, error = %e, "Failed to persist workflow");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::steps::StepHandler;
    use super::*;
    use crate::llm::testing::ScriptedProvider;
    use crate::store::MemoryStore;
    use crate::workflows::model::WorkflowStep;

    struct Echo;

    #[async_trait]
    impl StepHandler for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn run(&self, args: &Value, _ctx: &StepContext) -> Result<Value, StepError> {
            Ok(args.clone())
        }
    }

    struct Boom;

    #[async_trait]
    impl StepHandler for Boom {
        fn name(&self) -> &str {
            "boom"
        }

        async fn run(&self, _args: &Value, _ctx: &StepContext) -> Result<Value, StepError> {
            Err(StepError::ExecutionFailed("kaboom".to_string()))
        }
    }

    struct Slow;

    #[async_trait]
    impl StepHandler for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn run(&self, _args: &Value, _ctx: &StepContext) -> Result<Value, StepError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }
    }

    fn host(provider: ScriptedProvider) -> (Arc<MemoryStore>, Arc<Host>) {
        let store = Arc::new(MemoryStore::new());
        let steps = StepRegistry::new();
        steps.register_sync(Arc::new(Echo));
        steps.register_sync(Arc::new(Boom));
        steps.register_sync(Arc::new(Slow));
        let host = Host::new(store.clone(), Arc::new(provider), Arc::new(steps));
        (store, host)
    }

    fn step(mcp: &str, id: &str) -> WorkflowStep {
        WorkflowStep::new(mcp, json!({"n": id}), format!("{mcp} {id}")).with_id(id)
    }

    #[tokio::test]
    async fn steps_run_in_order_and_persist() {
        let (store, host) = host(ScriptedProvider::new(&[]));
        let workflow = Workflow::new("w1", vec![step("echo", "s1"), step("echo", "s2")]);

        let done = host
            .execute_workflow(workflow, CancellationToken::new())
            .await;
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(done.step("s2").unwrap().result, Some(json!({"n": "s2"})));
        assert!(done.steps.iter().all(|s| s.duration.is_some()));

        // start + (running, done) per step + finish
        assert_eq!(store.workflow_writes(), 6);
        assert_eq!(store.get_workflow("w1").await.unwrap().unwrap(), done);
    }

    #[tokio::test]
    async fn failing_step_fails_workflow_and_skips_rest() {
        let (_store, host) = host(ScriptedProvider::new(&[]));
        let workflow = Workflow::new(
            "w1",
            vec![step("echo", "s1"), step("boom", "s2"), step("echo", "s3")],
        );

        let done = host
            .execute_workflow(workflow, CancellationToken::new())
            .await;
        assert_eq!(done.status, WorkflowStatus::Failed);
        assert_eq!(done.step("s2").unwrap().status, StepStatus::Failed);
        assert_eq!(done.step("s3").unwrap().status, StepStatus::Skipped);
        assert!(done.error.unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn unknown_handler_fails_step() {
        let (_store, host) = host(ScriptedProvider::new(&[]));
        let workflow = Workflow::new("w1", vec![step("teleport", "s1")]);
        let done = host
            .execute_workflow(workflow, CancellationToken::new())
            .await;
        assert_eq!(done.status, WorkflowStatus::Failed);
        assert!(
            done.step("s1")
                .unwrap()
                .error
                .as_deref()
                .unwrap()
                .contains("teleport")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn claim_answers_from_live_run_then_store() {
        let (store, host) = host(ScriptedProvider::new(&[]));
        assert!(host.run_workflow(Workflow::new("w1", vec![step("slow", "s1")])));
        assert!(!host.run_workflow(Workflow::new("w1", vec![])));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let reply = host.answer_claim("w1").await;
        assert_eq!(reply, ClaimReply::accepted(WorkflowStatus::Running, None));

        assert!(host.cancel_workflow("w1"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!host.is_running("w1"));

        let stored = store.get_workflow("w1").await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Cancelled);
        assert_eq!(
            host.answer_claim("w1").await,
            ClaimReply::accepted(WorkflowStatus::Cancelled, None)
        );
    }

    #[tokio::test]
    async fn claim_for_orphan_marks_it_failed() {
        let (store, host) = host(ScriptedProvider::new(&[]));
        let orphan = Workflow::new("w1", vec![step("echo", "s1").with_status(StepStatus::Running)])
            .with_status(WorkflowStatus::Running);
        store.put_workflow(&orphan).await.unwrap();

        let reply = host.answer_claim("w1").await;
        assert!(!reply.accepted);
        assert_eq!(reply.error.as_deref(), Some(ORPHANED_MESSAGE));

        let stored = store.get_workflow("w1").await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Failed);
        assert!(!stored.is_inconsistent());

        assert_eq!(host.answer_claim("nope").await, ClaimReply::rejected(None));
    }

    #[tokio::test]
    async fn connection_streams_generation() {
        let (_store, host) = host(ScriptedProvider::new(&["he", "llo"]));
        let Connection {
            requests,
            mut events,
        } = host.connect();

        requests
            .send(Request::Start {
                correlation_id: "c1".to_string(),
                params: GenerationRequest::chat("hi"),
            })
            .unwrap();
        requests.send(Request::Ping { nonce: 7 }).unwrap();

        let mut received = Vec::new();
        while let Some(event) = events.recv().await {
            let done = matches!(event, Event::Done { .. });
            received.push(event);
            if done {
                break;
            }
        }
        assert!(received.contains(&Event::Pong { nonce: 7 }));
        let chunks: Vec<_> = received
            .iter()
            .filter_map(|e| match e {
                Event::Chunk { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec!["he", "llo"]);
        assert_eq!(
            received.last().unwrap(),
            &Event::Done {
                correlation_id: "c1".to_string(),
                content: "hello".to_string(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_without_done() {
        let (_store, host) = host(ScriptedProvider::new(&["a", "b"]).with_delay(Duration::from_secs(5)));
        let Connection {
            requests,
            mut events,
        } = host.connect();

        requests
            .send(Request::Start {
                correlation_id: "c1".to_string(),
                params: GenerationRequest::chat("hi"),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        requests
            .send(Request::Stop {
                correlation_id: "c1".to_string(),
            })
            .unwrap();
        requests.send(Request::Ping { nonce: 1 }).unwrap();

        // The pong arrives and nothing for c1 does.
        assert_eq!(events.recv().await.unwrap(), Event::Pong { nonce: 1 });
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(events.try_recv().is_err());
    }
}
