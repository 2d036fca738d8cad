//! Claim protocol: ask the background host, once per workflow id, whether
//! unresolved work is still alive, and reconcile the local copy.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::model::{Workflow, WorkflowStatus};
use crate::bridge::{BridgeClient, ClaimReply};
use crate::config::SyncConfig;
use crate::error::BridgeError;
use crate::store::RecordStore;

/// Reason used when the host rejects a claim without saying why.
pub const LOST_WORK_MESSAGE: &str = "background work was lost";

/// Reason used when the host cannot be reached.
pub const UNREACHABLE_MESSAGE: &str = "background host is unreachable";

/// Whether `workflow` shows unresolved work that only the host can settle.
///
/// True for `pending`/`running` workflows, and for terminal workflows that
/// still carry a `pending` or `running` step.
pub fn needs_claim(workflow: &Workflow) -> bool {
    matches!(
        workflow.status,
        WorkflowStatus::Pending | WorkflowStatus::Running
    ) || workflow.has_unresolved_steps()
}

/// The side of the bridge a claim travels over.
#[async_trait]
pub trait ClaimChannel: Send + Sync {
    /// Wait until the channel is initialized. `false` on timeout.
    async fn wait_initialized(&self, timeout: Duration) -> bool;

    /// Send a claim and wait at most `timeout` for the host to answer.
    async fn claim(&self, workflow_id: &str, timeout: Duration)
    -> Result<ClaimReply, BridgeError>;
}

#[async_trait]
impl ClaimChannel for BridgeClient {
    async fn wait_initialized(&self, timeout: Duration) -> bool {
        BridgeClient::wait_initialized(self, timeout).await
    }

    async fn claim(
        &self,
        workflow_id: &str,
        timeout: Duration,
    ) -> Result<ClaimReply, BridgeError> {
        BridgeClient::claim(self, workflow_id, timeout).await
    }
}

/// Outcome of a claim.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimResolution {
    /// A claim for this id was already dispatched by this coordinator.
    AlreadyClaimed,
    /// The workflow shows no unresolved work.
    NotNeeded,
    /// The host is still running it; polling will pick up further changes.
    Live { status: WorkflowStatus },
    /// The host reports a terminal status.
    Resolved {
        status: WorkflowStatus,
        error: Option<String>,
    },
    /// The work cannot be recovered.
    Failed { error: String },
}

impl ClaimResolution {
    fn from_reply(reply: ClaimReply) -> Self {
        match reply {
            ClaimReply {
                accepted: true,
                status: Some(status),
                error,
            } if status.is_terminal() => Self::Resolved { status, error },
            ClaimReply {
                accepted: true,
                status,
                ..
            } => Self::Live {
                status: status.unwrap_or(WorkflowStatus::Running),
            },
            ClaimReply {
                accepted: false,
                error,
                ..
            } => Self::Failed {
                error: error.unwrap_or_else(|| LOST_WORK_MESSAGE.to_string()),
            },
        }
    }

    /// Reconcile a local copy. Returns whether it changed.
    pub fn apply_to(&self, workflow: &mut Workflow) -> bool {
        let before = workflow.clone();
        match self {
            Self::AlreadyClaimed | Self::NotNeeded => return false,
            Self::Live { status } => workflow.status = *status,
            Self::Resolved { status, error } => {
                let error = error.clone().or_else(|| workflow.error.clone());
                workflow.finish(*status, error);
                // An already-terminal copy keeps its completion time.
                if before.completed_at.is_some() {
                    workflow.completed_at = before.completed_at;
                }
            }
            Self::Failed { error } => {
                workflow.finish(WorkflowStatus::Failed, Some(error.clone()));
            }
        }
        *workflow != before
    }
}

/// Dispatches at most one claim per workflow id over its lifetime.
pub struct ClaimCoordinator {
    channel: Arc<dyn ClaimChannel>,
    store: Option<Arc<dyn RecordStore>>,
    init_wait: Duration,
    claim_timeout: Duration,
    claimed: Mutex<HashSet<String>>,
}

impl ClaimCoordinator {
    pub fn new(channel: Arc<dyn ClaimChannel>, config: &SyncConfig) -> Arc<Self> {
        Arc::new(Self {
            channel,
            store: None,
            init_wait: config.init_wait_timeout,
            claim_timeout: config.claim_timeout,
            claimed: Mutex::new(HashSet::new()),
        })
    }

    /// Also write reconciled workflows back to `store`.
    pub fn with_store(
        channel: Arc<dyn ClaimChannel>,
        store: Arc<dyn RecordStore>,
        config: &SyncConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            store: Some(store),
            init_wait: config.init_wait_timeout,
            claim_timeout: config.claim_timeout,
            claimed: Mutex::new(HashSet::new()),
        })
    }

    pub fn is_claimed(&self, workflow_id: &str) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(workflow_id)
    }

    /// Run the claim procedure for `workflow` without touching it.
    pub async fn claim(&self, workflow: &Workflow) -> ClaimResolution {
        if !needs_claim(workflow) {
            return ClaimResolution::NotNeeded;
        }

        // Check-and-insert under one lock.
        let first = self
            .claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(workflow.id.clone());
        if !first {
            debug!(workflow_id = %workflow.id, "Workflow already claimed");
            return ClaimResolution::AlreadyClaimed;
        }

        if !self.channel.wait_initialized(self.init_wait).await {
            warn!(workflow_id = %workflow.id, wait = ?self.init_wait, "Bridge not initialized, claim abandoned");
            return ClaimResolution::Failed {
                error: UNREACHABLE_MESSAGE.to_string(),
            };
        }

        let resolution = match self.channel.claim(&workflow.id, self.claim_timeout).await {
            Ok(reply) => ClaimResolution::from_reply(reply),
            Err(e) if e.is_connectivity() => ClaimResolution::Failed {
                error: format!("{UNREACHABLE_MESSAGE}: {e}"),
            },
            Err(e) => ClaimResolution::Failed {
                error: e.to_string(),
            },
        };
        info!(workflow_id = %workflow.id, resolution = ?resolution, "Workflow claimed");
        resolution
    }

    /// Claim and reconcile `workflow` in place, persisting the result when a
    /// store is attached.
    pub async fn claim_and_reconcile(&self, workflow: &mut Workflow) -> ClaimResolution {
        let resolution = self.claim(workflow).await;
        if resolution.apply_to(workflow)
            && let Some(ref store) = self.store
            && let Err(e) = store.put_workflow(workflow).await
        {
            warn!(workflow_id = %workflow.id, error = %e, "Failed to persist reconciled workflow");
        }
        resolution
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::bridge::{Connection, Connector, Event, Request};
    use crate::store::MemoryStore;
    use crate::workflows::model::{StepStatus, WorkflowStep};

    struct FakeChannel {
        ready: bool,
        reply: Result<ClaimReply, BridgeError>,
        claims: AtomicUsize,
    }

    impl FakeChannel {
        fn replying(reply: ClaimReply) -> Arc<Self> {
            Arc::new(Self {
                ready: true,
                reply: Ok(reply),
                claims: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ClaimChannel for FakeChannel {
        async fn wait_initialized(&self, timeout: Duration) -> bool {
            if !self.ready {
                tokio::time::sleep(timeout).await;
            }
            self.ready
        }

        async fn claim(
            &self,
            _workflow_id: &str,
            _timeout: Duration,
        ) -> Result<ClaimReply, BridgeError> {
            self.claims.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.reply.clone()
        }
    }

    /// A connected host that reads requests but never answers them.
    #[derive(Default)]
    struct SilentConnector {
        claims: Arc<AtomicUsize>,
        ends: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
    }

    impl SilentConnector {
        fn claims_seen(&self) -> usize {
            self.claims.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for SilentConnector {
        fn target(&self) -> String {
            "silent".to_string()
        }

        async fn connect(&self) -> Result<Connection, BridgeError> {
            let (req_tx, mut req_rx) = mpsc::unbounded_channel::<Request>();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let claims = Arc::clone(&self.claims);
            tokio::spawn(async move {
                while let Some(request) = req_rx.recv().await {
                    if matches!(request, Request::Claim { .. }) {
                        claims.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
            self.ends.lock().unwrap().push(event_tx);
            Ok(Connection {
                requests: req_tx,
                events: event_rx,
            })
        }
    }

    fn running_workflow(id: &str) -> Workflow {
        Workflow::new(
            id,
            vec![
                WorkflowStep::new("generate_image", json!({}), "Draw")
                    .with_id("s1")
                    .with_status(StepStatus::Completed),
                WorkflowStep::new("insert", json!({}), "Insert")
                    .with_id("s2")
                    .with_status(StepStatus::Running),
            ],
        )
        .with_status(WorkflowStatus::Running)
    }

    #[test]
    fn needs_claim_cases() {
        assert!(needs_claim(&running_workflow("w")));
        assert!(needs_claim(
            &Workflow::new("w", vec![]).with_status(WorkflowStatus::Pending)
        ));

        // Terminal with a running step is an inconsistent snapshot.
        let inconsistent = running_workflow("w").with_status(WorkflowStatus::Completed);
        assert!(needs_claim(&inconsistent));

        let mut done = running_workflow("w");
        done.finish(WorkflowStatus::Completed, None);
        assert!(!needs_claim(&done));
    }

    #[tokio::test]
    async fn concurrent_claims_dispatch_once() {
        let channel = FakeChannel::replying(ClaimReply::accepted(WorkflowStatus::Running, None));
        let coordinator = ClaimCoordinator::new(channel.clone(), &SyncConfig::default());
        let workflow = running_workflow("w2");

        let results = futures::future::join_all(
            (0..8).map(|_| coordinator.claim(&workflow)),
        )
        .await;

        assert_eq!(channel.claims.load(Ordering::SeqCst), 1);
        let live = results
            .iter()
            .filter(|r| matches!(r, ClaimResolution::Live { .. }))
            .count();
        let skipped = results
            .iter()
            .filter(|r| **r == ClaimResolution::AlreadyClaimed)
            .count();
        assert_eq!((live, skipped), (1, 7));
        assert!(coordinator.is_claimed("w2"));
    }

    #[tokio::test]
    async fn terminal_reply_resolves() {
        let channel = FakeChannel::replying(ClaimReply::accepted(
            WorkflowStatus::Failed,
            Some("step exploded".to_string()),
        ));
        let coordinator = ClaimCoordinator::new(channel, &SyncConfig::default());
        let mut workflow = running_workflow("w1");

        let resolution = coordinator.claim_and_reconcile(&mut workflow).await;
        assert_eq!(
            resolution,
            ClaimResolution::Resolved {
                status: WorkflowStatus::Failed,
                error: Some("step exploded".to_string()),
            }
        );
        assert_eq!(workflow.status, WorkflowStatus::Failed);
        assert_eq!(workflow.step("s2").unwrap().status, StepStatus::Failed);
        assert!(!workflow.is_inconsistent());
    }

    #[tokio::test]
    async fn rejection_without_reason_uses_default() {
        let store = Arc::new(MemoryStore::new());
        let channel = FakeChannel::replying(ClaimReply::rejected(None));
        let coordinator =
            ClaimCoordinator::with_store(channel, store.clone(), &SyncConfig::default());
        let mut workflow = running_workflow("w3");

        let resolution = coordinator.claim_and_reconcile(&mut workflow).await;
        assert_eq!(
            resolution,
            ClaimResolution::Failed {
                error: LOST_WORK_MESSAGE.to_string()
            }
        );
        assert_eq!(workflow.error.as_deref(), Some(LOST_WORK_MESSAGE));

        let stored = store.get_workflow("w3").await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn uninitialized_channel_fails_with_connectivity_message() {
        let channel = Arc::new(FakeChannel {
            ready: false,
            reply: Ok(ClaimReply::accepted(WorkflowStatus::Running, None)),
            claims: AtomicUsize::new(0),
        });
        let coordinator = ClaimCoordinator::new(channel.clone(), &SyncConfig::default());

        let resolution = coordinator.claim(&running_workflow("w4")).await;
        assert_eq!(
            resolution,
            ClaimResolution::Failed {
                error: UNREACHABLE_MESSAGE.to_string()
            }
        );
        assert_eq!(channel.claims.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disconnected_claim_reports_connectivity() {
        let channel = Arc::new(FakeChannel {
            ready: true,
            reply: Err(BridgeError::Disconnected("gone".to_string())),
            claims: AtomicUsize::new(0),
        });
        let coordinator = ClaimCoordinator::new(channel, &SyncConfig::default());
        match coordinator.claim(&running_workflow("w5")).await {
            ClaimResolution::Failed { error } => assert!(error.starts_with(UNREACHABLE_MESSAGE)),
            other => panic!("Expected Failed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_claim_fails_after_timeout() {
        let connector = Arc::new(SilentConnector::default());
        let client = BridgeClient::new(connector.clone());
        client.initialize().await.unwrap();
        let config = SyncConfig {
            claim_timeout: Duration::from_secs(3),
            ..SyncConfig::default()
        };
        let coordinator = ClaimCoordinator::new(client, &config);

        let resolution = tokio::time::timeout(
            Duration::from_secs(60),
            coordinator.claim(&running_workflow("w7")),
        )
        .await
        .expect("claim should resolve on its own");
        match resolution {
            ClaimResolution::Failed { error } => assert!(error.starts_with(UNREACHABLE_MESSAGE)),
            other => panic!("Expected Failed, got {other:?}"),
        }
        assert_eq!(connector.claims_seen(), 1);
    }

    #[tokio::test]
    async fn settled_workflow_is_not_claimed() {
        let channel = FakeChannel::replying(ClaimReply::rejected(None));
        let coordinator = ClaimCoordinator::new(channel.clone(), &SyncConfig::default());
        let mut workflow = running_workflow("w6");
        workflow.finish(WorkflowStatus::Completed, None);

        assert_eq!(
            coordinator.claim(&workflow).await,
            ClaimResolution::NotNeeded
        );
        assert_eq!(channel.claims.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn live_resolution_keeps_steps() {
        let mut workflow = running_workflow("w").with_status(WorkflowStatus::Pending);
        let changed = ClaimResolution::Live {
            status: WorkflowStatus::Running,
        }
        .apply_to(&mut workflow);
        assert!(changed);
        assert_eq!(workflow.step("s2").unwrap().status, StepStatus::Running);
    }
}
