//! Foreground side of the background execution channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{ClaimReply, Event, Request};
use super::session::{Session, SessionTable};
use super::transport::Connector;
use crate::error::BridgeError;
use crate::llm::{GenerationKind, GenerationRequest};
use crate::workflows::model::Workflow;

/// Parameters for starting a generation session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Caller-chosen id that tags every event of this session.
    pub correlation_id: String,
    pub request: GenerationRequest,
}

impl SessionParams {
    pub fn new(request: GenerationRequest) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            request,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}

struct Link {
    requests: mpsc::UnboundedSender<Request>,
    epoch: u64,
}

/// State shared with the reader task.
struct Shared {
    link: Mutex<Option<Link>>,
    initialized: watch::Sender<bool>,
    sessions: Arc<SessionTable>,
    pongs: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    claims: Mutex<HashMap<String, Vec<oneshot::Sender<ClaimReply>>>>,
}

impl Shared {
    fn route(&self, event: Event) {
        match event {
            Event::Pong { nonce } => {
                let waiter = self
                    .pongs
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&nonce);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(());
                    }
                    None => debug!(nonce, "Dropping pong for unknown probe"),
                }
            }
            Event::ClaimResult { workflow_id, reply } => {
                let waiters = self
                    .claims
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&workflow_id)
                    .unwrap_or_default();
                if waiters.is_empty() {
                    debug!(workflow_id = %workflow_id, "Dropping unsolicited claim result");
                }
                for tx in waiters {
                    let _ = tx.send(reply.clone());
                }
            }
            stream_event => {
                self.sessions.dispatch(stream_event);
            }
        }
    }

    /// Forget waiters for `workflow_id` whose caller has gone away.
    fn drop_claim_waiters(&self, workflow_id: &str) {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(waiters) = claims.get_mut(workflow_id) {
            waiters.retain(|tx| !tx.is_closed());
            if waiters.is_empty() {
                claims.remove(workflow_id);
            }
        }
    }

    fn pending_claims(&self) -> usize {
        self.claims
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Tear down the link opened at `epoch`. A newer link is left alone.
    fn disconnect(&self, epoch: u64, reason: &str) {
        {
            let mut link = self.link.lock().unwrap_or_else(|e| e.into_inner());
            match link.as_ref() {
                Some(current) if current.epoch == epoch => *link = None,
                _ => return,
            }
        }
        self.initialized.send_replace(false);

        let failed = self
            .sessions
            .fail_all(BridgeError::Disconnected(reason.to_string()));
        // Dropping the senders wakes the waiters with an error.
        self.pongs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.claims
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        warn!(failed_sessions = failed, reason, "Bridge disconnected");
    }
}

struct PongWaiter<'a> {
    shared: &'a Shared,
    nonce: u64,
}

impl Drop for PongWaiter<'_> {
    fn drop(&mut self) {
        self.shared
            .pongs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.nonce);
    }
}

/// Client for the background host.
///
/// Construct once and share by `Arc`. All requests are multiplexed over one
/// connection; events are routed back by correlation id.
pub struct BridgeClient {
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    init_lock: tokio::sync::Mutex<()>,
    attempts: AtomicU64,
    last_failure: Mutex<Option<BridgeError>>,
    next_nonce: AtomicU64,
    next_epoch: AtomicU64,
}

impl BridgeClient {
    pub fn new(connector: Arc<dyn Connector>) -> Arc<Self> {
        let (initialized, _) = watch::channel(false);
        Arc::new(Self {
            connector,
            shared: Arc::new(Shared {
                link: Mutex::new(None),
                initialized,
                sessions: SessionTable::new(),
                pongs: Mutex::new(HashMap::new()),
                claims: Mutex::new(HashMap::new()),
            }),
            init_lock: tokio::sync::Mutex::new(()),
            attempts: AtomicU64::new(0),
            last_failure: Mutex::new(None),
            next_nonce: AtomicU64::new(1),
            next_epoch: AtomicU64::new(1),
        })
    }

    pub fn is_initialized(&self) -> bool {
        *self.shared.initialized.borrow()
    }

    /// Wait until the channel reports itself initialized.
    pub async fn wait_initialized(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.initialized.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        )
    }

    /// Open the channel. Idempotent.
    ///
    /// Concurrent callers share one attempt and its outcome. After a failed
    /// attempt, a later call tries again.
    pub async fn initialize(&self) -> Result<(), BridgeError> {
        if self.is_initialized() {
            return Ok(());
        }
        let seen = self.attempts.load(Ordering::SeqCst);
        let _guard = self.init_lock.lock().await;

        if self.is_initialized() {
            return Ok(());
        }
        if self.attempts.load(Ordering::SeqCst) != seen {
            // The attempt we were waiting on failed; report its outcome.
            if let Some(e) = self
                .last_failure
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
            {
                return Err(e);
            }
        }

        let result = self.connector.connect().await;
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let connection = match result {
            Ok(connection) => connection,
            Err(e) => {
                warn!(target_url = %self.connector.target(), error = %e, "Bridge initialization failed");
                *self
                    .last_failure
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(e.clone());
                return Err(e);
            }
        };

        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        *self.shared.link.lock().unwrap_or_else(|e| e.into_inner()) = Some(Link {
            requests: connection.requests,
            epoch,
        });
        *self
            .last_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
        self.shared.initialized.send_replace(true);

        let shared = Arc::clone(&self.shared);
        let mut events = connection.events;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                shared.route(event);
            }
            shared.disconnect(epoch, "channel closed");
        });

        info!(target_url = %self.connector.target(), "Bridge initialized");
        Ok(())
    }

    fn requests(&self) -> Result<mpsc::UnboundedSender<Request>, BridgeError> {
        self.shared
            .link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|link| link.requests.clone())
            .ok_or(BridgeError::NotInitialized)
    }

    fn send(&self, request: Request) -> Result<mpsc::UnboundedSender<Request>, BridgeError> {
        let requests = self.requests()?;
        requests
            .send(request)
            .map_err(|e| BridgeError::SendFailed(e.to_string()))?;
        Ok(requests)
    }

    /// Start a generation of `kind`. The channel is initialized on demand.
    pub async fn start(
        &self,
        kind: GenerationKind,
        params: SessionParams,
    ) -> Result<Session, BridgeError> {
        self.initialize().await?;

        let SessionParams {
            correlation_id,
            mut request,
        } = params;
        request.kind = kind;

        let (registration, events) = self.shared.sessions.register(&correlation_id)?;
        let requests = self.send(Request::Start {
            correlation_id: correlation_id.clone(),
            params: request,
        })?;
        debug!(correlation_id = %correlation_id, kind = %kind, "Session started");

        Ok(Session::new(correlation_id, registration, events, requests))
    }

    /// Stop a session by id. Its awaiter resolves with `Cancelled`.
    pub fn stop(&self, correlation_id: &str) {
        let _ = self.send(Request::Stop {
            correlation_id: correlation_id.to_string(),
        });
        self.shared.sessions.fail(
            correlation_id,
            BridgeError::Cancelled {
                correlation_id: correlation_id.to_string(),
            },
        );
    }

    pub async fn start_chat(&self, params: SessionParams) -> Result<Session, BridgeError> {
        self.start(GenerationKind::Chat, params).await
    }

    pub fn stop_chat(&self, correlation_id: &str) {
        self.stop(correlation_id)
    }

    pub async fn start_image(&self, params: SessionParams) -> Result<Session, BridgeError> {
        self.start(GenerationKind::Image, params).await
    }

    pub fn stop_image(&self, correlation_id: &str) {
        self.stop(correlation_id)
    }

    pub async fn start_video(&self, params: SessionParams) -> Result<Session, BridgeError> {
        self.start(GenerationKind::Video, params).await
    }

    pub fn stop_video(&self, correlation_id: &str) {
        self.stop(correlation_id)
    }

    /// Round-trip liveness probe. `timeout` bounds the whole probe,
    /// including initializing the channel on demand.
    pub async fn ping(&self, timeout: Duration) -> Result<(), BridgeError> {
        tokio::time::timeout(timeout, self.probe())
            .await
            .map_err(|_| BridgeError::ProbeTimeout(timeout))?
    }

    async fn probe(&self) -> Result<(), BridgeError> {
        self.initialize().await?;

        let nonce = self.next_nonce.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared
            .pongs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(nonce, tx);
        // Removes the waiter on every exit path, timeout included.
        let _waiter = PongWaiter {
            shared: &self.shared,
            nonce,
        };

        self.send(Request::Ping { nonce })?;
        rx.await
            .map_err(|_| BridgeError::Disconnected("channel closed during probe".to_string()))
    }

    /// Ask the host for the authoritative status of a workflow, waiting at
    /// most `timeout` for the answer.
    pub async fn claim(
        &self,
        workflow_id: &str,
        timeout: Duration,
    ) -> Result<ClaimReply, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .claims
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(workflow_id.to_string())
            .or_default()
            .push(tx);

        let outcome = match self.send(Request::Claim {
            workflow_id: workflow_id.to_string(),
        }) {
            Ok(_) => match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(_)) => Err(BridgeError::Disconnected(
                    "channel closed before claim was answered".to_string(),
                )),
                Err(_) => Err(BridgeError::ClaimTimeout {
                    workflow_id: workflow_id.to_string(),
                    timeout,
                }),
            },
            Err(e) => Err(e),
        };

        if outcome.is_err() {
            self.shared.drop_claim_waiters(workflow_id);
        }
        outcome
    }

    /// Hand a workflow to the host for execution.
    pub fn run_workflow(&self, workflow: Workflow) -> Result<(), BridgeError> {
        info!(workflow_id = %workflow.id, "Dispatching workflow to host");
        self.send(Request::RunWorkflow { workflow }).map(|_| ())
    }

    /// Number of claims still waiting for an answer.
    pub fn pending_claims(&self) -> usize {
        self.shared.pending_claims()
    }

    /// Number of in-flight sessions.
    pub fn active_sessions(&self) -> usize {
        self.shared.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::bridge::transport::Connection;

    /// Hands out a connection whose far end is driven by the test.
    struct ManualConnector {
        connects: AtomicUsize,
        fail_first: usize,
        ends: Mutex<Vec<(mpsc::UnboundedReceiver<Request>, mpsc::UnboundedSender<Event>)>>,
    }

    impl ManualConnector {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                connects: AtomicUsize::new(0),
                fail_first,
                ends: Mutex::new(Vec::new()),
            })
        }

        fn take_end(&self) -> (mpsc::UnboundedReceiver<Request>, mpsc::UnboundedSender<Event>) {
            self.ends.lock().unwrap().remove(0)
        }
    }

    #[async_trait]
    impl Connector for ManualConnector {
        fn target(&self) -> String {
            "manual".to_string()
        }

        async fn connect(&self) -> Result<Connection, BridgeError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(BridgeError::ConnectFailed {
                    target: "manual".to_string(),
                    reason: "refused".to_string(),
                });
            }
            let (req_tx, req_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            self.ends.lock().unwrap().push((req_rx, event_tx));
            Ok(Connection {
                requests: req_tx,
                events: event_rx,
            })
        }
    }

    #[tokio::test]
    async fn concurrent_initialize_shares_one_attempt() {
        let connector = ManualConnector::new(0);
        let client = BridgeClient::new(connector.clone());

        let (a, b, c) = tokio::join!(client.initialize(), client.initialize(), client.initialize());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert!(client.is_initialized());
    }

    #[tokio::test]
    async fn failed_initialize_can_be_retried() {
        let connector = ManualConnector::new(1);
        let client = BridgeClient::new(connector.clone());

        let (a, b) = tokio::join!(client.initialize(), client.initialize());
        assert!(a.is_err() && b.is_err());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        client.initialize().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disconnect_fails_sessions_and_resets() {
        let connector = ManualConnector::new(0);
        let client = BridgeClient::new(connector.clone());

        let session = client
            .start_chat(SessionParams::new(GenerationRequest::chat("hi")))
            .await
            .unwrap();
        let (mut requests, events) = connector.take_end();
        assert!(matches!(
            requests.recv().await.unwrap(),
            Request::Start { .. }
        ));

        drop(events);
        let err = session
            .collect(&CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Disconnected(_)));
        assert!(!client.is_initialized());
    }

    #[tokio::test]
    async fn start_overrides_request_kind() {
        let connector = ManualConnector::new(0);
        let client = BridgeClient::new(connector.clone());

        let _session = client
            .start_video(SessionParams::new(GenerationRequest::chat("a clip")).with_correlation_id("v1"))
            .await
            .unwrap();
        let (mut requests, _events) = connector.take_end();
        match requests.recv().await.unwrap() {
            Request::Start {
                correlation_id,
                params,
            } => {
                assert_eq!(correlation_id, "v1");
                assert_eq!(params.kind, GenerationKind::Video);
            }
            other => panic!("Expected Start, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_by_id_resolves_awaiter() {
        let connector = ManualConnector::new(0);
        let client = BridgeClient::new(connector.clone());
        let session = client
            .start_image(SessionParams::new(GenerationRequest::image("x")).with_correlation_id("i1"))
            .await
            .unwrap();
        let (mut requests, _events) = connector.take_end();
        let _ = requests.recv().await;

        client.stop_image("i1");
        assert_eq!(
            requests.recv().await.unwrap(),
            Request::Stop {
                correlation_id: "i1".to_string()
            }
        );
        let err = session
            .collect(&CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Cancelled { .. }));
        assert_eq!(client.active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_times_out_without_pong() {
        let connector = ManualConnector::new(0);
        let client = BridgeClient::new(connector.clone());
        client.initialize().await.unwrap();
        let (_requests, _events) = connector.take_end();

        let err = client.ping(Duration::from_millis(500)).await.unwrap_err();
        assert!(matches!(err, BridgeError::ProbeTimeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn ping_deadline_covers_initialization() {
        let connector = ManualConnector::new(0);
        let client = BridgeClient::new(connector.clone());

        let started = tokio::time::Instant::now();
        let err = client.ping(Duration::from_millis(500)).await.unwrap_err();
        assert!(matches!(err, BridgeError::ProbeTimeout(_)));
        assert!(started.elapsed() < Duration::from_millis(510));
        // The connection was opened inside the probe and is still up.
        assert!(client.is_initialized());
        let _end = connector.take_end();
    }

    #[tokio::test]
    async fn claim_waits_for_matching_result() {
        let connector = ManualConnector::new(0);
        let client = BridgeClient::new(connector.clone());
        client.initialize().await.unwrap();
        let (mut requests, events) = connector.take_end();

        tokio::spawn(async move {
            if let Some(Request::Claim { workflow_id }) = requests.recv().await {
                let _ = events.send(Event::ClaimResult {
                    workflow_id,
                    reply: ClaimReply::rejected(Some("unknown".to_string())),
                });
            }
            // Keep the channel open until the test ends.
            let _ = requests.recv().await;
        });

        let reply = client.claim("wf-1", Duration::from_secs(5)).await.unwrap();
        assert!(!reply.accepted);
        assert_eq!(reply.error.as_deref(), Some("unknown"));
    }

    #[tokio::test]
    async fn claim_requires_initialized_channel() {
        let client = BridgeClient::new(ManualConnector::new(0));
        assert!(matches!(
            client.claim("wf-1", Duration::from_secs(5)).await,
            Err(BridgeError::NotInitialized)
        ));
        assert_eq!(client.pending_claims(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_claim_times_out() {
        let connector = ManualConnector::new(0);
        let client = BridgeClient::new(connector.clone());
        client.initialize().await.unwrap();
        let (mut requests, _events) = connector.take_end();

        let err = client
            .claim("wf-x", Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ClaimTimeout { .. }));
        assert!(err.is_connectivity());
        assert_eq!(client.pending_claims(), 0);
        assert!(matches!(
            requests.recv().await.unwrap(),
            Request::Claim { .. }
        ));
    }
}
