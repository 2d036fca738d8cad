//! Per-request sessions and the correlation-id dispatch table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::protocol::{Event, Request};
use crate::error::BridgeError;

/// Progress of one request, as seen by its caller.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Chunk(String),
    Done(String),
    Error(String),
}

impl SessionEvent {
    fn is_final(&self) -> bool {
        !matches!(self, Self::Chunk(_))
    }
}

/// What a session receives: an event, or the reason it ended early.
pub type Delivery = Result<SessionEvent, BridgeError>;

/// Routes stream events to the session registered under their correlation id.
#[derive(Default)]
pub struct SessionTable {
    routes: Mutex<HashMap<String, mpsc::UnboundedSender<Delivery>>>,
}

impl SessionTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a route. The returned guard removes it when dropped.
    pub fn register(
        self: &Arc<Self>,
        correlation_id: &str,
    ) -> Result<(Registration, mpsc::UnboundedReceiver<Delivery>), BridgeError> {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        if routes.contains_key(correlation_id) {
            return Err(BridgeError::DuplicateCorrelationId(
                correlation_id.to_string(),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        routes.insert(correlation_id.to_string(), tx);
        Ok((
            Registration {
                table: Arc::clone(self),
                correlation_id: correlation_id.to_string(),
            },
            rx,
        ))
    }

    /// Deliver a stream event. Returns `false` if nobody is registered for it.
    pub fn dispatch(&self, event: Event) -> bool {
        let (correlation_id, event) = match event {
            Event::Chunk {
                correlation_id,
                content,
            } => (correlation_id, SessionEvent::Chunk(content)),
            Event::Done {
                correlation_id,
                content,
            } => (correlation_id, SessionEvent::Done(content)),
            Event::Error {
                correlation_id,
                message,
            } => (correlation_id, SessionEvent::Error(message)),
            Event::Pong { .. } | Event::ClaimResult { .. } => return false,
        };

        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        let delivered = match routes.get(&correlation_id) {
            Some(tx) => tx.send(Ok(event.clone())).is_ok(),
            None => false,
        };
        if !delivered {
            debug!(correlation_id = %correlation_id, "Dropping event for unknown session");
            routes.remove(&correlation_id);
            return false;
        }
        if event.is_final() {
            routes.remove(&correlation_id);
        }
        true
    }

    /// Resolve one session with an error and forget it.
    pub fn fail(&self, correlation_id: &str, error: BridgeError) -> bool {
        let tx = self
            .routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(correlation_id);
        match tx {
            Some(tx) => tx.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Resolve every session with `error`.
    pub fn fail_all(&self, error: BridgeError) -> usize {
        let routes: Vec<_> = self
            .routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        let count = routes.len();
        for (_, tx) in routes {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.routes.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, correlation_id: &str) {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(correlation_id);
    }
}

/// Disposal guard for a [`SessionTable`] route.
pub struct Registration {
    table: Arc<SessionTable>,
    correlation_id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.table.remove(&self.correlation_id);
    }
}

/// One in-flight request on the bridge.
pub struct Session {
    correlation_id: String,
    events: mpsc::UnboundedReceiver<Delivery>,
    requests: mpsc::UnboundedSender<Request>,
    finished: bool,
    _registration: Registration,
}

impl Session {
    pub(crate) fn new(
        correlation_id: String,
        registration: Registration,
        events: mpsc::UnboundedReceiver<Delivery>,
        requests: mpsc::UnboundedSender<Request>,
    ) -> Self {
        Self {
            correlation_id,
            events,
            requests,
            finished: false,
            _registration: registration,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Next event, or `None` once the session has finished.
    pub async fn next_event(&mut self) -> Option<Result<SessionEvent, BridgeError>> {
        if self.finished {
            return None;
        }
        let delivery = match self.events.recv().await {
            Some(delivery) => delivery,
            None => Err(BridgeError::Disconnected(
                "session route closed".to_string(),
            )),
        };
        if !matches!(delivery, Ok(SessionEvent::Chunk(_))) {
            self.finished = true;
        }
        Some(delivery)
    }

    /// Wait for the final content, handing chunks to `on_chunk`.
    ///
    /// When `cancel` fires, a stop request is sent to the host and the call
    /// returns `BridgeError::Cancelled`.
    pub async fn collect<F>(
        mut self,
        cancel: &CancellationToken,
        mut on_chunk: F,
    ) -> Result<String, BridgeError>
    where
        F: FnMut(&str) + Send,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.stop();
                    return Err(BridgeError::Cancelled {
                        correlation_id: self.correlation_id.clone(),
                    });
                }
                next = self.next_event() => next,
            };
            match next {
                Some(Ok(SessionEvent::Chunk(chunk))) => on_chunk(&chunk),
                Some(Ok(SessionEvent::Done(content))) => return Ok(content),
                Some(Ok(SessionEvent::Error(message))) => {
                    return Err(BridgeError::Stream {
                        correlation_id: self.correlation_id.clone(),
                        message,
                    });
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(BridgeError::Disconnected(
                        "session already finished".to_string(),
                    ));
                }
            }
        }
    }

    /// Ask the host to stop this request. Best effort.
    pub fn stop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let _ = self.requests.send(Request::Stop {
            correlation_id: self.correlation_id.clone(),
        });
    }
}

impl Drop for Session {
    /// An abandoned session still tells the host to stop generating.
    fn drop(&mut self) {
        self.stop();
    }
}
