//! Connectors that open a bridge channel to a background host.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::protocol::{Event, Request};
use crate::error::BridgeError;
use crate::host::Host;

/// An open channel: requests go out, events come back.
///
/// The channel is closed when `events` yields `None`.
pub struct Connection {
    pub requests: mpsc::UnboundedSender<Request>,
    pub events: mpsc::UnboundedReceiver<Event>,
}

/// Opens connections to a background host.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Human-readable target for logs and errors.
    fn target(&self) -> String;

    async fn connect(&self) -> Result<Connection, BridgeError>;
}

/// Attaches directly to a [`Host`] running in the same process.
pub struct LocalConnector {
    host: Arc<Host>,
}

impl LocalConnector {
    pub fn new(host: Arc<Host>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    fn target(&self) -> String {
        "local".to_string()
    }

    async fn connect(&self) -> Result<Connection, BridgeError> {
        Ok(self.host.connect())
    }
}

/// Connects to a host daemon over WebSocket, one JSON frame per message.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// `url` is the full endpoint, e.g. `ws://127.0.0.1:8787/ws/bridge`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    fn target(&self) -> String {
        self.url.clone()
    }

    async fn connect(&self) -> Result<Connection, BridgeError> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| BridgeError::ConnectFailed {
                target: self.url.clone(),
                reason: e.to_string(),
            })?;
        let (mut sink, mut stream) = ws.split();

        let (req_tx, mut req_rx) = mpsc::unbounded_channel::<Request>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<Event>();

        // Writer: ends when the client drops its request sender.
        tokio::spawn(async move {
            while let Some(request) = req_rx.recv().await {
                let json = match serde_json::to_string(&request) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize bridge request");
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: dropping `event_tx` signals the disconnect.
        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Event>(&text) {
                        Ok(event) => {
                            if event_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "Ignoring malformed bridge frame");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(target_url = %url, error = %e, "Bridge socket error");
                        break;
                    }
                }
            }
        });

        Ok(Connection {
            requests: req_tx,
            events: event_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::bridge::{BridgeClient, SessionParams};
    use crate::host::steps::StepRegistry;
    use crate::llm::GenerationRequest;
    use crate::llm::testing::ScriptedProvider;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn local_connector_round_trip() {
        let host = Host::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ScriptedProvider::new(&["lo", "cal"])),
            Arc::new(StepRegistry::new()),
        );
        let client = BridgeClient::new(Arc::new(LocalConnector::new(host)));

        client
            .ping(std::time::Duration::from_millis(500))
            .await
            .unwrap();
        let session = client
            .start_chat(SessionParams::new(GenerationRequest::chat("hi")))
            .await
            .unwrap();
        let content = session
            .collect(&CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(content, "local");
    }
}
