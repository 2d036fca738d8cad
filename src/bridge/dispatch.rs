//! Probe-then-dispatch entry points for generation requests.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::{BridgeClient, SessionParams};
use crate::error::Result;
use crate::llm::{GenerationKind, GenerationProvider, GenerationRequest, stream_generation};

/// Which path served a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Background,
    Direct,
}

/// Sends generation requests to the background host when it answers a
/// liveness probe, and to a direct provider otherwise.
///
/// Every call probes again, so a host that comes back is picked up on the
/// next request.
pub struct GenerationDispatcher {
    bridge: Option<Arc<BridgeClient>>,
    direct: Arc<dyn GenerationProvider>,
    probe_timeout: Duration,
}

impl GenerationDispatcher {
    pub fn new(
        bridge: Option<Arc<BridgeClient>>,
        direct: Arc<dyn GenerationProvider>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            bridge,
            direct,
            probe_timeout,
        }
    }

    pub async fn send_chat_message<F>(
        &self,
        request: GenerationRequest,
        cancel: &CancellationToken,
        on_chunk: F,
    ) -> Result<String>
    where
        F: FnMut(&str) + Send,
    {
        self.dispatch(GenerationKind::Chat, request, cancel, on_chunk)
            .await
            .map(|(content, _)| content)
    }

    pub async fn generate_image<F>(
        &self,
        request: GenerationRequest,
        cancel: &CancellationToken,
        on_chunk: F,
    ) -> Result<String>
    where
        F: FnMut(&str) + Send,
    {
        self.dispatch(GenerationKind::Image, request, cancel, on_chunk)
            .await
            .map(|(content, _)| content)
    }

    pub async fn generate_video<F>(
        &self,
        request: GenerationRequest,
        cancel: &CancellationToken,
        on_chunk: F,
    ) -> Result<String>
    where
        F: FnMut(&str) + Send,
    {
        self.dispatch(GenerationKind::Video, request, cancel, on_chunk)
            .await
            .map(|(content, _)| content)
    }

    /// Run `request` as `kind` and report which path served it.
    pub async fn dispatch<F>(
        &self,
        kind: GenerationKind,
        mut request: GenerationRequest,
        cancel: &CancellationToken,
        mut on_chunk: F,
    ) -> Result<(String, Route)>
    where
        F: FnMut(&str) + Send,
    {
        request.kind = kind;

        if let Some(ref bridge) = self.bridge {
            match bridge.ping(self.probe_timeout).await {
                Ok(()) => match bridge.start(kind, SessionParams::new(request.clone())).await {
                    Ok(session) => {
                        let content = session.collect(cancel, &mut on_chunk).await?;
                        return Ok((content, Route::Background));
                    }
                    Err(e) if e.is_connectivity() => {
                        warn!(error = %e, "Background host unreachable, using direct path");
                    }
                    Err(e) => return Err(e.into()),
                },
                Err(e) => {
                    debug!(error = %e, "Liveness probe failed, using direct path");
                }
            }
        }

        let content = stream_generation(self.direct.as_ref(), &request, cancel, on_chunk).await?;
        Ok((content, Route::Direct))
    }
}
