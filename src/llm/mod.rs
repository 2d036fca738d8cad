//! Generation providers.
//!
//! The background host and the direct fallback path both drive generation
//! through [`GenerationProvider`]. The wire format of the upstream AI service
//! stays behind this trait.

pub mod openai;
pub(crate) mod retry;

pub use openai::OpenAiCompatProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;

/// What kind of content a request generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationKind {
    Chat,
    Image,
    Video,
}

impl std::fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Chat => "chat",
            Self::Image => "image",
            Self::Video => "video",
        };
        write!(f, "{s}")
    }
}

/// Opaque request data carried by a task and relayed over the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub kind: GenerationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub prompt: String,
    /// Attachment URLs or `data:` URIs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub options: serde_json::Value,
}

impl GenerationRequest {
    pub fn new(kind: GenerationKind, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            model: None,
            prompt: prompt.into(),
            attachments: Vec::new(),
            options: serde_json::Value::Null,
        }
    }

    pub fn chat(prompt: impl Into<String>) -> Self {
        Self::new(GenerationKind::Chat, prompt)
    }

    pub fn image(prompt: impl Into<String>) -> Self {
        Self::new(GenerationKind::Image, prompt)
    }

    pub fn video(prompt: impl Into<String>) -> Self {
        Self::new(GenerationKind::Video, prompt)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_attachment(mut self, url: impl Into<String>) -> Self {
        self.attachments.push(url.into());
        self
    }
}

/// A backend that turns a [`GenerationRequest`] into content.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Provider name for logs and errors.
    fn name(&self) -> &str;

    /// Run the request, pushing partial content into `chunks` as it arrives.
    /// Returns the full content on success.
    async fn generate(
        &self,
        request: &GenerationRequest,
        chunks: mpsc::UnboundedSender<String>,
    ) -> Result<String, ProviderError>;
}

/// Drive `provider` to completion, handing each chunk to `on_chunk` as it
/// arrives. Returns `ProviderError::Cancelled` as soon as `cancel` fires.
pub async fn stream_generation<F>(
    provider: &dyn GenerationProvider,
    request: &GenerationRequest,
    cancel: &CancellationToken,
    mut on_chunk: F,
) -> Result<String, ProviderError>
where
    F: FnMut(&str) + Send,
{
    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<String>();
    let generate = provider.generate(request, chunk_tx);
    tokio::pin!(generate);

    let result = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            Some(chunk) = chunk_rx.recv() => on_chunk(&chunk),
            result = &mut generate => break result,
        }
    };

    // Chunks sent right before completion
    while let Ok(chunk) = chunk_rx.try_recv() {
        on_chunk(&chunk);
    }
    result
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::testing::ScriptedProvider;
    use super::*;

    #[tokio::test]
    async fn stream_generation_forwards_every_chunk() {
        let provider = ScriptedProvider::new(&["a", "b", "c"]);
        let mut seen = Vec::new();
        let content = stream_generation(
            &provider,
            &GenerationRequest::chat("x"),
            &CancellationToken::new(),
            |c| seen.push(c.to_string()),
        )
        .await
        .unwrap();
        assert_eq!(content, "abc");
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_generation_stops_on_cancel() {
        let provider = ScriptedProvider::new(&["a", "b"]).with_delay(Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let err = stream_generation(&provider, &GenerationRequest::chat("x"), &cancel, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
    }
}
