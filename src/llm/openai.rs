//! OpenAI-compatible streaming chat-completions provider.

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::retry::{self, RetryPolicy};
use super::{GenerationProvider, GenerationRequest};
use crate::config::ProviderConfig;
use crate::error::ProviderError;

const PROVIDER_NAME: &str = "openai-compat";

/// Streams completions from any `/chat/completions` endpoint speaking the
/// OpenAI SSE format.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    config: ProviderConfig,
    policy: RetryPolicy,
}

impl OpenAiCompatProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::RequestFailed {
                provider: PROVIDER_NAME.to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        let policy = RetryPolicy {
            max_attempts: config.max_retries,
            delay: config.retry_delay,
        };
        Ok(Self {
            client,
            config,
            policy,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    /// One request/stream cycle. `emitted` is set once any chunk reached the
    /// caller, after which the attempt must not be retried.
    async fn attempt(
        &self,
        body: &Value,
        chunks: &mpsc::UnboundedSender<String>,
        emitted: &mut bool,
    ) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.config.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(retry::classify_status(PROVIDER_NAME, status.as_u16(), &text));
        }

        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut full = String::new();

        while let Some(next) = stream.next().await {
            let bytes = next.map_err(|e| self.transport_error(e))?;
            lines.extend(&bytes);

            while let Some(line) = lines.next_line() {
                match parse_sse_line(line.trim()) {
                    SseLine::Delta(delta) => {
                        full.push_str(&delta);
                        *emitted = true;
                        let _ = chunks.send(delta);
                    }
                    SseLine::Done => return Ok(full),
                    SseLine::Skip => {}
                }
            }
        }

        Ok(full)
    }

    fn transport_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout {
                provider: PROVIDER_NAME.to_string(),
                timeout: self.config.request_timeout,
            }
        } else {
            ProviderError::RequestFailed {
                provider: PROVIDER_NAME.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl GenerationProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        chunks: mpsc::UnboundedSender<String>,
    ) -> Result<String, ProviderError> {
        let body = request_body(request, &self.config.model);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut emitted = false;
            match self.attempt(&body, &chunks, &mut emitted).await {
                Ok(content) => return Ok(content),
                Err(e) if !emitted && retry::should_retry(&e) => {
                    if !self.policy.allows_another(attempt) {
                        return Err(ProviderError::RetriesExhausted {
                            provider: PROVIDER_NAME.to_string(),
                            attempts: attempt,
                            last: e.to_string(),
                        });
                    }
                    warn!(attempt, error = %e, "Generation attempt failed, retrying");
                    if !self.policy.delay.is_zero() {
                        tokio::time::sleep(self.policy.delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Build the chat-completions body: text prompt plus image attachments.
fn request_body(request: &GenerationRequest, default_model: &str) -> Value {
    let mut content = vec![json!({ "type": "text", "text": request.prompt })];
    for url in &request.attachments {
        content.push(json!({ "type": "image_url", "image_url": { "url": url } }));
    }

    json!({
        "model": request.model.as_deref().unwrap_or(default_model),
        "messages": [{ "role": "user", "content": content }],
        "stream": true,
    })
}

/// Splits a byte stream into lines. Bytes are only decoded once a whole line
/// has arrived, so a character split across network reads stays intact.
#[derive(Default)]
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn extend(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<String> {
        loop {
            let pos = self.bytes.iter().position(|b| *b == b'\n')?;
            let line: Vec<u8> = self.bytes.drain(..=pos).collect();
            match String::from_utf8(line) {
                Ok(line) => return Some(line),
                Err(e) => debug!(error = %e, "Skipping SSE line that is not UTF-8"),
            }
        }
    }
}

enum SseLine {
    Delta(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<Value>(data) {
        Ok(chunk) => match chunk["choices"][0]["delta"]["content"].as_str() {
            Some(delta) if !delta.is_empty() => SseLine::Delta(delta.to_string()),
            _ => SseLine::Skip,
        },
        Err(e) => {
            debug!(error = %e, "Ignoring malformed SSE chunk");
            SseLine::Skip
        }
    }
}
