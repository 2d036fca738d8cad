//! Step handlers: the code that runs one workflow step, looked up by the
//! step's `mcp` name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::StepError;
use crate::llm::{GenerationKind, GenerationProvider, GenerationRequest, stream_generation};

/// What a handler gets to work with besides its arguments.
pub struct StepContext {
    pub workflow_id: String,
    pub step_id: String,
    /// Outputs of the steps that completed before this one, keyed by step id.
    pub previous: HashMap<String, Value>,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, args: &Value, ctx: &StepContext) -> Result<Value, StepError>;
}

/// Extract a required string argument.
pub fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, StepError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| StepError::InvalidArguments(format!("missing string argument '{key}'")))
}

/// Registry of step handlers by name.
pub struct StepRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn StepHandler>>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// A registry with the generation handlers backed by `provider`.
    pub fn with_generation(provider: Arc<dyn GenerationProvider>) -> Self {
        let registry = Self::new();
        for (name, kind) in [
            ("generate_text", GenerationKind::Chat),
            ("generate_image", GenerationKind::Image),
            ("generate_video", GenerationKind::Video),
        ] {
            registry.register_sync(Arc::new(GenerateStep::new(
                name,
                kind,
                Arc::clone(&provider),
            )));
        }
        registry
    }

    /// Register a handler, replacing any previous one with the same name.
    pub async fn register(&self, handler: Arc<dyn StepHandler>) {
        let name = handler.name().to_string();
        self.handlers.write().await.insert(name.clone(), handler);
        tracing::debug!("Registered step handler: {}", name);
    }

    /// Register a handler (sync version for startup).
    pub fn register_sync(&self, handler: Arc<dyn StepHandler>) {
        let name = handler.name().to_string();
        if let Ok(mut handlers) = self.handlers.try_write() {
            handlers.insert(name.clone(), handler);
            tracing::debug!("Registered step handler: {}", name);
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.read().await.get(name).cloned()
    }

    pub async fn has(&self, name: &str) -> bool {
        self.handlers.read().await.contains_key(name)
    }

    /// Registered handler names, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.handlers.try_read().map(|h| h.len()).unwrap_or(0)
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a generation request built from the step arguments.
///
/// Arguments: `prompt` (required), `model`, `attachments` (array of URLs).
/// Output: `{ "content": ... }`.
pub struct GenerateStep {
    name: String,
    kind: GenerationKind,
    provider: Arc<dyn GenerationProvider>,
}

impl GenerateStep {
    pub fn new(
        name: impl Into<String>,
        kind: GenerationKind,
        provider: Arc<dyn GenerationProvider>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            provider,
        }
    }
}

#[async_trait]
impl StepHandler for GenerateStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, args: &Value, ctx: &StepContext) -> Result<Value, StepError> {
        let mut request = GenerationRequest::new(self.kind, require_str(args, "prompt")?);
        if let Some(model) = args.get("model").and_then(|v| v.as_str()) {
            request = request.with_model(model);
        }
        if let Some(urls) = args.get("attachments").and_then(|v| v.as_array()) {
            for url in urls.iter().filter_map(|u| u.as_str()) {
                request = request.with_attachment(url);
            }
        }

        let content = stream_generation(self.provider.as_ref(), &request, &ctx.cancel, |_| {}).await?;
        Ok(json!({ "content": content }))
    }
}
