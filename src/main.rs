use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use taskbridge::config::{HostConfig, ProviderConfig};
use taskbridge::error::ProviderError;
use taskbridge::host::Host;
use taskbridge::host::server::bridge_routes;
use taskbridge::host::steps::StepRegistry;
use taskbridge::llm::{GenerationProvider, GenerationRequest, OpenAiCompatProvider};
use taskbridge::store::{LibSqlStore, RecordStore};

/// Stands in when no provider is configured; every request fails.
struct UnconfiguredProvider;

#[async_trait]
impl GenerationProvider for UnconfiguredProvider {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn generate(
        &self,
        _request: &GenerationRequest,
        _chunks: mpsc::UnboundedSender<String>,
    ) -> Result<String, ProviderError> {
        Err(ProviderError::RequestFailed {
            provider: "unconfigured".to_string(),
            reason: "TASKBRIDGE_API_KEY is not set".to_string(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = HostConfig::from_env()?;

    // Initialize tracing, optionally mirrored to a daily log file
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _log_guard = match config.log_dir {
        Some(ref dir) => {
            let appender = tracing_appender::rolling::daily(dir, "taskbridge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
            None
        }
    };

    let provider: Arc<dyn GenerationProvider> = match ProviderConfig::from_env() {
        Some(provider_config) => {
            eprintln!("   Model: {}", provider_config.model);
            Arc::new(OpenAiCompatProvider::new(provider_config)?)
        }
        None => {
            eprintln!("   Warning: TASKBRIDGE_API_KEY not set, generation requests will fail");
            Arc::new(UnconfiguredProvider)
        }
    };

    let store: Arc<dyn RecordStore> = Arc::new(LibSqlStore::new_local(&config.db_path).await?);

    let steps = Arc::new(StepRegistry::with_generation(Arc::clone(&provider)));
    let host = Host::new(store, provider, Arc::clone(&steps));

    eprintln!("🔗 taskbridge host v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Steps: {} registered", steps.count());
    eprintln!("   Bridge WS: ws://0.0.0.0:{}/ws/bridge", config.port);
    eprintln!("   Health: http://0.0.0.0:{}/health\n", config.port);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!(port = config.port, "Bridge host started");

    axum::serve(listener, bridge_routes(host))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
