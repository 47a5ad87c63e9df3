//! Backend factory: picks and builds the adapter for the active model.

use std::sync::Arc;
use std::time::Duration;

use tiller_config::{AppConfig, BackendKind, ConfigError, ProviderConfig};
use tiller_core::Backend;
use tracing::info;

use crate::anthropic::{AnthropicBackend, MessagesClient};
use crate::generic::GenericBackend;

/// Build the backend serving `config.active_model`.
pub fn create_backend(config: &AppConfig) -> Result<Arc<dyn Backend>, ConfigError> {
    let model = config.active_model()?;
    let provider = config.provider_for(model)?;

    let client = http_client(Duration::from_secs_f64(config.api_timeout_secs.max(1.0)))
        .map_err(|e| ConfigError::ValidationError(format!("failed to build HTTP client: {e}")))?;

    info!(
        provider = %provider.name,
        model = %model.name,
        backend = ?provider.backend,
        "Creating backend"
    );
    Ok(build(provider, client))
}

/// `timeout` bounds connecting and each wait for data, not the whole
/// response, so long streams that keep producing frames are not cut off.
pub(crate) fn http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(timeout)
        .read_timeout(timeout)
        .build()
}

fn build(provider: &ProviderConfig, client: reqwest::Client) -> Arc<dyn Backend> {
    let api_key = provider.resolve_api_key();
    let key_var = (!provider.api_key_env_var.is_empty()).then(|| provider.api_key_env_var.clone());

    match provider.backend {
        BackendKind::Generic => {
            let mut backend = GenericBackend::new(&provider.name, &provider.api_base, api_key, client);
            if let Some(var) = key_var {
                backend = backend.requiring_key(var);
            }
            Arc::new(backend)
        }
        BackendKind::Anthropic => {
            let messages = MessagesClient::new(&provider.api_base, api_key, client);
            let mut backend = AnthropicBackend::new(&provider.name, messages);
            if let Some(var) = key_var {
                backend = backend.requiring_key(var);
            }
            Arc::new(backend)
        }
    }
}
