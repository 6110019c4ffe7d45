use std::{collections::HashMap, pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde_json::Value;

use super::providers::{ollama::OllamaAdapter, openai_compat::OpenAiCompatAdapter, KeyPool};
use super::request::CanonicalRequest;
use crate::config::ProvidersConfig;
use crate::error::ApiError;
use crate::registry::{ModelDescriptor, ModelRegistry, Provider};
use crate::utils::billing::Usage;

/// Fully buffered upstream result, already rewritten to the public envelope.
#[derive(Debug)]
pub struct Completion {
    pub body: Value,
    pub usage: Usage,
}

/// Items produced by a streaming adapter. `Frame` bytes are complete SSE
/// frames ready to relay; `content_len` is the byte length of the completion
/// text inside the frame, so a relay cut short can still estimate what the
/// upstream generated. `Done` is terminal and carries whatever usage the
/// upstream reported before closing.
#[derive(Debug)]
pub enum StreamItem {
    Frame { bytes: Bytes, content_len: usize },
    Done { usage: Usage },
}

pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<StreamItem, ApiError>> + Send>>;

/// One upstream wire dialect. Adapters own credential rotation and retry;
/// callers only see the normalized envelope.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn complete(
        &self,
        model: &ModelDescriptor,
        request: &CanonicalRequest,
    ) -> Result<Completion, ApiError>;

    async fn stream(
        &self,
        model: &ModelDescriptor,
        request: &CanonicalRequest,
    ) -> Result<CompletionStream, ApiError>;
}

impl std::fmt::Debug for dyn ProviderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProviderAdapter")
    }
}

pub fn build_http_client(proxy: Option<&str>) -> Result<reqwest::Client, ApiError> {
    let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));
    if let Some(proxy_url) = proxy {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| ApiError::Internal(format!("invalid proxy url '{}': {}", proxy_url, e)))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| ApiError::Internal(format!("failed to build http client: {}", e)))
}

/// Routes a validated request to the adapter for its model's provider, after
/// enforcing the per-model ceilings the registry declares.
pub struct Dispatcher {
    registry: Arc<ModelRegistry>,
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ModelRegistry>,
        adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
    ) -> Self {
        Self { registry, adapters }
    }

    pub fn from_config(
        registry: Arc<ModelRegistry>,
        providers: &ProvidersConfig,
        proxy: Option<&str>,
    ) -> Result<Self, ApiError> {
        let client = build_http_client(proxy)?;

        let mut adapters: HashMap<Provider, Arc<dyn ProviderAdapter>> = HashMap::new();
        for (provider, provider_config) in [
            (Provider::Groq, &providers.groq),
            (Provider::Chutes, &providers.chutes),
            (Provider::Cerebras, &providers.cerebras),
            (Provider::Openrouter, &providers.openrouter),
        ] {
            adapters.insert(
                provider,
                Arc::new(OpenAiCompatAdapter::new(
                    provider,
                    provider_config.base_url.clone(),
                    KeyPool::new(provider_config.api_keys.clone()),
                    client.clone(),
                )),
            );
        }
        adapters.insert(
            Provider::Ollama,
            Arc::new(OllamaAdapter::new(
                providers.ollama.base_url.clone(),
                client.clone(),
            )),
        );

        Ok(Self::new(registry, adapters))
    }

    /// Looks the model up and validates the request against its limits.
    /// `max_tokens` above the model ceiling is rejected outright rather than
    /// clamped: silently truncating output would be a worse surprise than an
    /// explicit error.
    pub fn resolve(
        &self,
        request: &CanonicalRequest,
    ) -> Result<(Arc<ModelDescriptor>, Arc<dyn ProviderAdapter>), ApiError> {
        let model = self.registry.by_id(&request.model_id).ok_or_else(|| {
            ApiError::UnknownModel(format!("model '{}' not found", request.model_id))
        })?;

        if let Some(max_tokens) = request.max_tokens {
            if max_tokens > model.max_output_tokens {
                return Err(ApiError::BadRequest(format!(
                    "max_tokens {} exceeds the limit of {} for model '{}'",
                    max_tokens, model.max_output_tokens, model.id
                )));
            }
        }
        if request.stream && !model.supports_streaming {
            return Err(ApiError::BadRequest(format!(
                "model '{}' does not support streaming",
                model.id
            )));
        }

        let adapter = self
            .adapters
            .get(&model.provider)
            .cloned()
            .ok_or_else(|| {
                ApiError::Internal(format!(
                    "no adapter registered for provider {}",
                    model.provider
                ))
            })?;
        Ok((model, adapter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::request::{canonicalize, ChatCompletionPayload};
    use serde_json::json;

    struct StubAdapter;

    #[async_trait]
    impl ProviderAdapter for StubAdapter {
        async fn complete(
            &self,
            _model: &ModelDescriptor,
            _request: &CanonicalRequest,
        ) -> Result<Completion, ApiError> {
            Err(ApiError::ProviderFailure { status: None })
        }

        async fn stream(
            &self,
            _model: &ModelDescriptor,
            _request: &CanonicalRequest,
        ) -> Result<CompletionStream, ApiError> {
            Err(ApiError::ProviderFailure { status: None })
        }
    }

    fn dispatcher() -> Dispatcher {
        let yaml = r#"
models:
  - { id: fast, name: Fast, provider: groq, upstream_id: fast-v1, context_window: 8192, max_output_tokens: 1024, supports_streaming: true, supports_reasoning: false }
  - { id: batch-only, name: Batch, provider: cerebras, upstream_id: batch-v1, context_window: 8192, max_output_tokens: 1024, supports_streaming: false, supports_reasoning: false }
"#;
        let registry = Arc::new(ModelRegistry::from_yaml(yaml).unwrap());
        let mut adapters: HashMap<Provider, Arc<dyn ProviderAdapter>> = HashMap::new();
        for provider in [Provider::Groq, Provider::Cerebras] {
            adapters.insert(provider, Arc::new(StubAdapter));
        }
        Dispatcher::new(registry, adapters)
    }

    fn request(value: serde_json::Value) -> CanonicalRequest {
        let payload: ChatCompletionPayload = serde_json::from_value(value).unwrap();
        canonicalize(payload).unwrap()
    }

    #[test]
    fn unknown_model_is_rejected_as_such() {
        let err = dispatcher()
            .resolve(&request(json!({
                "model": "ghost",
                "messages": [{"role": "user", "content": "hi"}],
            })))
            .unwrap_err();
        assert!(matches!(err, ApiError::UnknownModel(_)));
    }

    #[test]
    fn max_tokens_over_ceiling_is_rejected_not_clamped() {
        let err = dispatcher()
            .resolve(&request(json!({
                "model": "fast",
                "messages": [{"role": "user", "content": "hi"}],
                "max_tokens": 4096,
            })))
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[test]
    fn max_tokens_at_ceiling_is_allowed() {
        let (model, _) = dispatcher()
            .resolve(&request(json!({
                "model": "fast",
                "messages": [{"role": "user", "content": "hi"}],
                "max_tokens": 1024,
            })))
            .unwrap();
        assert_eq!(model.id, "fast");
    }

    #[test]
    fn streaming_against_non_streaming_model_is_rejected() {
        let err = dispatcher()
            .resolve(&request(json!({
                "model": "batch-only",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true,
            })))
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }
}
