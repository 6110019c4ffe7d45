use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};

use super::{parse_usage, KeyPool};
use crate::error::ApiError;
use crate::proxy::dispatch::{Completion, CompletionStream, ProviderAdapter, StreamItem};
use crate::proxy::request::CanonicalRequest;
use crate::registry::{ModelDescriptor, Provider};
use crate::utils::billing::Usage;
use crate::utils::sse::SseParser;

const DONE_SENTINEL: &str = "[DONE]";

/// Length of the completion text in a streamed chunk, for usage estimation
/// when the client disconnects before the final usage report.
fn delta_content_len(chunk: &Value) -> usize {
    chunk["choices"][0]["delta"]["content"]
        .as_str()
        .map_or(0, str::len)
}

/// Adapter for providers speaking the OpenAI chat-completions dialect
/// (Groq, Chutes, Cerebras, OpenRouter). One instance per provider, each with
/// its own credential pool.
pub struct OpenAiCompatAdapter {
    provider: Provider,
    base_url: String,
    keys: KeyPool,
    client: reqwest::Client,
}

impl OpenAiCompatAdapter {
    pub fn new(
        provider: Provider,
        base_url: String,
        keys: KeyPool,
        client: reqwest::Client,
    ) -> Self {
        Self {
            provider,
            base_url,
            keys,
            client,
        }
    }

    fn build_body(&self, model: &ModelDescriptor, request: &CanonicalRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": model.upstream_id,
            "messages": request.messages,
            "temperature": request.temperature,
            "stream": stream,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(stop) = &request.stop {
            body["stop"] = stop.clone();
        }
        if stream {
            // Without this most providers close the stream with no usage chunk.
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }

    /// Sends the request with the next credential in rotation. A 401/403/429
    /// from the upstream gets exactly one retry with a rotated key; every
    /// other failure surfaces immediately.
    async fn send(
        &self,
        model: &ModelDescriptor,
        request: &CanonicalRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = self.build_body(model, request, stream);

        let mut retried = false;
        loop {
            let Some(key) = self.keys.next() else {
                return Err(ApiError::Internal(format!(
                    "no api keys configured for provider {}",
                    self.provider
                )));
            };

            let response = self
                .client
                .post(&url)
                .bearer_auth(&key)
                .json(&body)
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    if matches!(status.as_u16(), 401 | 403 | 429) && !retried {
                        retried = true;
                        tracing::warn!(
                            provider = %self.provider,
                            status = status.as_u16(),
                            "upstream rejected credential, retrying with rotated key"
                        );
                        continue;
                    }
                    let detail = response.text().await.unwrap_or_default();
                    tracing::error!(
                        provider = %self.provider,
                        status = status.as_u16(),
                        "upstream request failed: {}",
                        detail
                    );
                    return Err(ApiError::ProviderFailure {
                        status: Some(status.as_u16()),
                    });
                }
                Err(e) => {
                    tracing::error!(provider = %self.provider, "upstream request error: {}", e);
                    return Err(ApiError::ProviderFailure { status: None });
                }
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    async fn complete(
        &self,
        model: &ModelDescriptor,
        request: &CanonicalRequest,
    ) -> Result<Completion, ApiError> {
        let response = self.send(model, request, false).await?;
        let mut body: Value = response.json().await.map_err(|e| {
            tracing::error!(provider = %self.provider, "unparseable upstream body: {}", e);
            ApiError::ProviderFailure { status: None }
        })?;

        let usage = parse_usage(&body);
        // Callers see the public catalog id, never the upstream alias.
        body["model"] = json!(model.id);
        Ok(Completion { body, usage })
    }

    async fn stream(
        &self,
        model: &ModelDescriptor,
        request: &CanonicalRequest,
    ) -> Result<CompletionStream, ApiError> {
        let response = self.send(model, request, true).await?;
        let provider = self.provider;
        let public_id = model.id.clone();

        let stream = async_stream::stream! {
            let mut parser = SseParser::new();
            let mut usage = Usage::default();
            let mut upstream = response.bytes_stream();
            let mut finished = false;

            while let Some(chunk) = upstream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::error!(provider = %provider, "upstream stream error: {}", e);
                        yield Err(ApiError::ProviderFailure { status: None });
                        return;
                    }
                };

                for event in parser.feed(&chunk) {
                    if event.data == DONE_SENTINEL {
                        finished = true;
                        break;
                    }
                    match serde_json::from_str::<Value>(&event.data) {
                        Ok(mut value) => {
                            if value.get("usage").map_or(false, |u| !u.is_null()) {
                                usage = parse_usage(&value);
                            }
                            let content_len = delta_content_len(&value);
                            value["model"] = json!(public_id);
                            yield Ok(StreamItem::Frame {
                                bytes: Bytes::from(format!("data: {}\n\n", value)),
                                content_len,
                            });
                        }
                        // Non-JSON data (keepalives) is relayed untouched.
                        Err(_) => {
                            yield Ok(StreamItem::Frame {
                                bytes: Bytes::from(format!("data: {}\n\n", event.data)),
                                content_len: 0,
                            });
                        }
                    }
                }
                if finished {
                    break;
                }
            }

            yield Ok(StreamItem::Done { usage });
        };

        Ok(Box::pin(stream))
    }
}
