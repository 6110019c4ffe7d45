use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::ApiError;
use crate::proxy::dispatch::{Completion, CompletionStream, ProviderAdapter, StreamItem};
use crate::proxy::request::CanonicalRequest;
use crate::registry::ModelDescriptor;
use crate::utils::billing::Usage;

/// Adapter for a local Ollama daemon. Ollama speaks its own `/api/chat`
/// dialect with NDJSON streaming, so responses are rewrapped into the
/// OpenAI envelope before they leave the gateway.
pub struct OllamaAdapter {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaAdapter {
    pub fn new(base_url: String, client: reqwest::Client) -> Self {
        Self { base_url, client }
    }

    fn build_body(model: &ModelDescriptor, request: &CanonicalRequest, stream: bool) -> Value {
        let mut options = json!({ "temperature": request.temperature });
        if let Some(max_tokens) = request.max_tokens {
            options["num_predict"] = json!(max_tokens);
        }
        if let Some(top_p) = request.top_p {
            options["top_p"] = json!(top_p);
        }
        json!({
            "model": model.upstream_id,
            "messages": request.messages,
            "stream": stream,
            "options": options,
        })
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let response = self.client.post(&url).json(body).send().await.map_err(|e| {
            tracing::error!("ollama request error: {}", e);
            ApiError::ProviderFailure { status: None }
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), "ollama request failed: {}", detail);
            return Err(ApiError::ProviderFailure {
                status: Some(status.as_u16()),
            });
        }
        Ok(response)
    }
}

fn usage_from_counts(value: &Value) -> Usage {
    Usage {
        prompt_tokens: value["prompt_eval_count"].as_i64().unwrap_or(0),
        completion_tokens: value["eval_count"].as_i64().unwrap_or(0),
        total_tokens: 0,
    }
    .normalized()
}

fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    async fn complete(
        &self,
        model: &ModelDescriptor,
        request: &CanonicalRequest,
    ) -> Result<Completion, ApiError> {
        let response = self.send(&Self::build_body(model, request, false)).await?;
        let value: Value = response.json().await.map_err(|e| {
            tracing::error!("unparseable ollama body: {}", e);
            ApiError::ProviderFailure { status: None }
        })?;

        let usage = usage_from_counts(&value);
        let message = value
            .get("message")
            .cloned()
            .unwrap_or_else(|| json!({"role": "assistant", "content": ""}));
        let finish_reason = value
            .get("done_reason")
            .and_then(|r| r.as_str())
            .unwrap_or("stop");

        let body = json!({
            "id": completion_id(),
            "object": "chat.completion",
            "created": Utc::now().timestamp(),
            "model": model.id,
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": finish_reason,
            }],
            "usage": usage,
        });
        Ok(Completion { body, usage })
    }

    async fn stream(
        &self,
        model: &ModelDescriptor,
        request: &CanonicalRequest,
    ) -> Result<CompletionStream, ApiError> {
        let response = self.send(&Self::build_body(model, request, true)).await?;
        let public_id = model.id.clone();
        let chunk_id = completion_id();

        let stream = async_stream::stream! {
            let created = Utc::now().timestamp();
            let mut buffer: Vec<u8> = Vec::new();
            let mut usage = Usage::default();
            let mut upstream = response.bytes_stream();

            'outer: while let Some(chunk) = upstream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::error!("ollama stream error: {}", e);
                        yield Err(ApiError::ProviderFailure { status: None });
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);

                // NDJSON: one JSON document per line.
                while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&line[..newline]);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let value: Value = match serde_json::from_str(line) {
                        Ok(value) => value,
                        Err(e) => {
                            tracing::warn!("skipping malformed ollama line: {}", e);
                            continue;
                        }
                    };

                    if value["done"].as_bool().unwrap_or(false) {
                        usage = usage_from_counts(&value);
                        let finish = json!({
                            "id": chunk_id,
                            "object": "chat.completion.chunk",
                            "created": created,
                            "model": public_id,
                            "choices": [{
                                "index": 0,
                                "delta": {},
                                "finish_reason": value.get("done_reason").and_then(|r| r.as_str()).unwrap_or("stop"),
                            }],
                            "usage": usage,
                        });
                        yield Ok(StreamItem::Frame {
                            bytes: Bytes::from(format!("data: {}\n\n", finish)),
                            content_len: 0,
                        });
                        break 'outer;
                    }

                    let content_len = value["message"]["content"].as_str().map_or(0, str::len);
                    let delta = json!({
                        "id": chunk_id,
                        "object": "chat.completion.chunk",
                        "created": created,
                        "model": public_id,
                        "choices": [{
                            "index": 0,
                            "delta": {"content": value["message"]["content"]},
                            "finish_reason": null,
                        }],
                    });
                    yield Ok(StreamItem::Frame {
                        bytes: Bytes::from(format!("data: {}\n\n", delta)),
                        content_len,
                    });
                }
            }

            yield Ok(StreamItem::Done { usage });
        };

        Ok(Box::pin(stream))
    }
}
