use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;

const DEFAULT_TEMPERATURE: f64 = 0.7;

/// One conversation turn. `content` stays a raw JSON value because providers
/// accept both plain strings and structured part arrays; we forward it as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Value,
}

/// Wire shape of `POST /v1/chat/completions`. Unknown fields are ignored so
/// clients built against newer OpenAI SDKs keep working.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionPayload {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Convenience alias: a bare prompt becomes a single user message.
    pub prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop: Option<Value>,
    #[serde(default)]
    pub stream: bool,
}

/// Validated request in the shape the dispatch layer works with. Model
/// existence and per-model ceilings are checked later, against the registry.
#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    pub model_id: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub stop: Option<Value>,
    pub stream: bool,
}

impl CanonicalRequest {
    /// Total character length of the prompt content, the input to token
    /// estimation when a stream ends without a usage report.
    pub fn content_chars(&self) -> usize {
        self.messages
            .iter()
            .map(|message| match &message.content {
                Value::String(text) => text.len(),
                other => other.to_string().len(),
            })
            .sum()
    }
}

pub fn canonicalize(payload: ChatCompletionPayload) -> Result<CanonicalRequest, ApiError> {
    if payload.model.trim().is_empty() {
        return Err(ApiError::BadRequest("model is required".to_string()));
    }

    let messages = if payload.messages.is_empty() {
        match payload.prompt {
            Some(prompt) if !prompt.trim().is_empty() => vec![ChatMessage {
                role: "user".to_string(),
                content: Value::String(prompt),
            }],
            _ => {
                return Err(ApiError::BadRequest(
                    "messages must not be empty".to_string(),
                ))
            }
        }
    } else {
        payload.messages
    };

    for message in &messages {
        if message.role.trim().is_empty() {
            return Err(ApiError::BadRequest(
                "message role must not be empty".to_string(),
            ));
        }
        if message.content.is_null() {
            return Err(ApiError::BadRequest(
                "message content must not be null".to_string(),
            ));
        }
    }

    let temperature = payload.temperature.unwrap_or(DEFAULT_TEMPERATURE);
    if !(0.0..=2.0).contains(&temperature) {
        return Err(ApiError::BadRequest(
            "temperature must be between 0 and 2".to_string(),
        ));
    }

    if payload.max_tokens == Some(0) {
        return Err(ApiError::BadRequest(
            "max_tokens must be greater than zero".to_string(),
        ));
    }

    Ok(CanonicalRequest {
        model_id: payload.model,
        messages,
        max_tokens: payload.max_tokens,
        temperature,
        top_p: payload.top_p,
        stop: payload.stop,
        stream: payload.stream,
    })
}
