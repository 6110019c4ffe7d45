use std::{sync::Arc, time::Instant};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde_json::json;

use super::admission::admit;
use super::auth::authenticate;
use super::dispatch::StreamItem;
use super::recorder::{OutcomeStatus, RequestOutcome, UsageRecorder};
use super::request::{canonicalize, ChatCompletionPayload};
use crate::database::api_key::ResolvedKey;
use crate::error::ApiError;
use crate::registry::ModelDescriptor;
use crate::state::AppState;
use crate::utils::billing::{cost_micro, estimate_tokens, Usage};

/// Records the outcome of a streaming relay exactly once. Armed on creation;
/// if the future is dropped before `complete` or `fail` runs, the client
/// disconnected and the Drop impl records a cancellation.
struct StreamGuard {
    recorder: UsageRecorder,
    model: Arc<ModelDescriptor>,
    outcome: RequestOutcome,
    started: Instant,
    armed: bool,
    /// Prompt size in characters, for token estimation on disconnect.
    prompt_chars: usize,
    /// Completion text relayed so far, in characters.
    relayed_chars: usize,
}

impl StreamGuard {
    fn new(
        recorder: UsageRecorder,
        model: Arc<ModelDescriptor>,
        caller: &ResolvedKey,
        started: Instant,
        prompt_chars: usize,
    ) -> Self {
        let outcome = RequestOutcome {
            owner_id: caller.owner_id.clone(),
            api_key_id: Some(caller.key_id.clone()),
            model: model.id.clone(),
            usage: Usage::default(),
            cost_micro: 0,
            http_status: StatusCode::OK.as_u16() as i32,
            latency_ms: 0,
            is_streaming: true,
            status: OutcomeStatus::Cancelled,
        };
        Self {
            recorder,
            model,
            outcome,
            started,
            armed: true,
            prompt_chars,
            relayed_chars: 0,
        }
    }

    fn observe(&mut self, content_len: usize) {
        self.relayed_chars += content_len;
    }

    fn complete(&mut self, usage: Usage) {
        self.outcome.usage = usage;
        self.outcome.cost_micro = cost_micro(&usage, &self.model);
        self.outcome.status = OutcomeStatus::Success;
        self.outcome.latency_ms = self.started.elapsed().as_millis() as i64;
        self.recorder.record(self.outcome.clone());
        self.armed = false;
    }

    fn fail(&mut self) {
        self.outcome.status = OutcomeStatus::UpstreamError;
        self.outcome.latency_ms = self.started.elapsed().as_millis() as i64;
        self.recorder.record(self.outcome.clone());
        self.armed = false;
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(
                owner_id = %self.outcome.owner_id,
                model = %self.outcome.model,
                "client disconnected mid-stream"
            );
            // The upstream reports real usage only in its final chunk, which
            // a disconnect never reaches. Estimate from what was actually
            // relayed so the ledger reflects consumption instead of zero.
            let usage = Usage {
                prompt_tokens: estimate_tokens(self.prompt_chars),
                completion_tokens: estimate_tokens(self.relayed_chars),
                total_tokens: 0,
            }
            .normalized();
            self.outcome.usage = usage;
            self.outcome.cost_micro = cost_micro(&usage, &self.model);
            self.outcome.status = OutcomeStatus::Cancelled;
            self.outcome.latency_ms = self.started.elapsed().as_millis() as i64;
            self.recorder.record(self.outcome.clone());
        }
    }
}

/// Rejections after authentication are attributable to an owner, so they go
/// to the ledger too; analytics needs to see them alongside successes.
fn record_rejection(
    recorder: &UsageRecorder,
    caller: &ResolvedKey,
    model_id: &str,
    is_streaming: bool,
    err: &ApiError,
) {
    recorder.record(RequestOutcome {
        owner_id: caller.owner_id.clone(),
        api_key_id: Some(caller.key_id.clone()),
        model: model_id.to_string(),
        usage: Usage::default(),
        cost_micro: 0,
        http_status: err.status_code().as_u16() as i32,
        latency_ms: 0,
        is_streaming,
        status: OutcomeStatus::Rejected { reason: err.kind() },
    });
}

/// `POST /v1/chat/completions`. The admission pipeline runs in a fixed
/// order: body validation, authentication, model resolution, rate limit,
/// monthly quota, and only then the upstream dispatch.
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let payload: ChatCompletionPayload = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid request body: {}", e)))?;
    let request = canonicalize(payload)?;

    let caller = authenticate(&state.db, &headers).await?;

    let (model, adapter) = match state.dispatcher.resolve(&request) {
        Ok(resolved) => resolved,
        Err(err) => {
            record_rejection(&state.recorder, &caller, &request.model_id, request.stream, &err);
            return Err(err);
        }
    };
    if let Err(err) = admit(&state.db, &caller) {
        record_rejection(&state.recorder, &caller, &model.id, request.stream, &err);
        return Err(err);
    }

    let started = Instant::now();

    if !request.stream {
        return match adapter.complete(&model, &request).await {
            Ok(completion) => {
                state.recorder.record(RequestOutcome {
                    owner_id: caller.owner_id,
                    api_key_id: Some(caller.key_id),
                    model: model.id.clone(),
                    usage: completion.usage,
                    cost_micro: cost_micro(&completion.usage, &model),
                    http_status: StatusCode::OK.as_u16() as i32,
                    latency_ms: started.elapsed().as_millis() as i64,
                    is_streaming: false,
                    status: OutcomeStatus::Success,
                });
                Ok(Json(completion.body).into_response())
            }
            Err(err) => {
                state.recorder.record(RequestOutcome {
                    owner_id: caller.owner_id,
                    api_key_id: Some(caller.key_id),
                    model: model.id.clone(),
                    usage: Usage::default(),
                    cost_micro: 0,
                    http_status: err.status_code().as_u16() as i32,
                    latency_ms: started.elapsed().as_millis() as i64,
                    is_streaming: false,
                    status: OutcomeStatus::UpstreamError,
                });
                Err(err)
            }
        };
    }

    let mut upstream = match adapter.stream(&model, &request).await {
        Ok(upstream) => upstream,
        Err(err) => {
            state.recorder.record(RequestOutcome {
                owner_id: caller.owner_id,
                api_key_id: Some(caller.key_id),
                model: model.id.clone(),
                usage: Usage::default(),
                cost_micro: 0,
                http_status: err.status_code().as_u16() as i32,
                latency_ms: started.elapsed().as_millis() as i64,
                is_streaming: true,
                status: OutcomeStatus::UpstreamError,
            });
            return Err(err);
        }
    };

    let mut guard = StreamGuard::new(
        state.recorder.clone(),
        model.clone(),
        &caller,
        started,
        request.content_chars(),
    );

    let relay = async_stream::stream! {
        while let Some(item) = upstream.next().await {
            match item {
                Ok(StreamItem::Frame { bytes, content_len }) => {
                    guard.observe(content_len);
                    yield Ok::<Bytes, std::io::Error>(bytes);
                }
                Ok(StreamItem::Done { usage }) => {
                    yield Ok(Bytes::from("data: [DONE]\n\n"));
                    guard.complete(usage);
                    break;
                }
                Err(err) => {
                    // Headers are already sent; the best we can do is stop
                    // the body and let the client notice the truncation.
                    tracing::error!("stream relay aborted: {}", err);
                    guard.fail();
                    break;
                }
            }
        }
    };

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(relay))
        .map_err(|e| ApiError::Internal(format!("failed to build stream response: {}", e)))?;
    Ok(response)
}

/// `GET /v1/models`. Authenticated but not rate limited: catalog reads are
/// cheap and SDKs call this eagerly.
pub async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    authenticate(&state.db, &headers).await?;

    let data: Vec<serde_json::Value> = state
        .registry
        .all()
        .iter()
        .map(|model| {
            json!({
                "id": model.id,
                "object": "model",
                "owned_by": model.provider.to_string(),
                "name": model.name,
                "context_window": model.context_window,
                "max_output_tokens": model.max_output_tokens,
                "supports_streaming": model.supports_streaming,
                "supports_reasoning": model.supports_reasoning,
                "capabilities": model.capabilities,
                "description": model.description,
            })
        })
        .collect();

    Ok(Json(json!({ "object": "list", "data": data })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::request_record::RequestRecord;
    use crate::database::test_support::test_db;
    use crate::database::tier::SubscriptionTier;
    use crate::database::Db;
    use crate::registry::Provider;
    use std::time::Duration;

    fn model() -> Arc<ModelDescriptor> {
        Arc::new(ModelDescriptor {
            id: "kimi".to_string(),
            name: "Kimi".to_string(),
            provider: Provider::Groq,
            upstream_id: "moonshotai/kimi-k2".to_string(),
            context_window: 131072,
            max_output_tokens: 16384,
            supports_streaming: true,
            supports_reasoning: false,
            price_per_1k_input_micro: 1000,
            price_per_1k_output_micro: 2000,
            capabilities: vec![],
            description: String::new(),
        })
    }

    fn caller() -> ResolvedKey {
        ResolvedKey {
            key_id: "key-1".to_string(),
            owner_id: "owner-1".to_string(),
            tier: SubscriptionTier {
                name: "free".to_string(),
                tokens_per_month: Some(100_000),
                requests_per_minute: 10,
            },
        }
    }

    async fn wait_for_records(db: &Db, expected: usize) -> Vec<RequestRecord> {
        for _ in 0..100 {
            let rows = RequestRecord::list_for_owner(db, "owner-1", 10).unwrap();
            if rows.len() >= expected {
                return rows;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("guard never recorded {} outcomes", expected);
    }

    #[tokio::test]
    async fn dropped_guard_records_a_cancellation() {
        let (db, _dir) = test_db();
        let recorder = UsageRecorder::start(db.clone());

        let guard = StreamGuard::new(recorder, model(), &caller(), Instant::now(), 0);
        drop(guard);

        let rows = wait_for_records(&db, 1).await;
        assert_eq!(rows[0].status, "cancelled");
        assert!(rows[0].is_streaming);
        assert_eq!(rows[0].total_tokens, 0);
    }

    #[tokio::test]
    async fn cancelled_stream_records_estimated_usage() {
        let (db, _dir) = test_db();
        let recorder = UsageRecorder::start(db.clone());

        // 40 prompt chars and 40 relayed chars, at four chars per token.
        let mut guard = StreamGuard::new(recorder, model(), &caller(), Instant::now(), 40);
        guard.observe(25);
        guard.observe(15);
        drop(guard);

        let rows = wait_for_records(&db, 1).await;
        assert_eq!(rows[0].status, "cancelled");
        assert_eq!(rows[0].prompt_tokens, 10);
        assert_eq!(rows[0].completion_tokens, 10);
        assert_eq!(rows[0].total_tokens, 20);
        // 10 * 1000 / 1000 + 10 * 2000 / 1000
        assert_eq!(rows[0].cost_micro, 30);
    }

    #[tokio::test]
    async fn completed_guard_records_success_exactly_once() {
        let (db, _dir) = test_db();
        let recorder = UsageRecorder::start(db.clone());

        let mut guard = StreamGuard::new(recorder, model(), &caller(), Instant::now(), 0);
        guard.complete(Usage {
            prompt_tokens: 1000,
            completion_tokens: 500,
            total_tokens: 1500,
        });
        drop(guard);

        let rows = wait_for_records(&db, 1).await;
        // Give the worker a chance to write a spurious second row.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let rows_after = RequestRecord::list_for_owner(&db, "owner-1", 10).unwrap();
        assert_eq!(rows_after.len(), rows.len());

        assert_eq!(rows[0].status, "success");
        assert_eq!(rows[0].total_tokens, 1500);
        // 1000 * 1000 / 1000 + 500 * 2000 / 1000
        assert_eq!(rows[0].cost_micro, 2000);
    }

    #[tokio::test]
    async fn failed_guard_records_an_upstream_error() {
        let (db, _dir) = test_db();
        let recorder = UsageRecorder::start(db.clone());

        let mut guard = StreamGuard::new(recorder, model(), &caller(), Instant::now(), 0);
        guard.fail();
        drop(guard);

        let rows = wait_for_records(&db, 1).await;
        assert_eq!(rows[0].status, "upstream_error");
    }
}
