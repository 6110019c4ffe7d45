use axum::{
    http::HeaderMap,
    routing::{get, post, put},
    Router,
};

use crate::error::ApiError;
use crate::proxy::handlers;
use crate::state::AppState;

pub mod keys;
pub mod subscription;
pub mod usage;

/// Identifies the portal user behind a management call. The portal frontend
/// terminates its own session auth and forwards the identity in this header.
pub const OWNER_HEADER: &str = "x-owner-id";

pub(crate) fn require_owner(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(OWNER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|owner| !owner.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::Unauthorized(format!("missing {} header", OWNER_HEADER)))
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/keys", post(keys::create_key).get(keys::list_keys))
        .route("/v1/keys/{key_id}", axum::routing::delete(keys::revoke_key))
        .route("/v1/usage/quota", get(usage::quota))
        .route(
            "/v1/subscription",
            put(subscription::set_subscription).get(subscription::get_subscription),
        )
}
