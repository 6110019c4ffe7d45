use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::require_owner;
use crate::database::api_key::ApiKey;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
}

/// `POST /v1/keys`. The response is the only place the raw secret ever
/// appears; afterwards the store knows just its hash and display prefix.
pub async fn create_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateKeyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let owner_id = require_owner(&headers)?;
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("key name must not be empty".to_string()));
    }

    let (key, raw_secret) = ApiKey::create(&state.db, &owner_id, name)?;
    tracing::info!(owner_id = %owner_id, key_id = %key.id, "api key created");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": key.id,
            "name": key.name,
            "prefix": key.prefix,
            "secret": raw_secret,
            "created_at": key.created_at,
        })),
    ))
}

/// `GET /v1/keys`. Secrets are not recoverable; only prefixes are listed.
pub async fn list_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let owner_id = require_owner(&headers)?;
    let keys = ApiKey::list_for_owner(&state.db, &owner_id)?;
    Ok(Json(json!({ "data": keys })))
}

/// `DELETE /v1/keys/{key_id}`. Revocation is immediate: in-flight streams
/// finish, the next authentication attempt fails.
pub async fn revoke_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let owner_id = require_owner(&headers)?;
    ApiKey::revoke(&state.db, &key_id, &owner_id)?;
    tracing::info!(owner_id = %owner_id, key_id = %key_id, "api key revoked");
    Ok(StatusCode::NO_CONTENT)
}
