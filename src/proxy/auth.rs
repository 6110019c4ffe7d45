use axum::http::{header::AUTHORIZATION, HeaderMap};

use crate::database::api_key::{ApiKey, ResolvedKey, SECRET_SCHEME};
use crate::database::Db;
use crate::error::ApiError;

/// Resolves the caller from the `Authorization: Bearer tg_...` header.
/// Missing, malformed, unknown and revoked credentials all collapse into the
/// same 401 so probing reveals nothing about which keys exist.
pub async fn authenticate(db: &Db, headers: &HeaderMap) -> Result<ResolvedKey, ApiError> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing authorization header".to_string()))?;

    let secret = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| {
            ApiError::Unauthorized("authorization header must use the Bearer scheme".to_string())
        })?
        .trim();

    if !secret.starts_with(SECRET_SCHEME) {
        return Err(ApiError::Unauthorized("invalid api key".to_string()));
    }

    let resolved = ApiKey::resolve(db, secret)?
        .ok_or_else(|| ApiError::Unauthorized("invalid api key".to_string()))?;

    // last_used_at freshness is dashboard data, keep it off the hot path.
    let db = db.clone();
    let key_id = resolved.key_id.clone();
    tokio::spawn(async move {
        if let Err(e) = ApiKey::touch(&db, &key_id) {
            tracing::warn!("failed to touch api key {}: {}", key_id, e);
        }
    });

    Ok(resolved)
}
