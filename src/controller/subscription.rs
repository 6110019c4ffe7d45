use axum::{extract::State, http::HeaderMap, Json};
use serde::Deserialize;
use serde_json::json;

use super::require_owner;
use crate::database::tier::{Subscription, SubscriptionTier};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SetSubscriptionRequest {
    pub tier: String,
}

/// `PUT /v1/subscription`. Assigns the owner to a named tier; takes effect on
/// the next admission check, no restart or key rotation needed.
pub async fn set_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SetSubscriptionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let owner_id = require_owner(&headers)?;
    let tier = SubscriptionTier::by_name(&state.db, &payload.tier)?
        .ok_or_else(|| ApiError::NotFound(format!("unknown tier '{}'", payload.tier)))?;

    Subscription::assign(&state.db, &owner_id, &tier.name)?;
    tracing::info!(owner_id = %owner_id, tier = %tier.name, "subscription updated");

    Ok(Json(json!({
        "tier": tier.name,
        "tokens_per_month": tier.tokens_per_month,
        "requests_per_minute": tier.requests_per_minute,
    })))
}

/// `GET /v1/subscription`. Owners without an explicit subscription report the
/// free tier.
pub async fn get_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let owner_id = require_owner(&headers)?;
    let tier = SubscriptionTier::for_owner(&state.db, &owner_id)?;

    Ok(Json(json!({
        "tier": tier.name,
        "tokens_per_month": tier.tokens_per_month,
        "requests_per_minute": tier.requests_per_minute,
    })))
}
