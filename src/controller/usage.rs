use axum::{extract::State, http::HeaderMap, Json};
use serde_json::json;

use super::require_owner;
use crate::database::tier::SubscriptionTier;
use crate::database::usage::{current_period_key, UsageWindow};
use crate::error::ApiError;
use crate::state::AppState;

/// `GET /v1/usage/quota`. Point-in-time snapshot of the current calendar
/// month against the owner's tier allowance.
pub async fn quota(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let owner_id = require_owner(&headers)?;
    let tier = SubscriptionTier::for_owner(&state.db, &owner_id)?;
    let period = current_period_key();
    let window = UsageWindow::get(&state.db, &owner_id, &period)?;

    let tokens_used = window.as_ref().map(|w| w.total_tokens).unwrap_or(0);
    let tokens_remaining = tier
        .tokens_per_month
        .map(|limit| (limit - tokens_used).max(0));

    Ok(Json(json!({
        "period": period,
        "tier": tier.name,
        "tokens_used": tokens_used,
        "tokens_limit": tier.tokens_per_month,
        "tokens_remaining": tokens_remaining,
        "requests_per_minute": tier.requests_per_minute,
        "total_requests": window.as_ref().map(|w| w.total_requests).unwrap_or(0),
        "total_cost_micro": window.as_ref().map(|w| w.total_cost_micro).unwrap_or(0),
    })))
}
