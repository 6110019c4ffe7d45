use axum::{
    http::{header::RETRY_AFTER, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Service-level error taxonomy. Every rejection carries a machine-readable
/// `error.type` so clients can implement automated backoff.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    /// Requested model id is not in the catalog. Same 400 status as
    /// BadRequest but a distinct type, so clients can tell a typo from a
    /// malformed payload.
    #[error("{0}")]
    UnknownModel(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    /// `retry_after` is the unix-second start of the next minute window.
    #[error("rate limit exceeded")]
    RateLimited { retry_after: i64 },
    #[error("monthly token quota exhausted")]
    QuotaExceeded,
    /// Upstream provider failed. The raw upstream body is logged, never
    /// forwarded to the caller.
    #[error("upstream provider error")]
    ProviderFailure { status: Option<u16> },
    #[error("internal server error")]
    Internal(String),
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::UnknownModel(_) => "unknown_model",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::QuotaExceeded => "quota_exceeded",
            ApiError::ProviderFailure { .. } => "provider_error",
            ApiError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::UnknownModel(_) | ApiError::QuotaExceeded => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ProviderFailure { status } => match status {
                Some(_) => StatusCode::BAD_GATEWAY,
                None => StatusCode::SERVICE_UNAVAILABLE,
            },
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn public_message(&self) -> String {
        match self {
            // Internal detail stays in the logs.
            ApiError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<diesel::result::Error> for ApiError {
    fn from(err: diesel::result::Error) -> Self {
        ApiError::Internal(format!("database error: {}", err))
    }
}

impl From<r2d2::Error> for ApiError {
    fn from(err: r2d2::Error) -> Self {
        ApiError::Internal(format!("connection pool error: {}", err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(detail) = &self {
            tracing::error!("internal error surfaced to caller: {}", detail);
        }

        let mut error_body = json!({
            "type": self.kind(),
            "message": self.public_message(),
        });
        if let ApiError::RateLimited { retry_after } = &self {
            error_body["retry_after"] = json!(retry_after);
        }
        if let ApiError::ProviderFailure { status: Some(s) } = &self {
            error_body["upstream_status"] = json!(s);
        }

        let body = Json(json!({ "error": error_body }));
        let mut response = (self.status_code(), body).into_response();
        if let ApiError::RateLimited { retry_after } = &self {
            // The body carries the absolute window-start timestamp; the
            // header wants delta-seconds per RFC 9110.
            let delta = (retry_after - chrono::Utc::now().timestamp()).max(0);
            if let Ok(value) = delta.to_string().parse() {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            ApiError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Unauthorized("x".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::RateLimited { retry_after: 0 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(ApiError::QuotaExceeded.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::ProviderFailure { status: Some(503) }.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::ProviderFailure { status: None }.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn unknown_model_is_a_bad_request_with_its_own_kind() {
        let err = ApiError::UnknownModel("model 'ghost' not found".into());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.kind(), "unknown_model");
    }

    #[test]
    fn retry_after_header_is_delta_seconds() {
        let soon = chrono::Utc::now().timestamp() + 30;
        let response = ApiError::RateLimited { retry_after: soon }.into_response();
        let header: i64 = response
            .headers()
            .get(RETRY_AFTER)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=30).contains(&header));

        // A window boundary already in the past clamps to zero.
        let response = ApiError::RateLimited { retry_after: 0 }.into_response();
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "0");
    }

    #[test]
    fn quota_and_bad_request_share_status_but_not_kind() {
        let quota = ApiError::QuotaExceeded;
        let bad = ApiError::BadRequest("x".into());
        assert_eq!(quota.status_code(), bad.status_code());
        assert_ne!(quota.kind(), bad.kind());
    }

    #[test]
    fn internal_detail_is_not_leaked() {
        let err = ApiError::Internal("secret connection string".into());
        assert_eq!(err.public_message(), "internal server error");
    }
}
