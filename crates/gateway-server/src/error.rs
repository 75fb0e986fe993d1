//! API error responses.
//!
//! Every error surfaced at the HTTP boundary carries a machine-readable
//! code and a human-readable message; quota and availability errors also
//! carry a `Retry-After` hint.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use gateway_core::GatewayError;
use serde::Serialize;

/// Error payload returned to callers
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Error envelope
    pub error: ErrorDetail,
}

/// The error itself
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Machine-readable code, e.g. "rate_limit_exceeded"
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Seconds after which a retry may succeed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// API-boundary error wrapping the shared taxonomy
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let retry_after = self.0.retry_after().map(|d| d.as_secs().max(1));

        let body = ErrorBody {
            error: ErrorDetail {
                code: self.0.error_code().to_string(),
                message: self.0.to_string(),
                retry_after,
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
