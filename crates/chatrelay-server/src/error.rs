//! Mapping of relay and store errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chatrelay_chat::RelayError;
use serde_json::json;
use tracing::error;

/// Handler error, rendered as `{"error": "..."}` with a matching status.
#[derive(Debug)]
pub struct ApiError(pub RelayError);

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError(RelayError::InvalidRequest(msg.into()))
    }

    pub fn status(&self) -> StatusCode {
        match &self.0 {
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            // Unconfigured provider is a client mistake, not an outage.
            RelayError::ProviderUnavailable(_) => StatusCode::BAD_REQUEST,
            RelayError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::StreamInterrupted { .. } => StatusCode::BAD_GATEWAY,
            RelayError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        ApiError(err)
    }
}

impl From<chatrelay_core::Error> for ApiError {
    fn from(err: chatrelay_core::Error) -> Self {
        ApiError(RelayError::from(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self.0 {
            RelayError::InvalidRequest(msg)
            | RelayError::ProviderUnavailable(msg)
            | RelayError::SessionNotFound(msg) => json!({ "error": msg }),
            RelayError::StreamInterrupted {
                partial,
                fragments,
                reason,
            } => json!({ "error": reason, "partial": partial, "fragments": fragments }),
            RelayError::Storage(msg) => {
                error!("Storage failure: {}", msg);
                json!({ "error": "storage failure" })
            }
        };
        (status, Json(body)).into_response()
    }
}
