//! The HTTP gateway's error envelope: maps the core's error taxonomy
//! (Validation/Transient/Fatal — `Cancelled` never reaches here, it's a
//! terminal run status, not an error) onto HTTP status codes and the
//! `{error, message, details?, request_id?}` response body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::fmt;

/// Errors the HTTP gateway can return, independent of which library crate
/// raised them.
#[derive(Debug)]
pub enum ApiError {
    /// The request body failed validation (bad plan, malformed JSON).
    InvalidRequest(String),
    /// No run with the given ID is known to the store.
    RunNotFound(String),
    /// The requested transition conflicts with the run's current state.
    Conflict(String),
    /// The Run Store could not be reached.
    StoreUnavailable(String),
    /// An invariant was violated; logged at `error!`, never panics.
    Internal(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            Self::RunNotFound(msg) => write!(f, "run not found: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::StoreUnavailable(msg) => write!(f, "run store unavailable: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    request_id: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::RunNotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::RunNotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, Self::Internal(_)) {
            tracing::error!(error = %self, "internal invariant violation");
        }
        let status = self.status();
        let request_id = ulid::Ulid::new().to_string();
        let body = ErrorBody {
            error: self.error_code(),
            message: self.to_string(),
            details: None,
            request_id,
        };
        (status, Json(body)).into_response()
    }
}

impl From<mentatlab_plan::PlanError> for ApiError {
    fn from(err: mentatlab_plan::PlanError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

impl From<mentatlab_runstore::RunStoreError> for ApiError {
    fn from(err: mentatlab_runstore::RunStoreError) -> Self {
        use mentatlab_runstore::RunStoreError as E;
        match err {
            E::NotFound(msg) => Self::RunNotFound(msg),
            E::Conflict(msg) => Self::Conflict(msg),
            E::Unavailable(msg) => Self::StoreUnavailable(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let err = ApiError::RunNotFound("run_x".to_string());
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn conflict_maps_to_409() {
        let err = ApiError::Conflict("already terminal".to_string());
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }
}
