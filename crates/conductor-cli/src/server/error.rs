//! HTTP error surface: maps gateway failures onto status codes.

use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use uuid::Uuid;

use conductor_core::uploads::UploadError;
use conductor_db::StoreError;

/// An API-level error with a status code and a JSON body.
pub struct ApiError {
    status: StatusCode,
    message: String,
    correlation_id: Option<Uuid>,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
            correlation_id: None,
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
            correlation_id: None,
        }
    }

    /// An unexpected failure: logged with a correlation id, surfaced as a
    /// 500 whose body carries the id instead of the raw error.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        let correlation_id = Uuid::new_v4();
        tracing::error!(%correlation_id, error = %err, "internal error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_owned(),
            correlation_id: Some(correlation_id),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::ConflictingState(_) => StatusCode::CONFLICT,
            StoreError::ConstraintViolation(_) => StatusCode::BAD_REQUEST,
            StoreError::TransientBackend(_) | StoreError::Unavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            StoreError::Internal(_) => return Self::internal(err),
        };
        Self {
            status,
            message: err.to_string(),
            correlation_id: None,
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Invalid(msg) => Self::bad_request(msg),
            UploadError::Io(io) => Self::internal(io),
            UploadError::Store(store) => store.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = match self.correlation_id {
            Some(id) => serde_json::json!({ "error": self.message, "correlation_id": id }),
            None => serde_json::json!({ "error": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}
