use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rookery_core::error::CoreError;
use rookery_federation::FederationError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    /// A handle the client typed could not be used; `code` lets the client
    /// show the problem next to the input.
    #[error("{message}")]
    Handle { code: &'static str, message: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{0}")]
    Timeout(String),
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "not_found",
            ApiError::Unauthorized => "unauthorized",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Handle { code, .. } => code,
            ApiError::Conflict(_) => "conflict",
            ApiError::Timeout(_) => "propagation_timeout",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::Handle { .. } => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            ApiError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
            ApiError::Internal(err) => {
                tracing::error!("API internal error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        let code = self.code();
        (
            status,
            Json(json!({ "error": code, "message": message, "code": code })),
        )
            .into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidHandleFormat(_) => ApiError::Handle {
                code: "invalid_handle",
                message: e.to_string(),
            },
            CoreError::AmbiguousIdentity { .. } => ApiError::Handle {
                code: "ambiguous_identity",
                message: e.to_string(),
            },
            CoreError::UnknownIdentity(_) => ApiError::Handle {
                code: "unknown_identity",
                message: e.to_string(),
            },
            CoreError::PermissionDenied | CoreError::UnknownPeer(_) => {
                ApiError::Forbidden(e.to_string())
            }
            CoreError::UnknownRoom(_) => ApiError::NotFound(e.to_string()),
            CoreError::DuplicateEvent(_) | CoreError::OutOfOrder { .. } => {
                ApiError::Conflict(e.to_string())
            }
            CoreError::PropagationTimeout(_) => ApiError::Timeout(e.to_string()),
            CoreError::BadRequest(msg) => ApiError::BadRequest(msg),
            CoreError::Federation(
                FederationError::InvalidSignature | FederationError::Disabled,
            ) => ApiError::Forbidden(e.to_string()),
            CoreError::Database(_) => ApiError::Internal(anyhow::anyhow!("database error")),
            CoreError::Federation(err) => ApiError::Internal(anyhow::anyhow!(err.to_string())),
            CoreError::Internal(msg) => ApiError::Internal(anyhow::anyhow!(msg)),
        }
    }
}
