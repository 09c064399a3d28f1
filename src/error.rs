use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    /// Missing, malformed or expired identity.
    #[error("Unauthorized: {0}")]
    Authorization(String),
    /// The identity is fine but the learner's state does not allow the operation yet.
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Dependency unavailable: {message}")]
    Dependency { message: String, retryable: bool },
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("Fatal error: {0}")]
    Fatal(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Error::Authorization(msg.into())
    }
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Error::Forbidden(msg.into())
    }
    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }
    pub fn dependency(msg: impl Into<String>) -> Self {
        Error::Dependency {
            message: msg.into(),
            retryable: true,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Authorization(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Dependency { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Storage(_) | Error::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            Error::Dependency { retryable, .. } => {
                json!({ "error": self.to_string(), "retryable": retryable })
            }
            // internal details stay in the log
            Error::Storage(e) => {
                tracing::error!("storage error: {}", e);
                json!({ "error": "Database error" })
            }
            Error::Fatal(e) => {
                tracing::error!("fatal error: {:?}", e);
                json!({ "error": "Internal server error" })
            }
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
