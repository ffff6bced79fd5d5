use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Peer error: {0}")]
    External(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::External(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<gatesync_core::Error> for AppError {
    fn from(error: gatesync_core::Error) -> Self {
        use gatesync_core::Error;

        match error {
            Error::NotFound(what) => Self::NotFound(what),
            Error::InvalidInput(message) => Self::BadRequest(message),
            Error::Duplicate(_) | Error::VersionConflict { .. } => Self::Conflict(error.to_string()),
            Error::Transport(message) => Self::External(message),
            other => {
                tracing::error!("Request failed: {other}");
                Self::Internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_http_statuses() {
        let cases = [
            (gatesync_core::Error::NotFound("user 9".into()), StatusCode::NOT_FOUND),
            (gatesync_core::Error::InvalidInput("bad".into()), StatusCode::BAD_REQUEST),
            (gatesync_core::Error::Duplicate("tag".into()), StatusCode::CONFLICT),
            (gatesync_core::Error::Transport("down".into()), StatusCode::BAD_GATEWAY),
            (gatesync_core::Error::Storage("poisoned".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(AppError::from(error).status(), status);
        }
    }
}
