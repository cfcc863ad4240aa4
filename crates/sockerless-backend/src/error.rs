//! Error types for the backend HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use sockerless_core::CoreError;
use thiserror::Error;

/// Result type alias for handler operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors returned by handlers.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Error from the runtime core.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Malformed request: bad JSON body or query value.
    #[error("{0}")]
    BadRequest(String),

    /// Server-side failure outside the core.
    #[error("{0}")]
    Server(String),
}

impl BackendError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Core(err) => match err {
                CoreError::NotFound { .. } | CoreError::Ambiguous { .. } => StatusCode::NOT_FOUND,
                CoreError::NameConflict { .. } | CoreError::StateConflict(_) => StatusCode::CONFLICT,
                CoreError::Validation(_) => StatusCode::BAD_REQUEST,
                CoreError::FactoryUnavailable(_) | CoreError::NotImplemented(_) => {
                    StatusCode::NOT_IMPLEMENTED
                }
                CoreError::Internal(_) | CoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message sent to the client. Internal details are logged, not returned.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::Core(CoreError::Ambiguous { kind, id }) => format!("No such {kind}: {id}"),
            _ if self.status_code() == StatusCode::INTERNAL_SERVER_ERROR => {
                "internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }
}

/// Docker API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message.
    pub message: String,
}

impl IntoResponse for BackendError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "request rejected");
        }
        let body = ErrorResponse {
            message: self.client_message(),
        };
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sockerless_core::ObjectKind;

    #[test]
    fn core_errors_map_to_docker_statuses() {
        let cases = [
            (CoreError::container_not_found("x"), StatusCode::NOT_FOUND),
            (CoreError::state_conflict("busy"), StatusCode::CONFLICT),
            (CoreError::validation("bad"), StatusCode::BAD_REQUEST),
            (CoreError::FactoryUnavailable("none".into()), StatusCode::NOT_IMPLEMENTED),
            (CoreError::NotImplemented("pause".into()), StatusCode::NOT_IMPLEMENTED),
            (CoreError::internal("boom"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(BackendError::from(err).status_code(), status);
        }
    }

    #[test]
    fn internal_details_are_redacted() {
        let err = BackendError::from(CoreError::internal("db password leaked"));
        assert_eq!(err.client_message(), "internal server error");
    }

    #[test]
    fn ambiguity_reads_as_not_found() {
        let err = BackendError::from(CoreError::Ambiguous {
            kind: ObjectKind::Container,
            id: "abcabcabcabc".into(),
        });
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.client_message(), "No such container: abcabcabcabc");
    }
}
