//! Errors surfaced to HTTP clients.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::headers::ContentRange;
use axum_extra::TypedHeader;
use serde::Serialize;

use crate::store::StoreError;

/// Message used when a backend failure carries no usable status.
const SERVICE_UNAVAILABLE: &str = "Service unavailable";

/// JSON body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub code: &'static str,
    pub message: String,
}

/// Every failure this crate can report. Each variant maps to exactly one
/// HTTP status, see [`Error::status`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Requested Range Unit Not Satisfiable")]
    RangeUnitUnsupported { size: u64 },

    #[error("Requested Range Not Satisfiable")]
    RangeNotSatisfiable { size: u64 },

    #[error("There is no collection \"{0}\"")]
    CollectionNotFound(String),

    #[error("There is no file \"{0}\"")]
    FileNotFound(String),

    #[error("There is no store \"{0}\"")]
    StoreNotFound(String),

    #[error("This file was not stored in the {0} store")]
    CopyNotFound(String),

    #[error("{message}")]
    AuthorizationDenied { status: StatusCode, message: String },

    #[error("{message}")]
    Streaming { status: StatusCode, message: String },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),
}

impl Error {
    /// Builds a streaming failure from a backend error. The backend's own
    /// status and message are kept only when it supplied both.
    pub fn streaming(err: &StoreError) -> Self {
        let message = err.to_string();
        match err.status() {
            Some(status) if !message.is_empty() => Error::Streaming { status, message },
            _ => Error::Streaming {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: SERVICE_UNAVAILABLE.to_string(),
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::RangeUnitUnsupported { .. } => "range_unit_unsupported",
            Self::RangeNotSatisfiable { .. } => "range_not_satisfiable",
            Self::CollectionNotFound(_) => "collection_not_found",
            Self::FileNotFound(_) => "file_not_found",
            Self::StoreNotFound(_) => "store_not_found",
            Self::CopyNotFound(_) => "copy_not_found",
            Self::AuthorizationDenied { .. } => "authorization_denied",
            Self::Streaming { .. } => "streaming_failure",
            Self::BadRequest(_) => "bad_request",
            Self::InvalidHeader(_) => "invalid_header",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RangeUnitUnsupported { .. } | Self::RangeNotSatisfiable { .. } => {
                StatusCode::RANGE_NOT_SATISFIABLE
            }
            Self::CollectionNotFound(_)
            | Self::FileNotFound(_)
            | Self::StoreNotFound(_)
            | Self::CopyNotFound(_) => StatusCode::NOT_FOUND,
            Self::AuthorizationDenied { status, .. } | Self::Streaming { status, .. } => *status,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::InvalidHeader(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::streaming(&err)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        // 416 responses advertise the complete length so clients can retry
        let unsatisfied = match &self {
            Self::RangeUnitUnsupported { size } | Self::RangeNotSatisfiable { size } => {
                Some(TypedHeader(ContentRange::unsatisfied_bytes(*size)))
            }
            _ => None,
        };
        let body = ErrorResponse {
            status: status.as_u16(),
            code: self.code(),
            message: self.to_string(),
        };
        (status, unsatisfied, Json(body)).into_response()
    }
}

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_keeps_backend_status() {
        let err = StoreError::Status {
            status: StatusCode::GONE,
            message: "object expired".to_string(),
        };
        let mapped = Error::streaming(&err);
        assert_eq!(StatusCode::GONE, mapped.status());
        assert_eq!("object expired", mapped.to_string());
    }

    #[test]
    fn test_streaming_defaults_to_service_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let mapped = Error::streaming(&StoreError::Io(io));
        assert_eq!(StatusCode::SERVICE_UNAVAILABLE, mapped.status());
        assert_eq!("Service unavailable", mapped.to_string());
    }

    #[test]
    fn test_range_error_response_carries_content_range() {
        let response = Error::RangeNotSatisfiable { size: 1000 }.into_response();
        assert_eq!(StatusCode::RANGE_NOT_SATISFIABLE, response.status());
        assert_eq!("bytes */1000", response.headers()["content-range"]);
    }
}
