//! Error handlers
//!
//! Maps errors onto log levels and HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use log::{error, warn};

use crate::error::types::{HttpError, ProtocolError, Severity, StorageError};

/// Logs a protocol error at the level its severity calls for.
pub fn log_protocol_error(err: &ProtocolError, peer: &str) {
    match err.severity {
        Severity::Fatal => error!("{} {}", err, peer),
        Severity::Warning | Severity::Notice => warn!("{} {}", err, peer),
    }
}

/// Convert a storage error to an HTTP status code
pub fn storage_error_to_http(err: &StorageError) -> StatusCode {
    match err {
        StorageError::InvalidPath(_) | StorageError::InvalidFlags { .. } => StatusCode::BAD_REQUEST,
        StorageError::NotFound(_) => StatusCode::NOT_FOUND,
        StorageError::AlreadyExists(_) => StatusCode::CONFLICT,
        StorageError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        StorageError::NotADirectory(_) | StorageError::IsADirectory(_) => StatusCode::BAD_REQUEST,
        StorageError::Io { .. } | StorageError::RollbackFailed { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub fn http_error_status(err: &HttpError) -> StatusCode {
    match err {
        HttpError::VersionRequired | HttpError::UpgradeRequired => StatusCode::PRECONDITION_FAILED,
        HttpError::LengthRequired => StatusCode::LENGTH_REQUIRED,
        HttpError::IsDirectory(_) => StatusCode::NOT_FOUND,
        HttpError::LockBusy(_) => StatusCode::SERVICE_UNAVAILABLE,
        HttpError::IncompleteBody { .. } => StatusCode::BAD_REQUEST,
        HttpError::Auth(_) => StatusCode::FORBIDDEN,
        HttpError::Storage(e) => storage_error_to_http(e),
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (http_error_status(&self), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthError;

    #[test]
    fn test_storage_error_to_http() {
        assert_eq!(
            storage_error_to_http(&StorageError::NotFound("/a".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            storage_error_to_http(&StorageError::AlreadyExists("/a".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            storage_error_to_http(&StorageError::InvalidPath("/".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_http_error_status() {
        assert_eq!(
            http_error_status(&HttpError::VersionRequired),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(
            http_error_status(&HttpError::Auth(AuthError::Mismatch)),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            http_error_status(&HttpError::LockBusy("/f".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            http_error_status(&HttpError::Storage(StorageError::AlreadyExists("/f".into()))),
            StatusCode::CONFLICT
        );
    }
}
