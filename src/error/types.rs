//! Error types
//!
//! Defines domain-specific error types for each layer of the server, plus the
//! severity-tagged `ProtocolError` the connection engine acts on.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::protocol::codes::{PROTOCOL_NAME, PROTOCOL_VERSION, VERSION_HEADER};

/// Filesystem gateway errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file name error: {0}")]
    InvalidPath(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("invalid open flags for {path}: {reason}")]
    InvalidFlags { path: String, reason: &'static str },
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("rollback of {path} failed: {source}")]
    RollbackFailed {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    /// Classifies an I/O failure on the given logical path.
    pub fn from_io(path: &str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
            io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(path.to_string()),
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied(path.to_string()),
            io::ErrorKind::NotADirectory => StorageError::NotADirectory(path.to_string()),
            io::ErrorKind::IsADirectory => StorageError::IsADirectory(path.to_string()),
            _ => StorageError::Io {
                path: path.to_string(),
                source,
            },
        }
    }
}

/// Framing codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("stream I/O: {0}")]
    Io(#[from] io::Error),
    #[error("deadline expired while {0}")]
    TimedOut(&'static str),
    #[error("string of {len} bytes exceeds limit of {max}")]
    StringTooLong { len: usize, max: usize },
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
}

/// Token authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credential too short to hold hash and salt")]
    CredentialTooShort,
    #[error("proof mismatch")]
    Mismatch,
    #[error("expected AUTH opcode, got {0}")]
    WrongOpcode(u16),
}

/// Simple file endpoint errors; each one becomes a plain-text reply.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("{VERSION_HEADER}: {PROTOCOL_VERSION} required")]
    VersionRequired,
    #[error("expected Upgrade: {PROTOCOL_NAME}")]
    UpgradeRequired,
    #[error("Content-Length required")]
    LengthRequired,
    #[error("{0} is a directory")]
    IsDirectory(String),
    #[error("lock busy: {0}")]
    LockBusy(String),
    #[error("request body for {path} incomplete: {reason}")]
    IncompleteBody { path: String, reason: String },
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// How the connection engine reacts to a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Connection is torn down.
    Fatal,
    /// Well-formed request failed; the client gets a failure status.
    Warning,
    /// Client exceeded a soft protocol limit; reported like a warning.
    Notice,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Fatal => write!(f, "[Fatal]"),
            Severity::Warning => write!(f, "[Warning]"),
            Severity::Notice => write!(f, "[Notice]"),
        }
    }
}

/// Error raised while serving one upgraded connection.
#[derive(Debug, Error)]
#[error("{severity} {message}")]
pub struct ProtocolError {
    pub severity: Severity,
    pub message: String,
}

impl ProtocolError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Fatal,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Notice,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }
}

impl From<CodecError> for ProtocolError {
    fn from(error: CodecError) -> Self {
        ProtocolError::fatal(error.to_string())
    }
}

impl From<StorageError> for ProtocolError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::RollbackFailed { .. } => ProtocolError::fatal(error.to_string()),
            other => ProtocolError::warning(other.to_string()),
        }
    }
}

impl From<AuthError> for ProtocolError {
    fn from(error: AuthError) -> Self {
        ProtocolError::fatal(format!("handshake failed: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_classification() {
        let err = StorageError::from_io("/a", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, StorageError::NotFound(ref p) if p == "/a"));

        let err = StorageError::from_io("/a", io::Error::from(io::ErrorKind::AlreadyExists));
        assert!(matches!(err, StorageError::AlreadyExists(_)));

        let err = StorageError::from_io("/a", io::Error::other("disk on fire"));
        assert!(matches!(err, StorageError::Io { .. }));
    }

    #[test]
    fn test_severity_mapping() {
        let warning: ProtocolError = StorageError::NotFound("/x".into()).into();
        assert_eq!(warning.severity, Severity::Warning);

        let fatal: ProtocolError = StorageError::RollbackFailed {
            path: "/x".into(),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        }
        .into();
        assert!(fatal.is_fatal());

        let fatal: ProtocolError = CodecError::TimedOut("reading opcode").into();
        assert!(fatal.is_fatal());

        let fatal: ProtocolError = AuthError::Mismatch.into();
        assert!(fatal.is_fatal());
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::notice("too many entries");
        assert_eq!(err.to_string(), "[Notice] too many entries");
    }
}
