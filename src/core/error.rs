//! Error taxonomy shared by every layer of the service.
//!
//! Each variant corresponds to one row of the HTTP status mapping; the API
//! boundary owns the final translation into status codes and error bodies.

use thiserror::Error;

/// Filesystem service error taxonomy
#[derive(Error, Debug)]
pub enum FsError {
    /// The entry, link or resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// An entry already exists at the target path (or token collision)
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// No valid identity was presented
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A valid identity lacks permission for the operation
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Client-supplied input is malformed (bad path, bad body, bad range)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A single-use link is expired or already consumed
    #[error("gone: {0}")]
    Gone(String),

    /// A peer instance or the cluster leader failed to answer
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Transient condition (lock contention, apply timeout); safe to retry
    #[error("transient: {0}")]
    Transient(String),

    /// Unrecoverable internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl FsError {
    /// Whether the error describes a missing entry.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }

    /// Whether the error describes a duplicate entry.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, FsError::AlreadyExists(_))
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => FsError::NotFound(err.to_string()),
            ErrorKind::AlreadyExists => FsError::AlreadyExists(err.to_string()),
            ErrorKind::PermissionDenied => FsError::Forbidden(err.to_string()),
            _ => FsError::Internal(err.to_string()),
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(FsError::NotFound("x".into()).is_not_found());
        assert!(!FsError::NotFound("x".into()).is_already_exists());
        assert!(FsError::AlreadyExists("x".into()).is_already_exists());
    }

    #[test]
    fn test_io_error_mapping() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(FsError::from(err).is_not_found());

        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(FsError::from(err), FsError::Forbidden(_)));
    }
}
