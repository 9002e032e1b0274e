//! Error types for workqueue.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A create-if-absent write found a record already present.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A conditional write or delete was attempted under a stale version.
    #[error("version mismatch on {path} (expected {expected})")]
    VersionMismatch { path: String, expected: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// Mutual exclusion was broken: somebody else moved a lease we held.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error is the expected outcome of losing a race with
    /// another actor rather than a failure of the substrate.
    pub fn is_race_loss(&self) -> bool {
        matches!(
            self,
            Error::AlreadyExists(_) | Error::VersionMismatch { .. } | Error::NotFound(_)
        )
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Rpc(format!("{}: {}", status.code(), status.message()))
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Error::Rpc(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn race_losses_are_classified() {
        assert!(Error::AlreadyExists("queued/a".into()).is_race_loss());
        assert!(
            Error::VersionMismatch {
                path: "in-progress/a".into(),
                expected: "3".into(),
            }
            .is_race_loss()
        );
        assert!(Error::NotFound("queued/a".into()).is_race_loss());
        assert!(!Error::Storage("unavailable".into()).is_race_loss());
        assert!(!Error::InvariantViolation("double complete".into()).is_race_loss());
    }
}
