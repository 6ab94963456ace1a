//! Error taxonomy.
//!
//! Operation-level errors (`ConnectionError`) are absorbed by workers and only
//! show up as counters. Foreman- and network-level errors become the failure of
//! one foreman. Only a job where no foreman reported surfaces as an `Err` from
//! [`crate::manager::Manager::run`].

use std::time::Duration;

use crate::report::ForemanFailure;

pub type Result<T> = std::result::Result<T, BenchError>;

/// How a failed operation is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// I/O or timeout; the run continues with the next index.
    Transient,
    /// The key was absent. Counted as a failure and also tallied on its own.
    NotFound,
    /// Stored object size differs from the buffer. Never retried.
    SizeMismatch,
    /// Bytes read back differ from the generated content. Never retried.
    ContentMismatch,
}

impl FailureClass {
    /// Correctness violations are reported apart from transient I/O failures.
    pub fn is_correctness(self) -> bool {
        matches!(self, FailureClass::SizeMismatch | FailureClass::ContentMismatch)
    }
}

/// Errors raised by a storage backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("operation made no progress for {0:?}")]
    Timeout(Duration),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object has wrong size: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}

impl ConnectionError {
    pub fn class(&self) -> FailureClass {
        match self {
            ConnectionError::NotFound(_) => FailureClass::NotFound,
            ConnectionError::SizeMismatch { .. } => FailureClass::SizeMismatch,
            _ => FailureClass::Transient,
        }
    }

    /// Map a local filesystem error onto the backend taxonomy.
    pub fn from_io(err: std::io::Error, what: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ConnectionError::NotFound(what.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                ConnectionError::PermissionDenied(format!("{what}: {err}"))
            }
            std::io::ErrorKind::TimedOut => ConnectionError::Timeout(Duration::ZERO),
            _ => ConnectionError::Io(format!("{what}: {err}")),
        }
    }
}

/// Why a foreman refused an order. Travels on the wire as `ConfigError.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConfigErrorKind {
    InvalidOrder,
    /// The foreman was already running another job.
    Busy,
    BackendUnavailable,
    PermissionDenied,
}

/// Errors at foreman, network and job level.
#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    /// Bad order or job, caught before any I/O.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The backend could not be reached or refused namespace setup.
    #[error(transparent)]
    Backend(#[from] ConnectionError),

    /// Manager to foreman link lost or never established.
    #[error("network error: {0}")]
    Network(String),

    /// A peer sent a message out of sequence or one that could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No foreman produced a report.
    #[error("job failed on all {} foremen", failures.len())]
    TotalJobFailure { failures: Vec<ForemanFailure> },
}

impl BenchError {
    /// How a configuration-time failure is reported to the manager.
    pub fn config_kind(&self) -> ConfigErrorKind {
        match self {
            BenchError::Config(_) | BenchError::Protocol(_) => ConfigErrorKind::InvalidOrder,
            BenchError::Backend(ConnectionError::PermissionDenied(_)) => {
                ConfigErrorKind::PermissionDenied
            }
            BenchError::Backend(ConnectionError::InvalidCredentials(_)) => {
                ConfigErrorKind::InvalidOrder
            }
            BenchError::Backend(_) | BenchError::Network(_) | BenchError::TotalJobFailure { .. } => {
                ConfigErrorKind::BackendUnavailable
            }
        }
    }
}

impl From<tonic::Status> for BenchError {
    fn from(status: tonic::Status) -> Self {
        BenchError::Network(format!("{}: {}", status.code(), status.message()))
    }
}

impl From<tonic::transport::Error> for BenchError {
    fn from(err: tonic::transport::Error) -> Self {
        BenchError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(ConnectionError::NotFound("k".into()).class(), FailureClass::NotFound);
        assert_eq!(
            ConnectionError::SizeMismatch { expected: 4, actual: 3 }.class(),
            FailureClass::SizeMismatch
        );
        assert_eq!(ConnectionError::Io("boom".into()).class(), FailureClass::Transient);
        assert_eq!(
            ConnectionError::Timeout(Duration::from_secs(1)).class(),
            FailureClass::Transient
        );
        assert!(FailureClass::SizeMismatch.is_correctness());
        assert!(FailureClass::ContentMismatch.is_correctness());
        assert!(!FailureClass::NotFound.is_correctness());
    }

    #[test]
    fn test_config_kind_mapping() {
        let kind = |e: BenchError| e.config_kind();
        assert_eq!(kind(BenchError::Config("x".into())), ConfigErrorKind::InvalidOrder);
        assert_eq!(
            kind(ConnectionError::PermissionDenied("x".into()).into()),
            ConfigErrorKind::PermissionDenied
        );
        assert_eq!(
            kind(ConnectionError::InvalidCredentials("x".into()).into()),
            ConfigErrorKind::InvalidOrder
        );
        assert_eq!(
            kind(ConnectionError::BackendUnavailable("x".into()).into()),
            ConfigErrorKind::BackendUnavailable
        );
    }

    #[test]
    fn test_from_io_maps_not_found() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(ConnectionError::from_io(err, "obj_1"), ConnectionError::NotFound(k) if k == "obj_1"));
    }
}
