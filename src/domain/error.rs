use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Domain-level errors for Termitas.
#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network request blocked: {reason}")]
    NetworkBlocked { reason: String },

    #[error("HTTP request failed: {0}")]
    HttpRequest(String),

    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Hub error: {0}")]
    Hub(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Model {0} is not ready")]
    ModelNotReady(String),

    #[error("{model_id} ships several weight variants; choose one of: {}", .options.join(", "))]
    WeightsChoiceRequired { model_id: String, options: Vec<String> },

    #[error("Artifact not found: {model_id}/{file_name}")]
    ArtifactNotFound { model_id: String, file_name: String },

    #[error("Hardware detection error: {0}")]
    Hardware(String),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl From<std::io::Error> for DomainError {
    fn from(err: std::io::Error) -> Self {
        DomainError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for DomainError {
    fn from(err: toml::de::Error) -> Self {
        DomainError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for DomainError {
    fn from(err: toml::ser::Error) -> Self {
        DomainError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::Serialization(err.to_string())
    }
}

/// Failure of a single artifact transfer.
///
/// The variant decides what the coordinator does next: transient failures
/// are retried at the same offset, range and integrity failures restart the
/// record from zero, and the rest fail the record until a user retries it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Network drop, timeout, or server-side 5xx.
    #[error("Transient transfer error: {0}")]
    Transient(String),

    /// The server rejected or misreported the resumption offset.
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// Size or checksum mismatch on a fully received file.
    #[error("Integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    /// Disk full, permission denied, invalid path.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Non-retryable refusal from the remote (401, 403, 404) or the network guard.
    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl TransferError {
    pub fn kind(&self) -> TransferErrorKind {
        match self {
            TransferError::Transient(_) => TransferErrorKind::Transient,
            TransferError::InvalidRange(_) => TransferErrorKind::InvalidRange,
            TransferError::Integrity { .. } => TransferErrorKind::Integrity,
            TransferError::Storage(_) => TransferErrorKind::Storage,
            TransferError::Rejected(_) => TransferErrorKind::Rejected,
        }
    }

    /// Whether the same request may be re-issued at the same offset.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Transient(_))
    }

    /// Whether the partial data must be thrown away before the next attempt.
    #[must_use]
    pub fn requires_restart(&self) -> bool {
        matches!(
            self,
            TransferError::InvalidRange(_) | TransferError::Integrity { .. }
        )
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Storage(err.to_string())
    }
}

/// Serializable tag of a [`TransferError`], carried in progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferErrorKind {
    Transient,
    InvalidRange,
    Integrity,
    Storage,
    Rejected,
}
