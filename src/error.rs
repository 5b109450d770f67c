//! Error types for container execution and resource acquisition.

use std::path::PathBuf;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while preparing, fetching or running a container.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Manifest is structurally invalid or declares unsupported options.
    #[error("invalid container spec: {0}")]
    InvalidContainerSpec(String),

    /// Caller-supplied option is incompatible with the selected runtime.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // Communication Errors
    // =========================================================================
    /// Generic communication failure.
    #[error("communication error: {0}")]
    Communication(String),

    /// Resource could not be retrieved after exhausting retries.
    #[error("failed to retrieve '{resource}' after {attempts} attempt(s): {reason}")]
    CommunicationRetrieval {
        resource: String,
        attempts: u32,
        reason: String,
    },

    /// Authentication against a resource source failed.
    #[error("authentication with {source_name} failed: {reason}")]
    CommunicationAuthentication { source_name: String, reason: String },

    // =========================================================================
    // Integrity Errors
    // =========================================================================
    /// Computed hash disagrees with the expected one.
    #[error("hash mismatch for {subject}: expected {expected}, found {found}")]
    InvalidEntity {
        subject: String,
        expected: String,
        found: String,
    },

    /// Authenticated decryption failed.
    #[error(
        "failed to decrypt {path}: {reason}. The file may be corrupted; delete it and download it again"
    )]
    Decryption { path: PathBuf, reason: String },

    /// No usable key material for an encrypted container.
    #[error("no decryption key available for container '{container}': {guidance}")]
    MissingContainerKey { container: String, guidance: String },

    // =========================================================================
    // Execution Errors
    // =========================================================================
    /// Subprocess exited non-zero or the runtime executable is missing.
    #[error("execution failed: {0}")]
    Execution(String),

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Storage initialization failed.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInitFailed { path: PathBuf, reason: String },

    /// Storage write failed.
    #[error("failed to write to storage: {0}")]
    StorageWriteFailed(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (API misuse, should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl Error {
    /// Returns true for errors that must never be retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidContainerSpec(_)
                | Self::InvalidArgument(_)
                | Self::InvalidEntity { .. }
                | Self::Decryption { .. }
                | Self::MissingContainerKey { .. }
        )
    }
}
