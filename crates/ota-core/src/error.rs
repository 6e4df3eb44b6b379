//! Error types for the OTA engine.
//!
//! Every failure is a variant of [`OtaError`]. Each variant maps to a closed
//! [`ErrorCode`] that is surfaced to pollers, and to an [`ErrorKind`] that
//! drives the retry and cleanup policy of the state machine.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::service::ServiceStatus;

/// Stable, machine-readable error codes attached to the operation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NetworkError,
    DownloadTimeout,
    DownloadInterrupted,
    HttpStatus,
    ContentLengthMismatch,
    SizeMismatch,
    ChecksumMismatch,
    PackageExpired,
    PackageMissing,
    ManifestInvalid,
    UnsafePath,
    InvalidRequest,
    InvalidState,
    OperationConflict,
    ManualInterventionRequired,
    StagingFailed,
    ActivationFailed,
    ServiceStopFailed,
    ServiceStartFailed,
    ServiceQueryFailed,
    RollbackFailed,
    RollbackFatal,
    ConfigError,
    IoError,
    Internal,
}

impl ErrorCode {
    /// The wire representation, e.g. `CHECKSUM_MISMATCH`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkError => "NETWORK_ERROR",
            Self::DownloadTimeout => "DOWNLOAD_TIMEOUT",
            Self::DownloadInterrupted => "DOWNLOAD_INTERRUPTED",
            Self::HttpStatus => "HTTP_STATUS",
            Self::ContentLengthMismatch => "CONTENT_LENGTH_MISMATCH",
            Self::SizeMismatch => "SIZE_MISMATCH",
            Self::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Self::PackageExpired => "PACKAGE_EXPIRED",
            Self::PackageMissing => "PACKAGE_MISSING",
            Self::ManifestInvalid => "MANIFEST_INVALID",
            Self::UnsafePath => "UNSAFE_PATH",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::InvalidState => "INVALID_STATE",
            Self::OperationConflict => "OPERATION_CONFLICT",
            Self::ManualInterventionRequired => "MANUAL_INTERVENTION_REQUIRED",
            Self::StagingFailed => "STAGING_FAILED",
            Self::ActivationFailed => "ACTIVATION_FAILED",
            Self::ServiceStopFailed => "SERVICE_STOP_FAILED",
            Self::ServiceStartFailed => "SERVICE_START_FAILED",
            Self::ServiceQueryFailed => "SERVICE_QUERY_FAILED",
            Self::RollbackFailed => "ROLLBACK_FAILED",
            Self::RollbackFatal => "ROLLBACK_FATAL",
            Self::ConfigError => "CONFIG_ERROR",
            Self::IoError => "IO_ERROR",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classes, used to decide whether persisted state survives an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network timeout, reset, DNS. Retryable, persisted state is preserved.
    Transport,
    /// Size, checksum, expiry, manifest or path problems. The artifact is discarded.
    Validation,
    /// Copy, permission or disk problems while staging or activating.
    Deployment,
    /// Stop/start/health failures of managed services.
    ServiceControl,
    /// Rollback itself failed.
    Rollback,
    /// A command was rejected because of the current stage.
    Conflict,
    /// Anything else (local IO, configuration, task panics).
    Internal,
}

/// Rollback tier that was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RollbackLevel {
    /// Back to the last known-good snapshot.
    Previous,
    /// Back to the read-only factory snapshot.
    Factory,
}

impl fmt::Display for RollbackLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Previous => f.write_str("level 1 (previous)"),
            Self::Factory => f.write_str("level 2 (factory)"),
        }
    }
}

/// Errors that can occur during OTA operations.
#[derive(Debug, Error)]
pub enum OtaError {
    /// Network error during download
    #[error("network error: {0}")]
    Network(String),

    /// No data received within the read timeout
    #[error("download timed out: {url}")]
    Timeout { url: String },

    /// Download stopped between chunks because the process is shutting down
    #[error("download interrupted by shutdown")]
    Interrupted,

    /// Server answered with an unexpected HTTP status
    #[error("download failed with status {status}")]
    HttpStatus { status: u16 },

    /// Bytes transferred differ from the transport-declared length
    #[error("content length mismatch: server declared {declared}, received {received}")]
    ContentLengthMismatch { declared: u64, received: u64 },

    /// Bytes on disk differ from the size declared in the update command
    #[error("size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Computed digest differs from the expected checksum
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Verified package is older than the trust window
    #[error("package expired: verified {age_hours}h ago, trust window is {window_hours}h")]
    PackageExpired { age_hours: i64, window_hours: i64 },

    /// Verified package is gone from disk
    #[error("package missing: {0}")]
    PackageMissing(PathBuf),

    /// Manifest could not be parsed or violates its invariants
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// A path escapes the directory it must stay inside
    #[error("unsafe path: {0}")]
    UnsafePath(String),

    /// Malformed command
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Command does not apply to the current stage
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Another operation is in flight
    #[error("operation conflict: {active} is in progress")]
    Conflict { active: String },

    /// A previous fatal rollback has not been acknowledged
    #[error("manual intervention required: {0}")]
    ManualInterventionRequired(String),

    /// Building the new snapshot failed; nothing live was touched
    #[error("staging failed: {0}")]
    Staging(String),

    /// Swapping pointers or placing external files failed
    #[error("activation failed: {0}")]
    Activation(String),

    /// Service did not stop within its timeout
    #[error("failed to stop service {service}: {reason}")]
    ServiceStopFailed { service: String, reason: String },

    /// Service did not become active within its timeout
    #[error("failed to start service {service}: {reason}")]
    ServiceStartFailed { service: String, reason: String },

    /// Service manager could not be queried
    #[error("failed to query service {service}: {reason}")]
    ServiceQueryFailed { service: String, reason: String },

    /// Service never reached a non-start/stop target status
    #[error("service {service} did not reach {target} (last seen {last})")]
    ServiceWaitTimeout {
        service: String,
        target: ServiceStatus,
        last: ServiceStatus,
    },

    /// Deployment failed and the device was rolled back
    #[error("{cause}; rolled back via {level}")]
    RolledBack {
        level: RollbackLevel,
        cause: Box<OtaError>,
    },

    /// A single rollback tier failed
    #[error("rollback {level} failed: {reason}")]
    RollbackFailed { level: RollbackLevel, reason: String },

    /// Deployment and both rollback tiers failed
    #[error("deployment failed ({deploy}); level 1 rollback failed ({previous}); level 2 rollback failed ({factory})")]
    RollbackFatal {
        deploy: String,
        previous: String,
        factory: String,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Worker task panicked or was cancelled
    #[error("internal error: {0}")]
    Internal(String),

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OtaError {
    /// The error code reported to pollers.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Network(_) => ErrorCode::NetworkError,
            Self::Timeout { .. } => ErrorCode::DownloadTimeout,
            Self::Interrupted => ErrorCode::DownloadInterrupted,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::ContentLengthMismatch { .. } => ErrorCode::ContentLengthMismatch,
            Self::SizeMismatch { .. } => ErrorCode::SizeMismatch,
            Self::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            Self::PackageExpired { .. } => ErrorCode::PackageExpired,
            Self::PackageMissing(_) => ErrorCode::PackageMissing,
            Self::InvalidManifest(_) => ErrorCode::ManifestInvalid,
            Self::UnsafePath(_) => ErrorCode::UnsafePath,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::InvalidState(_) => ErrorCode::InvalidState,
            Self::Conflict { .. } => ErrorCode::OperationConflict,
            Self::ManualInterventionRequired(_) => ErrorCode::ManualInterventionRequired,
            Self::Staging(_) => ErrorCode::StagingFailed,
            Self::Activation(_) => ErrorCode::ActivationFailed,
            Self::ServiceStopFailed { .. } => ErrorCode::ServiceStopFailed,
            Self::ServiceStartFailed { .. } => ErrorCode::ServiceStartFailed,
            Self::ServiceQueryFailed { .. } => ErrorCode::ServiceQueryFailed,
            Self::ServiceWaitTimeout { target, .. } => match target {
                ServiceStatus::Active => ErrorCode::ServiceStartFailed,
                _ => ErrorCode::ServiceStopFailed,
            },
            // The attempted version failed for the cause's reason; the
            // rollback is noted in the message.
            Self::RolledBack { cause, .. } => cause.code(),
            Self::RollbackFailed { .. } => ErrorCode::RollbackFailed,
            Self::RollbackFatal { .. } => ErrorCode::RollbackFatal,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Internal(_) => ErrorCode::Internal,
            Self::Json(_) => ErrorCode::Internal,
            Self::Io(_) => ErrorCode::IoError,
        }
    }

    /// Failure class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) | Self::Timeout { .. } | Self::Interrupted | Self::HttpStatus { .. } => {
                ErrorKind::Transport
            }
            Self::ContentLengthMismatch { .. }
            | Self::SizeMismatch { .. }
            | Self::ChecksumMismatch { .. }
            | Self::PackageExpired { .. }
            | Self::PackageMissing(_)
            | Self::InvalidManifest(_)
            | Self::UnsafePath(_)
            | Self::InvalidRequest(_) => ErrorKind::Validation,
            Self::InvalidState(_) | Self::Conflict { .. } | Self::ManualInterventionRequired(_) => {
                ErrorKind::Conflict
            }
            Self::Staging(_) | Self::Activation(_) => ErrorKind::Deployment,
            Self::ServiceStopFailed { .. }
            | Self::ServiceStartFailed { .. }
            | Self::ServiceQueryFailed { .. }
            | Self::ServiceWaitTimeout { .. } => ErrorKind::ServiceControl,
            Self::RolledBack { cause, .. } => cause.kind(),
            Self::RollbackFailed { .. } | Self::RollbackFatal { .. } => ErrorKind::Rollback,
            Self::Config(_) | Self::Internal(_) | Self::Json(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether a later attempt may succeed by resuming from persisted state.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpStatus { status } => *status >= 500 || *status == 408 || *status == 429,
            Self::Interrupted => false,
            other => other.kind() == ErrorKind::Transport,
        }
    }

    /// Whether the persisted download record must be kept after this error.
    pub fn preserves_progress(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    /// Whether the error requires manual recovery and must never be auto-cleared.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RollbackFatal { .. })
    }
}

impl From<reqwest::Error> for OtaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            OtaError::Timeout {
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else if let Some(status) = err.status() {
            OtaError::HttpStatus {
                status: status.as_u16(),
            }
        } else {
            OtaError::Network(err.to_string())
        }
    }
}

impl From<semver::Error> for OtaError {
    fn from(err: semver::Error) -> Self {
        OtaError::InvalidManifest(format!("invalid version: {}", err))
    }
}

/// Structured `{code, message}` pair attached to the operation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&OtaError> for ErrorInfo {
    fn from(err: &OtaError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_retryable() {
        assert!(OtaError::Network("reset".into()).is_retryable());
        assert!(OtaError::Timeout { url: "u".into() }.is_retryable());
        assert!(OtaError::HttpStatus { status: 503 }.is_retryable());
        assert!(!OtaError::HttpStatus { status: 404 }.is_retryable());
        assert!(OtaError::HttpStatus { status: 404 }.preserves_progress());
    }

    #[test]
    fn test_validation_errors_discard_progress() {
        let err = OtaError::SizeMismatch {
            expected: 1000,
            actual: 10,
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_retryable());
        assert!(!err.preserves_progress());
        assert_eq!(err.code(), ErrorCode::SizeMismatch);
    }

    #[test]
    fn test_rolled_back_reports_cause_code() {
        let err = OtaError::RolledBack {
            level: RollbackLevel::Previous,
            cause: Box::new(OtaError::ServiceStartFailed {
                service: "app.service".into(),
                reason: "timeout".into(),
            }),
        };
        assert_eq!(err.code(), ErrorCode::ServiceStartFailed);
        assert!(err.to_string().contains("level 1"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_wait_timeout_code_follows_target() {
        let start = OtaError::ServiceWaitTimeout {
            service: "a".into(),
            target: ServiceStatus::Active,
            last: ServiceStatus::Failed,
        };
        let stop = OtaError::ServiceWaitTimeout {
            service: "a".into(),
            target: ServiceStatus::Inactive,
            last: ServiceStatus::Active,
        };
        assert_eq!(start.code(), ErrorCode::ServiceStartFailed);
        assert_eq!(stop.code(), ErrorCode::ServiceStopFailed);
    }

    #[test]
    fn test_error_code_wire_format() {
        let json = serde_json::to_string(&ErrorCode::ChecksumMismatch).unwrap();
        assert_eq!(json, "\"CHECKSUM_MISMATCH\"");
        assert_eq!(ErrorCode::RollbackFatal.as_str(), "ROLLBACK_FATAL");

        let info = ErrorInfo::from(&OtaError::RollbackFatal {
            deploy: "a".into(),
            previous: "b".into(),
            factory: "c".into(),
        });
        assert_eq!(info.code, ErrorCode::RollbackFatal);
    }
}
