//! Operation state exposed to pollers.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorInfo, OtaError};

/// Lifecycle stage of the OTA operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    #[default]
    Idle,
    Downloading,
    Verifying,
    ToInstall,
    Installing,
    Success,
    Failed,
}

impl Stage {
    /// Stages in which a worker task is running.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Downloading | Self::Verifying | Self::Installing)
    }

    /// Terminal stages that settle back to `Idle`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// In-memory snapshot of the current operation, returned by progress queries.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OperationState {
    pub stage: Stage,
    /// 0-100 within the current stage.
    pub progress: u8,
    pub message: String,
    pub error: Option<ErrorInfo>,
}

impl OperationState {
    pub fn idle() -> Self {
        Self {
            stage: Stage::Idle,
            progress: 0,
            message: "idle".to_string(),
            error: None,
        }
    }

    pub fn new(stage: Stage, progress: u8, message: impl Into<String>) -> Self {
        Self {
            stage,
            progress: progress.min(100),
            message: message.into(),
            error: None,
        }
    }

    pub fn failed(err: &OtaError) -> Self {
        Self {
            stage: Stage::Failed,
            progress: 0,
            message: err.to_string(),
            error: Some(ErrorInfo::from(err)),
        }
    }
}

/// Download percentage, clamped to 0..=100.
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done.min(total) as u128 * 100) / total as u128) as u8
}
