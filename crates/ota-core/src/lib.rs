//! # ota-core
//!
//! Over-the-air update engine for a single field-deployed device.
//!
//! This crate handles:
//! - The operation state machine with a crash-safe persisted record and
//!   startup self-healing
//! - Resumable artifact downloads with size and SHA-256 validation
//! - Version snapshots activated by atomic symlink swaps, with rollback to
//!   the previous snapshot and then to the factory snapshot
//! - Stopping and starting managed services around activation
//!
//! ## Reliability
//!
//! - Nothing live is touched until a snapshot is completely staged
//! - `current` is switched with a single rename
//! - Download progress survives restarts and network drops
//! - A verified package is only installable inside its trust window

pub mod archive;
pub mod backup;
pub mod checksum;
pub mod clock;
pub mod config;
pub mod deploy;
pub mod display;
pub mod download;
pub mod error;
pub mod manager;
pub mod manifest;
pub mod notify;
#[cfg(test)]
mod proptests;
pub mod record;
pub mod service;
pub mod shutdown;
pub mod state;

// Re-export main types for convenience
pub use archive::ArtifactUnpacker;
pub use backup::{BackupEntry, BackupJournal};
pub use checksum::{parse_digest, ChecksumVerifier, Sha256Digest, StreamingHasher};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    DeploySettings, DisplayConfig, NetworkConfig, NotifyConfig, OperationConfig, OtaConfig,
    PathsConfig,
};
pub use deploy::{DeployConfig, DeployEngine, DeployPhase, DeployReport, Recovery};
pub use display::{DisplayHandle, ProgressDisplay};
pub use download::{
    CheckpointPolicy, DownloadProgress, Downloader, DownloaderConfig, FetchObserver, FetchOutcome,
    FetchRequest,
};
pub use error::{ErrorCode, ErrorInfo, ErrorKind, OtaError, RollbackLevel};
pub use manager::{CommandAck, DownloadCommand, InstallCommand, OtaManager, OtaManagerBuilder};
pub use manifest::{Manifest, Module, Placement};
pub use notify::{HttpStatusSink, MemoryStatusSink, NullStatusSink, StatusSink};
pub use record::{StateRecord, StateStore};
pub use service::{ScriptedBackend, ServiceBackend, ServiceController, ServiceStatus, SystemdBackend};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use state::{OperationState, Stage};
