//! Outbound status notifications.
//!
//! The state machine publishes a snapshot of the operation state on every
//! stage change and at each download progress step. Publishing never blocks
//! and never fails from the caller's point of view.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::OtaError;
use crate::state::OperationState;

/// Receives operation state snapshots.
pub trait StatusSink: Send + Sync {
    /// Hand off a snapshot. Must return immediately.
    fn publish(&self, state: &OperationState);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn publish(&self, _state: &OperationState) {}
}

/// Keeps every published snapshot in memory.
#[derive(Debug, Default)]
pub struct MemoryStatusSink {
    events: Mutex<Vec<OperationState>>,
}

impl MemoryStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OperationState> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl StatusSink for MemoryStatusSink {
    fn publish(&self, state: &OperationState) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(state.clone());
    }
}

/// POSTs snapshots as JSON to a monitoring endpoint.
///
/// Snapshots go through a bounded queue drained by a background task; when
/// the queue is full new snapshots are dropped.
#[derive(Debug, Clone)]
pub struct HttpStatusSink {
    tx: mpsc::Sender<OperationState>,
}

impl HttpStatusSink {
    /// Start the delivery task. Must be called inside a Tokio runtime.
    pub fn spawn(url: &str, timeout: Duration, queue_size: usize) -> Result<Self, OtaError> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| OtaError::Config(format!("invalid status sink url: {}", e)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OtaError::Config(format!("failed to create HTTP client: {}", e)))?;

        let (tx, mut rx) = mpsc::channel::<OperationState>(queue_size.max(1));
        tokio::spawn(async move {
            while let Some(state) = rx.recv().await {
                match client.post(url.clone()).json(&state).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        debug!("Status delivered: {:?} {}%", state.stage, state.progress);
                    }
                    Ok(resp) => warn!("Status sink answered {}", resp.status()),
                    Err(e) => warn!("Status sink unreachable: {}", e),
                }
            }
        });
        Ok(Self { tx })
    }
}

impl StatusSink for HttpStatusSink {
    fn publish(&self, state: &OperationState) {
        if let Err(e) = self.tx.try_send(state.clone()) {
            debug!("Dropping status event: {}", e);
        }
    }
}
