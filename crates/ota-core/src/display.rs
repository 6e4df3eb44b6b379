//! Optional progress display process shown while an install runs.

use std::path::PathBuf;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Launches and stops the configured display command.
#[derive(Debug, Clone, Default)]
pub struct ProgressDisplay {
    command: Option<PathBuf>,
    args: Vec<String>,
}

/// A running display. Killed when dropped.
#[derive(Debug)]
pub struct DisplayHandle {
    child: Option<Child>,
}

impl ProgressDisplay {
    pub fn new(command: Option<PathBuf>, args: Vec<String>) -> Self {
        Self { command, args }
    }

    /// No display at all.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Start the display. Failures are logged; the returned handle is then
    /// inert.
    pub fn launch(&self) -> DisplayHandle {
        let Some(command) = &self.command else {
            return DisplayHandle { child: None };
        };

        match Command::new(command)
            .args(&self.args)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => {
                info!("Progress display started: {:?}", command);
                DisplayHandle { child: Some(child) }
            }
            Err(e) => {
                warn!("Failed to start progress display {:?}: {}", command, e);
                DisplayHandle { child: None }
            }
        }
    }
}

impl DisplayHandle {
    pub fn is_running(&mut self) -> bool {
        match &mut self.child {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Stop the display and reap it.
    pub async fn close(mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!("Progress display already gone: {}", e);
            }
        }
    }
}
