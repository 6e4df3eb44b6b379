//! Tracing subscriber setup.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "ota-agent.log";

/// Logging options from the command line.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Default level for the agent crates; `RUST_LOG` overrides it.
    pub level: String,
    pub json: bool,
    /// Directory for daily-rotated log files.
    pub dir: Option<PathBuf>,
}

impl LogOptions {
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "ota_agent={0},ota_core={0},tower_http={0}",
                self.level
            ))
        })
    }
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer when dropped and must be held
/// until the process exits.
pub fn init(opts: &LogOptions) -> anyhow::Result<Option<WorkerGuard>> {
    let console = if opts.json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };

    let (file, guard) = match &opts.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            let layer = if opts.json { layer.json().boxed() } else { layer.boxed() };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .with(opts.filter())
        .try_init()?;
    Ok(guard)
}
