//! Logging setup for the `slotflow` binary.
//!
//! Two sinks: human (or JSON) lines on stderr, and a daily-rolling JSON file
//! under `<state_dir>/logs/`. `RUST_LOG` overrides the default filters.

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_PREFIX: &str = "slotflow.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process. Without a writable log directory only stderr is
/// used and no guard is returned.
pub fn init_logging(log_dir: &Path, format: LogFormat, verbose: bool) -> Result<Option<WorkerGuard>> {
    // stderr shares the terminal with progress bars; keep it quiet by default
    let stderr_default = if verbose { "slotflow=debug" } else { "slotflow=warn" };

    let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);
    let mut layers: Vec<BoxedLayer> = vec![match format {
        LogFormat::Text => stderr.with_filter(env_filter(stderr_default)).boxed(),
        LogFormat::Json => stderr.json().with_filter(env_filter(stderr_default)).boxed(),
    }];

    let guard = match std::fs::create_dir_all(log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(env_filter("slotflow=info"))
                    .boxed(),
            );
            Some(guard)
        }
        Err(_) => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    if guard.is_none() {
        tracing::warn!(log_dir = %log_dir.display(), "log directory not writable; logging to stderr only");
    }
    Ok(guard)
}
