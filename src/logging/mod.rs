use crate::cli::TracingFormat;
use crate::config::Config;
use anyhow::Context;
use std::fs::{self, OpenOptions};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Configure and initialize logging for the application.
///
/// `RUST_LOG` replaces the default filter outright. When `LOG_FILE` is set,
/// every event is also appended to it as one JSON object per line.
pub fn setup_logging(config: &Config, tracing_format: TracingFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let base_level = &config.log_level;
        EnvFilter::new(format!("warn,blotter={base_level}"))
    });

    let console = match tracing_format {
        TracingFormat::Pretty => fmt::layer().with_target(true).compact().boxed(),
        TracingFormat::Json => fmt::layer()
            .with_target(true)
            .json()
            .flatten_event(true)
            .boxed(),
    };

    let file = match &config.log_file {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to install tracing subscriber")
}
