use anyhow::{Context, Result};
use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log to stdout and to a daily rolling file under `log_dir`.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// stops the background writer.
pub fn init(log_dir: String) -> Result<WorkerGuard> {
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir))?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "registrar.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
