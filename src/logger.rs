use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// File name of the JSON execution history, next to the text log.
pub const EXECUTION_LOG: &str = "executions.json";

/// Install the global subscriber.
///
/// - `log_level` is an `EnvFilter` directive (e.g. `"info"` or `"nodeflow=debug"`).
/// - text logs go to stdout and to a daily-rolling `log_dir/log_file`.
/// - events with `target: "execution"` (node history) are also written as
///   newline-delimited JSON to `log_dir/executions.json`.
pub fn init_tracing(log_dir: &Path, log_file: &str, log_level: &str) -> Result<()> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("could not create log directory {}", log_dir.display()))?;

    let env_filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level `{log_level}`"))?;

    let stdout_layer = fmt::layer().with_target(false);

    let txt_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, log_file);
    let txt_layer = fmt::layer().with_writer(txt_appender).with_ansi(false);

    let json_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, EXECUTION_LOG);
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_appender)
        .with_target(true)
        .with_filter(EnvFilter::new("execution=info"));

    Registry::default()
        .with(env_filter)
        .with(stdout_layer)
        .with(txt_layer)
        .with(json_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;
    Ok(())
}
