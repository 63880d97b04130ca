//! File-backed tracing bootstrap driven by the configured log path and
//! level.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install the global subscriber writing to `path` at `level`. Repeated
/// calls are no-ops: the first successful initialization wins for the whole
/// process.
pub fn init(path: &Path, level: crate::config::LogLevel) -> Result<()> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("log path {} has no file name", path.display()))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name.to_string_lossy())
        .build(dir)
        .with_context(|| format!("cannot open log file in {}", dir.display()))?;

    let layer = fmt::layer().with_writer(appender).with_ansi(false);
    let filter = EnvFilter::new(level.as_filter());

    // Another subscriber may already be installed (embedding hosts and test
    // harnesses often bring their own); that is not an error for us.
    let _ = Registry::default().with(filter).with(layer).try_init();
    let _ = INITIALIZED.set(());
    Ok(())
}
