//! Logging initialization shared by the harness binaries.
//!
//! Console output goes to stderr through an `EnvFilter`; when a run log is
//! configured, the same stream is mirrored to a line-oriented timestamped
//! file via a non-blocking appender. The file is the durable artifact of a
//! run.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::error::{HarnessError, HarnessResult};

/// Logging configuration consumed by `init_logging`.
#[derive(Debug, Clone)]
pub struct LogConfig {
    level: String,
    run_log: Option<PathBuf>,
}

impl LogConfig {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            run_log: None,
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_run_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.run_log = Some(path.into());
        self
    }

    pub fn run_log(&self) -> Option<&Path> {
        self.run_log.as_deref()
    }
}

/// Initialize the global subscriber. The returned guard must be held for
/// the lifetime of the process or buffered run-log lines are lost.
pub fn init_logging(config: &LogConfig) -> HarnessResult<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    match &config.run_log {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            if let Some(dir) = dir {
                std::fs::create_dir_all(dir)?;
            }
            let file_name = path
                .file_name()
                .ok_or_else(|| {
                    HarnessError::Config(format!("run log has no file name: {}", path.display()))
                })?
                .to_owned();
            let appender = tracing_appender::rolling::never(
                dir.unwrap_or_else(|| Path::new(".")),
                file_name,
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            Ok(None)
        }
    }
}
