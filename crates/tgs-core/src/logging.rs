use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{errors::Error, Result};

#[derive(Clone, Debug, Default)]
pub struct LogOptions {
    /// Default level directive when `RUST_LOG` is unset (e.g. "info", "debug").
    pub level: Option<String>,
    /// Also write plain (no ANSI) logs to this file.
    pub log_file: Option<PathBuf>,
}

/// Keeps the file writer flushing; drop it only on shutdown.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Initialize logging/tracing for the scanner.
///
/// Calling this twice is harmless: the second subscriber is silently ignored.
pub fn init(service_name: &str, opts: &LogOptions) -> Result<LogGuard> {
    let level = opts.level.as_deref().unwrap_or("info");

    // Default: the chosen level for our crates, warn for everything else.
    // Can be overridden with `RUST_LOG`.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,tgs={level},tgs_core={level},tgs_telegram={level},tgs_openai={level},tgs_tesseract={level},{service_name}={level}"
        ))
    });

    let console = fmt::layer().with_target(false).with_ansi(true);

    let (file_layer, guard) = match &opts.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path.file_name().ok_or_else(|| Error::InvalidPath {
                path: path.clone(),
                reason: "log file path has no file name".to_string(),
            })?;
            std::fs::create_dir_all(&dir)?;

            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init();

    Ok(LogGuard { _file: guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_log_path_without_file_name() {
        let err = init("tgs", &LogOptions {
            level: None,
            log_file: Some(PathBuf::from("/")),
        })
        .err()
        .unwrap();
        assert!(matches!(err, Error::InvalidPath { .. }));
    }

    #[test]
    fn file_logging_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/scanner.log");
        let _guard = init("tgs", &LogOptions {
            level: Some("debug".to_string()),
            log_file: Some(path.clone()),
        })
        .unwrap();
        assert!(path.parent().unwrap().exists());
    }
}
