// ── Tracing subscriber setup ──

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::ConfigError;

/// Keeps the non-blocking file writer flushing. Hold it for the life of
/// the process; dropping it flushes and closes the log file.
pub struct LogGuard {
    _worker: Option<WorkerGuard>,
}

fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `verbosity`.
///
/// With `log_file`, output goes to that file without ANSI colors;
/// otherwise to stderr.
pub fn init_tracing(verbosity: u8, log_file: Option<&Path>) -> Result<LogGuard, ConfigError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for(verbosity)));

    let Some(path) = log_file else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init()
            .map_err(|e| ConfigError::Logging(e.to_string()))?;
        return Ok(LogGuard { _worker: None });
    };

    let file_name = path
        .file_name()
        .ok_or_else(|| ConfigError::Logging(format!("not a file path: {}", path.display())))?;
    let log_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
        .try_init()
        .map_err(|e| ConfigError::Logging(e.to_string()))?;

    Ok(LogGuard {
        _worker: Some(guard),
    })
}
