use std::path::Path;

use anyhow::{Result, anyhow};
use coda_config::TelemetryConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins over `[telemetry].log_level`.
fn filter(cfg: &TelemetryConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.  With `log_file` set, logs go to a daily
/// rolling file so they never interleave with streamed output; the returned
/// guard must live until exit or buffered lines are lost.
pub fn init(cfg: &TelemetryConfig) -> Result<Option<WorkerGuard>> {
    match cfg.log_file.as_deref() {
        Some(file) => {
            let path = Path::new(file);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let prefix = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("coda.log");
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, prefix));
            tracing_subscriber::fmt()
                .with_env_filter(filter(cfg))
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .map_err(|e| anyhow!("failed to install logger: {e}"))?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter(cfg))
                .with_writer(std::io::stderr)
                .with_target(false)
                .try_init()
                .map_err(|e| anyhow!("failed to install logger: {e}"))?;
            Ok(None)
        }
    }
}
