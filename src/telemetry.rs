//! Tracing setup: structured logs to stdout plus a daily file in `logs/`.

use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize the global subscriber. The returned guard must live as long
/// as the process so buffered file output flushes on exit.
pub fn init(logs_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
    let default_directives = if verbose {
        "marketpipe=debug,tower_http=debug"
    } else {
        "marketpipe=info,tower_http=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    let file_appender = tracing_appender::rolling::daily(logs_dir, "marketpipe.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    Ok(guard)
}
