use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber, writing to the console and `log_file`
///
/// Falls back to console-only logging when the log file cannot be opened. The
/// returned guard must be held until shutdown so buffered lines are flushed.
pub fn init(log_file: &Path) -> Option<WorkerGuard> {
    let fmt_layer = utils::logging::get_fmt_layer().with_filter(env_filter());

    match utils::logging::get_file_layer(log_file) {
        Ok((file_layer, guard)) => {
            registry()
                .with(fmt_layer)
                .with(file_layer.with_filter(env_filter()))
                .init();
            Some(guard)
        }
        Err(e) => {
            registry().with(fmt_layer).init();
            tracing::warn!(
                "Failed to open log file {}: {e}, logging to console only",
                log_file.display()
            );
            None
        }
    }
}
