//! provides logging helpers

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::InitError;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Environment variable overriding the log file location.
pub const LOG_PATH_ENV_VAR: &str = "GPU_ARBITER_LOG_PATH";

const MAX_LOG_FILES: usize = 3;

/// Console layer shared by every binary in the workspace.
pub fn get_fmt_layer<S>() -> impl Layer<S> + Send + Sync
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    layer().with_writer(std::io::stderr).with_target(true)
}

/// Plain-text layer writing to a daily rotated file next to `log_file`.
///
/// The returned guard flushes the background writer when dropped, so it must be
/// kept alive for as long as events should reach the file.
pub fn get_file_layer<S>(
    log_file: &Path,
) -> Result<(impl Layer<S> + Send + Sync, WorkerGuard), InitError>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let dir = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let prefix = log_file
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("gpu-arbiter.log");

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(MAX_LOG_FILES)
        .build(dir)?;

    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = layer().with_writer(writer).with_ansi(false).with_target(true);
    Ok((file_layer, guard))
}

/// initiate a console-only global tracing subscriber
pub fn init() {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    registry().with(get_fmt_layer().with_filter(env_filter)).init();
}
