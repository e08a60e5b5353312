//! tracing subscriber setup.
//!
//! Events go through a non-blocking appender to stdout, stderr or an
//! append-mode file. `RUST_LOG`, when set, replaces the configured filter.

use crate::config::{LogFormat, LogLevel, LoggingConfig};
use std::fs::OpenOptions;
use std::io;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Crates whose chatter is capped at `warn` unless dependency logging is on.
const QUIET_DEPENDENCIES: &[&str] = &["notify", "mio"];

/// Filter directives for `level`.
pub fn filter_directives(level: LogLevel, verbose_deps: bool) -> String {
    let mut directives = level.as_str().to_string();
    if !verbose_deps {
        for dep in QUIET_DEPENDENCIES {
            directives.push_str(&format!(",{dep}=warn"));
        }
    }
    directives
}

fn open_output(output: &str) -> io::Result<(NonBlocking, WorkerGuard)> {
    match output {
        "stdout" => Ok(tracing_appender::non_blocking(io::stdout())),
        "stderr" => Ok(tracing_appender::non_blocking(io::stderr())),
        path => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Ok(tracing_appender::non_blocking(file))
        }
    }
}

/// Installs the global subscriber.
///
/// `level_override` (from the command line) wins over the configured level.
/// Keep the returned guard alive until exit or buffered events are lost.
pub fn init_logging(
    config: &LoggingConfig,
    level_override: Option<LogLevel>,
    verbose_deps: bool,
) -> io::Result<WorkerGuard> {
    let level = level_override.unwrap_or(config.level);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(level, verbose_deps)));
    let (writer, guard) = open_output(&config.output)?;

    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(config.include_target)
        .with_thread_names(true);
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        LogFormat::Json => registry.with(layer.json()).try_init(),
        LogFormat::Compact => registry.with(layer.compact()).try_init(),
        LogFormat::Pretty => registry.with(layer.pretty()).try_init(),
    };
    installed.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    tracing::debug!(level = %level, format = ?config.format, "Logging initialized");
    Ok(guard)
}
