use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Map a configured level to a tracing directive.
///
/// `critical` narrows to `error`; `off` disables output entirely.
fn level_directive(level: &str) -> &str {
    match level {
        "critical" => "error",
        other => other,
    }
}

/// Initialize tracing from the logging section of the system config.
///
/// Console output is synchronous; file output goes through a bounded
/// non-blocking queue that drops lines under back-pressure, keeping the
/// decision path free of log I/O. The returned guard must be held for
/// the process lifetime or buffered lines are lost on exit.
///
/// The `RUST_LOG` environment variable overrides the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(&config.level)));

    let registry = tracing_subscriber::registry().with(filter);

    let mut guard = None;

    let file_layer = if config.enable_file {
        let path = Path::new(&config.file_path);
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let file = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "riskgate.log".to_string());

        let appender = tracing_appender::rolling::daily(dir, file);
        let (writer, worker_guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
            .lossy(true)
            .finish(appender);
        guard = Some(worker_guard);

        Some(fmt::layer().with_ansi(false).with_writer(writer))
    } else {
        None
    };

    let console_layer = if config.enable_console {
        Some(fmt::layer().with_target(true).with_thread_ids(false))
    } else {
        None
    };

    registry.with(file_layer).with(console_layer).init();

    guard
}

/// Initialize tracing for tests (doesn't fail if already initialized).
#[cfg(test)]
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("riskgate=debug")
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directive_mapping() {
        assert_eq!(level_directive("critical"), "error");
        assert_eq!(level_directive("debug"), "debug");
        assert_eq!(level_directive("off"), "off");
    }
}
