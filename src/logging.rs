use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initializes console and JSON file logging.
///
/// The returned guard flushes the file writer when dropped; keep it alive
/// for the whole run.
pub fn init_logging(log_dir: &Path) -> Option<WorkerGuard> {
    let (file_layer, guard) = match file_writer(log_dir) {
        Some((writer, guard)) => (Some(fmt::layer().json().with_writer(writer)), Some(guard)),
        None => (None, None),
    };

    let console_layer = fmt::layer().with_target(true).with_writer(std::io::stdout);

    // Respect RUST_LOG if set; otherwise info for everything
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("kc311_pipeline=info,info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();
    guard
}

/// Daily-rolling `pipeline.log` writer. File logging is optional on
/// read-only runners, so an unusable directory yields `None`.
fn file_writer(log_dir: &Path) -> Option<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(log_dir).ok()?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "pipeline.log");
    Some(tracing_appender::non_blocking(file_appender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_missing_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs").join("nested");
        assert!(file_writer(&log_dir).is_some());
        assert!(log_dir.is_dir());
    }

    #[test]
    fn unusable_log_dir_disables_file_logging() {
        let file = tempfile::NamedTempFile::new().unwrap();
        // a regular file can't hold log files
        assert!(file_writer(&file.path().join("logs")).is_none());
    }

    #[test]
    fn installs_subscriber_with_file_layer() {
        let dir = tempfile::tempdir().unwrap();
        let guard = init_logging(dir.path());
        assert!(guard.is_some());
        tracing::info!("logging initialized");
    }
}
