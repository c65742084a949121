//! Terminal and per-run file logging.
//!
//! The terminal layer is installed once per process. The file layer is reloaded
//! on each call so that every run logs to `<op_dir>/logs/<op_name>.log`.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt,
};

type RunFileLayer = fmt::Layer<
    Registry,
    fmt::format::DefaultFields,
    fmt::format::Format<fmt::format::Full, fmt::time::ChronoUtc>,
    NonBlocking,
>;

static LOG_WRITERS: OnceLock<LogWriters> = OnceLock::new();

/// Background writer handles, flushed when dropped.
/// Held for the life of the process.
struct LogWriters {
    _terminal: Mutex<WorkerGuard>,
    run_file: Mutex<WorkerGuard>,
    run_file_reload: reload::Handle<RunFileLayer, Registry>,
}

impl LogWriters {
    /// Redirect the file layer to a new run's log, flushing the previous one
    fn redirect(&self, logfile: File) -> Result<(), String> {
        let (writer, guard) = tracing_appender::non_blocking(logfile);
        let layer = run_file_layer(writer);

        let mut current = self
            .run_file
            .lock()
            .map_err(|_| "Log file writer lock poisoned".to_string())?;
        self.run_file_reload
            .modify(|l| *l = layer)
            .map_err(|e| format!("Failed to redirect log file: {e}"))?;

        // Dropping the old guard flushes the previous run's log
        *current = guard;
        Ok(())
    }
}

fn run_file_layer(writer: NonBlocking) -> RunFileLayer {
    fmt::layer::<Registry>()
        .with_timer(fmt::time::ChronoUtc::rfc_3339())
        .with_writer(writer)
        .with_ansi(false)
}

/// Path of the log file for a run
pub fn log_path(op_dir: &Path, op_name: &str) -> PathBuf {
    op_dir.join("logs").join(format!("{op_name}.log"))
}

/// Log to the terminal and to `<op_dir>/logs/<op_name>.log`.
///
/// The level defaults to `info` and can be overridden with `RUST_LOG`.
/// Calling again for another run moves the file output to that run's log.
pub fn init_logging(op_dir: &Path, op_name: &str) -> Result<PathBuf, String> {
    let path = log_path(op_dir, op_name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create log directory: {e}"))?;
    }
    let logfile = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("Failed to open log file {path:?}: {e}"))?;

    if let Some(writers) = LOG_WRITERS.get() {
        writers.redirect(logfile)?;
        return Ok(path);
    }

    let (terminal_writer, terminal_guard) = tracing_appender::non_blocking(std::io::stdout());
    let (file_writer, file_guard) = tracing_appender::non_blocking(logfile);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| format!("Failed to set up log filter: {e}"))?;

    let terminal_layer = fmt::layer()
        .with_timer(fmt::time::ChronoUtc::rfc_3339())
        .with_writer(terminal_writer)
        .with_target(false);

    let (file_layer, run_file_reload) =
        reload::Layer::<RunFileLayer, Registry>::new(run_file_layer(file_writer));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(env_filter)
        .with(terminal_layer)
        .try_init()
        .map_err(|e| format!("Failed to install logger: {e}"))?;

    let _ = LOG_WRITERS.set(LogWriters {
        _terminal: Mutex::new(terminal_guard),
        run_file: Mutex::new(file_guard),
        run_file_reload,
    });

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_follows_run() {
        let dir = tempfile::tempdir().unwrap();

        let first = init_logging(dir.path(), "first").unwrap();
        tracing::info!("first run");
        let second = init_logging(dir.path(), "second").unwrap();
        tracing::info!("second run");

        assert_eq!(first, dir.path().join("logs").join("first.log"));
        assert!(first.exists());
        assert!(second.exists());
    }
}
