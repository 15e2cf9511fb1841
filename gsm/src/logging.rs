//! Logging infrastructure for the GSM managers.
//!
//! Provides structured logging with file output and console output:
//! - Writes to `<SERVER_FILES_ROOT_DIR>/logs/<component>.log`
//! - Also prints to stdout for interactive use
//! - Configurable via `RUST_LOG`, with the legacy `DEBUG*` toggles mapped
//!   onto filter directives when `RUST_LOG` is not set

use std::fs;
use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::parse_bool;

/// Guard that must be kept alive for the duration of logging.
///
/// Dropping this guard will flush and close the log file writer.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Initialize the logging system for a manager component.
///
/// Creates the log directory if needed and sets up dual output to both a
/// per-component file and stdout.
///
/// # Arguments
///
/// * `log_dir` - Directory for log files
/// * `component` - Component name; the log file is `<component>.log`
///
/// # Errors
///
/// Returns an error if the log directory cannot be created.
pub fn init_logging(log_dir: &Path, component: &str) -> Result<LoggingGuard, io::Error> {
    fs::create_dir_all(log_dir)?;

    let file_appender =
        tracing_appender::rolling::never(log_dir, format!("{component}.log"));
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_ansi(true)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter_from_env())
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// Build the env filter from `RUST_LOG` or the legacy verbosity toggles.
///
/// `RUST_LOG` wins outright when set. Otherwise `DEBUG` raises the crate to
/// debug level and `DEBUG_IPC` / `DEBUG_STEAMCMD` / `DEBUG_LOCK` raise their
/// subsystem to trace.
fn filter_from_env() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    EnvFilter::new(directives_from_toggles(|name| {
        std::env::var(name).map(|v| parse_bool(&v)).unwrap_or(false)
    }))
}

/// Map the legacy boolean toggles onto tracing filter directives.
fn directives_from_toggles<F: Fn(&str) -> bool>(enabled: F) -> String {
    let mut directives = if enabled("DEBUG") {
        "info,gsm=debug".to_string()
    } else {
        "info".to_string()
    };
    for (toggle, target) in [
        ("DEBUG_IPC", "gsm::bus"),
        ("DEBUG_STEAMCMD", "gsm::steam"),
        ("DEBUG_LOCK", "gsm::lock"),
    ] {
        if enabled(toggle) {
            directives.push_str(&format!(",{target}=trace"));
        }
    }
    directives
}
