//! Tracing setup: human-readable logs on stderr plus an optional JSON trace file.

use std::env;
use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::panic;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub const LOG_FILTER_ENV: &str = "NSWRAP_LOG";
pub const TRACE_LOG_ENV: &str = "NSWRAP_TRACE_LOG";
const DEFAULT_FILTER: &str = "info";

static TRACING_INIT: OnceLock<()> = OnceLock::new();
static PANIC_HOOK_INSTALLED: OnceLock<()> = OnceLock::new();

pub(crate) fn tracing_log_path() -> Option<PathBuf> {
    env::var_os(TRACE_LOG_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = TRACING_INIT.get_or_init(|| {
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .with_target(false)
            .with_filter(env_filter());

        let json_layer = tracing_log_path().and_then(|path| {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|err| {
                    eprintln!(
                        "nswrap: warning: cannot open trace log '{}': {err}",
                        path.display()
                    )
                })
                .ok()?;
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_timer(UtcTime::rfc_3339())
                    .with_writer(file)
                    .with_current_span(false)
                    .with_span_list(false)
                    .with_filter(env_filter()),
            )
        });

        let _ = tracing_subscriber::registry()
            .with(stderr_layer)
            .with(json_layer)
            .try_init();
    });
}

/// Route panics through tracing before the default hook prints them.
pub fn install_panic_hook() {
    PANIC_HOOK_INSTALLED.get_or_init(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|loc| format!("{}:{}", loc.file(), loc.line()))
                .unwrap_or_else(|| "unknown".to_string());
            tracing::error!(%location, "panic: {info}");
            previous(info);
        }));
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_tracing();
        init_tracing();
        assert!(TRACING_INIT.get().is_some());
    }
}
