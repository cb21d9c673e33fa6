//! Command-line parsing, environment, and validation for the supervisor.

mod defaults;
mod validation;

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::watchdog::WatchdogConfig;
use defaults::secs;
pub use defaults::{
    DEFAULT_CHILD_HOME, DEFAULT_CHILD_HOSTNAME, DEFAULT_CHILD_PATH, DEFAULT_CHILD_USER,
    DEFAULT_HELPER_TIMEOUT_SECS, DEFAULT_LAUNCHER, DEFAULT_REAP_TIMEOUT_SECS,
    DEFAULT_SHUTDOWN_TIMEOUT_SECS, DEFAULT_WATCHDOG_INIT_TICKS, DEFAULT_WATCHDOG_INIT_WINDOW_SECS,
    DEFAULT_WATCHDOG_INTERVAL_SECS, DEFAULT_WINEDEBUG, DEFAULT_WINE_CMD, HELPER_DISPLAY_REQUEST,
    MAX_TUNABLE_SECS, MAX_WATCHDOG_INIT_TICKS,
};

/// Environment variable naming an optional suffix for the process identity.
pub const TITLE_ENV: &str = "NSWRAP_TITLE";

/// CLI options for nswrap. Prerequisites are checked by [`SupervisorConfig::validate`].
#[derive(Debug, Parser, Clone)]
#[command(
    name = "nswrap",
    about = "Run a Northstar dedicated server under a pseudo-terminal and watch its liveness",
    author,
    version
)]
pub struct SupervisorConfig {
    /// Game directory containing the launcher; becomes the server's working directory
    #[arg(value_name = "GAME_DIR")]
    pub game_dir: PathBuf,

    /// Arguments passed to the server after `-dedicated`
    #[arg(
        value_name = "ARGS",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub server_args: Vec<String>,

    /// Wine binary used to run the launcher
    #[arg(long = "wine-cmd", default_value = DEFAULT_WINE_CMD)]
    pub wine_cmd: String,

    /// Launcher executable inside GAME_DIR
    #[arg(long, default_value = DEFAULT_LAUNCHER)]
    pub launcher: String,

    /// X display for the server; `xvfb` starts a private Xvfb
    #[arg(long, env = "DISPLAY")]
    pub display: Option<String>,

    /// Wine debug channels
    #[arg(long, env = "WINEDEBUG")]
    pub winedebug: Option<String>,

    /// Wine server binary override
    #[arg(long, env = "WINESERVER")]
    pub wineserver: Option<String>,

    /// Wine prefix (absolute, existing, read/write/search accessible)
    #[arg(long, env = "WINEPREFIX")]
    pub wineprefix: Option<PathBuf>,

    /// Status updates required before the watchdog leaves initialization
    #[arg(long = "watchdog-init-ticks", default_value_t = DEFAULT_WATCHDOG_INIT_TICKS)]
    pub watchdog_init_ticks: u32,

    /// Time allowed for the initial status updates (seconds)
    #[arg(
        long = "watchdog-init-window-secs",
        default_value_t = DEFAULT_WATCHDOG_INIT_WINDOW_SECS
    )]
    pub watchdog_init_window_secs: u64,

    /// Maximum gap between status updates (seconds)
    #[arg(
        long = "watchdog-interval-secs",
        default_value_t = DEFAULT_WATCHDOG_INTERVAL_SECS
    )]
    pub watchdog_interval_secs: u64,

    /// Grace period after SIGTERM before the server is killed (seconds)
    #[arg(
        long = "shutdown-timeout-secs",
        default_value_t = DEFAULT_SHUTDOWN_TIMEOUT_SECS
    )]
    pub shutdown_timeout_secs: u64,

    /// Time allowed for reaping leftover descendants on exit (seconds)
    #[arg(long = "reap-timeout-secs", default_value_t = DEFAULT_REAP_TIMEOUT_SECS)]
    pub reap_timeout_secs: u64,

    /// Time allowed for Xvfb to report its display (seconds)
    #[arg(long = "helper-timeout-secs", default_value_t = DEFAULT_HELPER_TIMEOUT_SECS)]
    pub helper_timeout_secs: u64,

    /// Print environment diagnostics and exit
    #[arg(long = "doctor", default_value_t = false)]
    pub doctor: bool,

    /// Allow running as root
    #[arg(long = "allow-root", default_value_t = false)]
    pub allow_root: bool,

    /// Raw NSWRAP_TITLE; an empty value is meaningful, so it is read directly
    #[arg(skip)]
    pub title: Option<String>,
}

impl SupervisorConfig {
    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            init_ticks: self.watchdog_init_ticks,
            init_window: secs(self.watchdog_init_window_secs),
            interval: secs(self.watchdog_interval_secs),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        secs(self.shutdown_timeout_secs)
    }

    pub fn reap_timeout(&self) -> Duration {
        secs(self.reap_timeout_secs)
    }

    pub fn helper_timeout(&self) -> Duration {
        secs(self.helper_timeout_secs)
    }

    /// Whether `DISPLAY` asks for a managed Xvfb.
    pub fn wants_helper(&self) -> bool {
        self.display.as_deref() == Some(HELPER_DISPLAY_REQUEST)
    }

    /// The WINEDEBUG value the server will see.
    pub fn effective_winedebug(&self) -> &str {
        self.winedebug.as_deref().unwrap_or(DEFAULT_WINEDEBUG)
    }
}
