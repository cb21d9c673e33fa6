use std::time::Duration;

pub const DEFAULT_WINE_CMD: &str = "wine64";
pub const DEFAULT_LAUNCHER: &str = "NorthstarLauncher.exe";
pub const DEFAULT_WINEDEBUG: &str = "fixme-secur32,fixme-bcrypt,fixme-ver,err-wldap32";

/// `DISPLAY` value that asks for a managed Xvfb instead of an existing display.
pub const HELPER_DISPLAY_REQUEST: &str = "xvfb";

pub const DEFAULT_CHILD_PATH: &str = "/usr/local/bin:/bin:/usr/bin";
pub const DEFAULT_CHILD_HOSTNAME: &str = "none";
pub const DEFAULT_CHILD_HOME: &str = "/";
pub const DEFAULT_CHILD_USER: &str = "none";

pub const DEFAULT_WATCHDOG_INIT_TICKS: u32 = 10;
pub const DEFAULT_WATCHDOG_INIT_WINDOW_SECS: u64 = 240;
pub const DEFAULT_WATCHDOG_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 4;
pub const DEFAULT_REAP_TIMEOUT_SECS: u64 = 4;
pub const DEFAULT_HELPER_TIMEOUT_SECS: u64 = 3;

/// Upper bound for every timing tunable.
pub const MAX_TUNABLE_SECS: u64 = 24 * 60 * 60;
pub const MAX_WATCHDOG_INIT_TICKS: u32 = 10_000;

pub(super) fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}
