use super::defaults::{
    DEFAULT_CHILD_HOME, DEFAULT_CHILD_HOSTNAME, DEFAULT_CHILD_PATH, DEFAULT_CHILD_USER,
    MAX_TUNABLE_SECS, MAX_WATCHDOG_INIT_TICKS,
};
use super::{SupervisorConfig, TITLE_ENV};
use crate::proctitle::is_title_placeholder;
use crate::pty_session::{path_cstring, ChildCommand};
use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::{
    env,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

impl SupervisorConfig {
    /// Parse CLI arguments and pick up the raw `NSWRAP_TITLE`.
    ///
    /// The blank argument added by [`crate::proctitle::reserve_title_space`] is dropped first. Usage errors
    /// exit through clap; prerequisites are checked by [`Self::validate`].
    pub fn parse_args() -> Self {
        let mut args: Vec<OsString> = env::args_os().collect();
        if args.len() > 1 && args.last().is_some_and(is_title_placeholder) {
            args.pop();
        }
        let mut config = Self::parse_from(args);
        config.title = env::var(TITLE_ENV).ok();
        config
    }

    /// Check tunables and startup prerequisites and normalize paths.
    pub fn validate(&mut self) -> Result<()> {
        if !self.allow_root && running_as_root() {
            bail!("this program must not be run as root (pass --allow-root to override)");
        }

        if !(1..=MAX_WATCHDOG_INIT_TICKS).contains(&self.watchdog_init_ticks) {
            bail!(
                "--watchdog-init-ticks must be between 1 and {MAX_WATCHDOG_INIT_TICKS}, got {}",
                self.watchdog_init_ticks
            );
        }
        for (flag, value) in [
            ("--watchdog-init-window-secs", self.watchdog_init_window_secs),
            ("--watchdog-interval-secs", self.watchdog_interval_secs),
            ("--shutdown-timeout-secs", self.shutdown_timeout_secs),
            ("--reap-timeout-secs", self.reap_timeout_secs),
            ("--helper-timeout-secs", self.helper_timeout_secs),
        ] {
            if !(1..=MAX_TUNABLE_SECS).contains(&value) {
                bail!("{flag} must be between 1 and {MAX_TUNABLE_SECS}, got {value}");
            }
        }

        self.wine_cmd = sanitize_binary(&self.wine_cmd, "--wine-cmd")?;

        let game_dir = self
            .game_dir
            .canonicalize()
            .with_context(|| format!("chdir '{}'", self.game_dir.display()))?;
        if !game_dir.is_dir() {
            bail!("game directory '{}' is not a directory", game_dir.display());
        }
        self.game_dir = game_dir;

        validate_launcher(&self.game_dir, &self.launcher)?;
        self.wineprefix = Some(validate_wineprefix(self.wineprefix.as_deref())?);
        Ok(())
    }

    /// Build the server command line and its complete environment.
    ///
    /// `display` replaces the configured `DISPLAY` when a helper provides one.
    pub fn child_command(&self, display: Option<&str>) -> ChildCommand {
        let mut command = ChildCommand::new(self.wine_cmd.clone())
            .arg(self.launcher.clone())
            .arg("-dedicated")
            .args(self.server_args.iter().cloned())
            .env("PATH", env_or("PATH", DEFAULT_CHILD_PATH))
            .env("HOSTNAME", env_or("HOSTNAME", DEFAULT_CHILD_HOSTNAME))
            .env("HOME", env_or("HOME", DEFAULT_CHILD_HOME))
            .env("USER", env_or("USER", DEFAULT_CHILD_USER))
            .env("WINEDEBUG", self.effective_winedebug());
        if let Some(prefix) = &self.wineprefix {
            command = command.env("WINEPREFIX", prefix.to_string_lossy());
        }
        if let Some(display) = display.or(self.display.as_deref()) {
            command = command.env("DISPLAY", display);
        }
        if let Some(server) = &self.wineserver {
            command = command.env("WINESERVER", server.clone());
        }
        command
    }
}

fn env_or(key: &str, fallback: &str) -> String {
    env::var(key)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

pub(super) fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions.
    unsafe { libc::geteuid() == 0 }
}

pub(super) fn validate_launcher(game_dir: &Path, launcher: &str) -> Result<()> {
    if launcher.trim().is_empty() {
        bail!("--launcher cannot be empty");
    }
    let path = game_dir.join(launcher);
    if !path.exists() {
        bail!("{launcher} missing from '{}'", game_dir.display());
    }
    Ok(())
}

/// WINEPREFIX must be set, absolute, and accessible for read, write, and search.
pub(super) fn validate_wineprefix(prefix: Option<&Path>) -> Result<PathBuf> {
    let prefix = prefix.ok_or_else(|| anyhow!("WINEPREFIX not set"))?;
    if prefix.as_os_str().is_empty() {
        bail!("WINEPREFIX not set");
    }
    if !prefix.is_absolute() {
        bail!(
            "invalid WINEPREFIX '{}': not an absolute path",
            prefix.display()
        );
    }
    let raw = path_cstring(prefix)?;
    // SAFETY: raw is a valid NUL-terminated path.
    let rc = unsafe { libc::access(raw.as_ptr(), libc::R_OK | libc::W_OK | libc::X_OK) };
    if rc != 0 {
        bail!(
            "invalid WINEPREFIX '{}': {}",
            prefix.display(),
            std::io::Error::last_os_error()
        );
    }
    Ok(prefix.to_path_buf())
}

/// Allow either a bare binary name resolved through PATH or an existing executable path.
pub(super) fn sanitize_binary(value: &str, flag: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("{flag} cannot be empty");
    }
    if !trimmed.contains(std::path::MAIN_SEPARATOR) {
        return Ok(trimmed.to_string());
    }

    let path = Path::new(trimmed);
    let canonical = path
        .canonicalize()
        .with_context(|| format!("failed to canonicalize {flag} '{trimmed}'"))?;
    let metadata = fs::metadata(&canonical)
        .with_context(|| format!("failed to inspect {flag} '{}'", canonical.display()))?;
    if !metadata.is_file() {
        bail!("{flag} '{}' is not a file", canonical.display());
    }
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode();
        if mode & 0o111 == 0 {
            bail!(
                "{flag} '{}' exists but is not executable (mode {:o})",
                canonical.display(),
                mode
            );
        }
    }
    canonical
        .to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("{flag} must be valid UTF-8"))
}
