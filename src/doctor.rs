//! Startup diagnostics: environment and host summary, shared by `--doctor` and the
//! report logged before the server launches.

use std::ffi::CStr;
use std::fmt::Display;
use std::{env, io, mem};
use tracing::{info, warn};

use crate::config::SupervisorConfig;

/// Below this many usable cores the server tends to miss ticks.
pub const MIN_RECOMMENDED_CORES: usize = 3;

const REPORTED_ENV: [&str; 8] = [
    "PATH",
    "HOME",
    "USER",
    "HOSTNAME",
    "DISPLAY",
    "WINEPREFIX",
    "WINEDEBUG",
    "WINESERVER",
];

pub struct DoctorReport {
    lines: Vec<String>,
}

impl DoctorReport {
    pub fn new(title: &str) -> Self {
        Self {
            lines: vec![title.to_string()],
        }
    }

    pub fn section(&mut self, title: &str) {
        self.lines.push(String::new());
        self.lines.push(format!("{title}:"));
    }

    pub fn push_kv(&mut self, key: &str, value: impl Display) {
        self.lines.push(format!("  {key}: {value}"));
    }

    pub fn push_line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn render(&self) -> String {
        self.lines.join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total: u64,
    pub free: u64,
    pub shared: u64,
    pub buffer: u64,
    pub swap_total: u64,
    pub swap_free: u64,
}

fn uname() -> io::Result<String> {
    // SAFETY: utsname is plain data; uname fills every field on success.
    let mut info: libc::utsname = unsafe { mem::zeroed() };
    if unsafe { libc::uname(&mut info) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let field = |raw: &[libc::c_char]| {
        // SAFETY: uname NUL-terminates each field within its array.
        unsafe { CStr::from_ptr(raw.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    };
    Ok([
        field(&info.sysname),
        field(&info.nodename),
        field(&info.release),
        field(&info.version),
        field(&info.machine),
    ]
    .join(" "))
}

fn memory() -> io::Result<MemoryInfo> {
    // SAFETY: sysinfo is plain data filled by the call on success.
    let mut info: libc::sysinfo = unsafe { mem::zeroed() };
    if unsafe { libc::sysinfo(&mut info) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let unit = u64::from(info.mem_unit.max(1));
    Ok(MemoryInfo {
        total: info.totalram as u64 * unit,
        free: info.freeram as u64 * unit,
        shared: info.sharedram as u64 * unit,
        buffer: info.bufferram as u64 * unit,
        swap_total: info.totalswap as u64 * unit,
        swap_free: info.freeswap as u64 * unit,
    })
}

/// Conditions worth a warning before launch.
pub fn startup_warnings(config: &SupervisorConfig, cores: usize) -> Vec<String> {
    let mut warnings = Vec::new();
    if config.display.as_deref().map_or(true, str::is_empty) {
        warnings.push("DISPLAY is not set; wine may fail to create windows".to_string());
    }
    if cores < MIN_RECOMMENDED_CORES {
        warnings.push(format!(
            "only {cores} cores available; at least {MIN_RECOMMENDED_CORES} are recommended"
        ));
    }
    if let Some(custom) = &config.winedebug {
        warnings.push(format!(
            "WINEDEBUG overridden to '{custom}'; server logs may be noisier"
        ));
    }
    warnings
}

pub fn base_doctor_report(config: &SupervisorConfig) -> DoctorReport {
    let mut report = DoctorReport::new("nswrap doctor");
    report.push_kv("version", env!("CARGO_PKG_VERSION"));
    report.push_kv(
        "os",
        format!("{}/{}", env::consts::OS, env::consts::ARCH),
    );

    report.section("config");
    for key in REPORTED_ENV {
        let value = env::var(key).unwrap_or_else(|_| "(null)".to_string());
        report.push_line(format!("  {key}={value}"));
    }

    report.section("system info");
    match uname() {
        Ok(kernel) => report.push_kv("kernel", kernel),
        Err(err) => report.push_kv("kernel", format!("error: {err}")),
    }
    let cores = num_cpus::get();
    report.push_kv("processor", format!("{cores} cores"));
    match memory() {
        Ok(mem) => {
            report.push_kv(
                "memory",
                format!(
                    "{} total, {} free, {} shared, {} buffer",
                    mem.total, mem.free, mem.shared, mem.buffer
                ),
            );
            report.push_kv(
                "swap",
                format!("{} total, {} free", mem.swap_total, mem.swap_free),
            );
        }
        Err(err) => report.push_kv("memory", format!("error: {err}")),
    }

    report.section("supervisor");
    report.push_kv("wine", &config.wine_cmd);
    report.push_kv("launcher", &config.launcher);
    let watchdog = config.watchdog_config();
    report.push_kv(
        "watchdog",
        format!(
            "{} ticks within {}s, then every {}s",
            watchdog.init_ticks,
            watchdog.init_window.as_secs(),
            watchdog.interval.as_secs()
        ),
    );
    report.push_kv("shutdown timeout", format!("{}s", config.shutdown_timeout_secs));
    report.push_kv("helper", if config.wants_helper() { "xvfb" } else { "none" });

    let mut validated = config.clone();
    match validated.validate() {
        Ok(()) => report.push_kv("validation", "ok"),
        Err(err) => report.push_kv("validation", format!("error: {err:#}")),
    }

    let warnings = startup_warnings(config, cores);
    if !warnings.is_empty() {
        report.section("warnings");
        for warning in warnings {
            report.push_line(format!("  {warning}"));
        }
    }
    report
}

/// Log the environment and host summary ahead of launch.
pub fn log_startup_report(config: &SupervisorConfig) {
    info!("config");
    for key in REPORTED_ENV {
        let value = env::var(key).unwrap_or_else(|_| "(null)".to_string());
        info!("  {key}={value}");
    }
    match (uname(), memory()) {
        (Ok(kernel), Ok(mem)) => {
            info!("system info:");
            info!("  kernel: {kernel}");
            info!("  processor: {} cores", num_cpus::get());
            info!(
                "  memory: {} total, {} free, {} shared, {} buffer",
                mem.total, mem.free, mem.shared, mem.buffer
            );
            info!("  swap: {} total, {} free", mem.swap_total, mem.swap_free);
        }
        (Err(err), _) => warn!("failed to get system info: uname: {err}"),
        (_, Err(err)) => warn!("failed to get system info: sysinfo: {err}"),
    }
    for warning in startup_warnings(config, num_cpus::get()) {
        warn!("{warning}");
    }
}
