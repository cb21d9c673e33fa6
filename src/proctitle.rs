//! Process identity shown in `ps`/`top`, refreshed from status updates.
//!
//! `comm` only holds 15 bytes, so the full identity is written over the process's
//! original argument strings, which is what `ps -o args` and `/proc/<pid>/cmdline` show.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::config::TITLE_ENV;
use crate::status::StatusRecord;

pub const IDENTITY_BASE: &str = "northstar";
/// Minimum spacing between identity refreshes; the server retitles every frame.
pub const REFRESH_INTERVAL: Duration = Duration::from_millis(200);
/// Width of the blank argument appended on re-exec so long identities fit.
pub const TITLE_PLACEHOLDER_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
enum IdentityMode {
    /// `NSWRAP_TITLE` set but empty: never touch the identity.
    Suppressed,
    Default,
    Named(String),
}

#[derive(Debug)]
pub struct ProcessIdentity {
    mode: IdentityMode,
    current: Option<String>,
    last_refresh: Option<Instant>,
    cmdline: Option<CmdlineArea>,
}

impl ProcessIdentity {
    /// Build from the raw `NSWRAP_TITLE` value.
    pub fn from_setting(setting: Option<&str>) -> Self {
        let mode = match setting {
            None => IdentityMode::Default,
            Some("") => IdentityMode::Suppressed,
            Some(name) => IdentityMode::Named(name.to_string()),
        };
        Self {
            mode,
            current: None,
            last_refresh: None,
            cmdline: None,
        }
    }

    pub fn is_suppressed(&self) -> bool {
        self.mode == IdentityMode::Suppressed
    }

    /// Render the identity for an optional status.
    pub fn render(&self, status: Option<&StatusRecord>) -> Option<String> {
        let mut title = match &self.mode {
            IdentityMode::Suppressed => return None,
            IdentityMode::Default => IDENTITY_BASE.to_string(),
            IdentityMode::Named(name) => format!("{IDENTITY_BASE} {name}"),
        };
        if let Some(status) = status {
            title.push_str(&format!(" [{status}]"));
        }
        Some(title)
    }

    /// Pick the identity to apply now, honoring the refresh interval.
    pub(crate) fn next_title(
        &mut self,
        status: Option<&StatusRecord>,
        now: Instant,
    ) -> Option<String> {
        if let Some(last) = self.last_refresh {
            if now.saturating_duration_since(last) < REFRESH_INTERVAL {
                return None;
            }
        }
        let title = self.render(status)?;
        if self.current.as_deref() == Some(title.as_str()) {
            return None;
        }
        self.last_refresh = Some(now);
        self.current = Some(title.clone());
        Some(title)
    }

    /// Locate the argument area and apply the base identity before the server starts.
    pub fn apply_initial(&mut self) {
        if self.is_suppressed() {
            return;
        }
        self.cmdline = match CmdlineArea::locate() {
            Ok(area) => Some(area),
            Err(err) => {
                warn!("process identity will only show in comm: {err}");
                None
            }
        };
        if let Some(title) = self.next_title(None, Instant::now()) {
            self.apply(&title);
        }
    }

    /// Refresh the identity, if due. `None` drops a stale status back to the base.
    pub fn refresh(&mut self, status: Option<&StatusRecord>, now: Instant) {
        if let Some(title) = self.next_title(status, now) {
            self.apply(&title);
        }
    }

    fn apply(&self, title: &str) {
        trace!(%title, "set process identity");
        ::proctitle::set_title(title);
        if let Some(area) = &self.cmdline {
            area.write(title);
        }
    }
}

/// The contiguous block of the process's original argv strings.
#[derive(Debug)]
struct CmdlineArea {
    start: *mut u8,
    len: usize,
}

impl CmdlineArea {
    fn locate() -> io::Result<Self> {
        let stat = fs::read_to_string("/proc/self/stat")?;
        let (start, end) = cmdline_bounds(&stat).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "no argument area in /proc/self/stat")
        })?;
        debug!(len = end - start, "found argument area");
        Ok(Self {
            start: start as *mut u8,
            len: end - start,
        })
    }

    fn write(&self, title: &str) {
        // SAFETY: [arg_start, arg_end) is this process's own argv block on the initial
        // stack; it stays mapped for the process lifetime and args were parsed already.
        let area = unsafe { std::slice::from_raw_parts_mut(self.start, self.len) };
        fill_cmdline(area, title);
    }
}

/// `arg_start`/`arg_end` from a `/proc/<pid>/stat` line (fields 48 and 49).
fn cmdline_bounds(stat: &str) -> Option<(usize, usize)> {
    // the command name may contain spaces and parens; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let start = fields.get(45)?.parse().ok()?;
    let end = fields.get(46)?.parse().ok()?;
    (end > start).then_some((start, end))
}

/// Overwrite an argument area with `title`.
///
/// The last byte is left non-NUL so the kernel reports the area as one string ending at
/// the first NUL instead of the original argv.
fn fill_cmdline(area: &mut [u8], title: &str) {
    let len = area.len();
    if len < 2 {
        return;
    }
    let shown = title.len().min(len - 2);
    area[..shown].copy_from_slice(&title.as_bytes()[..shown]);
    area[shown..len - 1].fill(0);
    area[len - 1] = b'.';
}

pub(crate) fn is_title_placeholder(arg: &OsString) -> bool {
    let bytes = arg.as_bytes();
    !bytes.is_empty() && bytes.iter().all(|&b| b == b' ')
}

/// Re-exec with a blank trailing argument so the argument area can hold a long identity.
///
/// Returns only when no re-exec is needed or it failed.
pub fn reserve_title_space() {
    if env::var_os(TITLE_ENV).is_some_and(|value| value.is_empty()) {
        return;
    }
    let args: Vec<OsString> = env::args_os().collect();
    let Some(last) = args.last() else {
        return;
    };
    if args.len() < 2 || is_title_placeholder(last) {
        return;
    }
    let err = Command::new("/proc/self/exe")
        .arg0(&args[0])
        .args(&args[1..])
        .arg(" ".repeat(TITLE_PLACEHOLDER_LEN))
        .exec();
    warn!("self-exec with additional space in argv for process title failed: {err}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::parse_status;

    fn record() -> StatusRecord {
        parse_status("Northstar - mp_glitch 5/16 players (aitdm)").unwrap()
    }

    #[test]
    fn renders_each_mode() {
        let status = record();
        let default = ProcessIdentity::from_setting(None);
        assert_eq!(default.render(None).as_deref(), Some("northstar"));
        assert_eq!(
            default.render(Some(&status)).as_deref(),
            Some("northstar [5/16 mp_glitch aitdm]")
        );

        let named = ProcessIdentity::from_setting(Some("eu-1"));
        assert_eq!(named.render(None).as_deref(), Some("northstar eu-1"));
        assert_eq!(
            named.render(Some(&status)).as_deref(),
            Some("northstar eu-1 [5/16 mp_glitch aitdm]")
        );

        let suppressed = ProcessIdentity::from_setting(Some(""));
        assert!(suppressed.is_suppressed());
        assert_eq!(suppressed.render(Some(&status)), None);
    }

    #[test]
    fn refreshes_are_rate_limited() {
        let status = record();
        let start = Instant::now();
        let mut identity = ProcessIdentity::from_setting(None);
        assert_eq!(
            identity.next_title(None, start).as_deref(),
            Some("northstar")
        );
        assert_eq!(
            identity.next_title(Some(&status), start + Duration::from_millis(50)),
            None
        );
        assert_eq!(
            identity
                .next_title(Some(&status), start + Duration::from_millis(250))
                .as_deref(),
            Some("northstar [5/16 mp_glitch aitdm]")
        );
        // unchanged identity is not reapplied
        assert_eq!(
            identity.next_title(Some(&status), start + Duration::from_secs(1)),
            None
        );
    }

    #[test]
    fn unparsable_title_drops_back_to_base() {
        let start = Instant::now();
        let mut identity = ProcessIdentity::from_setting(Some("eu-1"));
        identity.next_title(Some(&record()), start);
        assert_eq!(
            identity
                .next_title(None, start + Duration::from_millis(300))
                .as_deref(),
            Some("northstar eu-1")
        );
    }

    #[test]
    fn suppressed_identity_never_changes() {
        let mut identity = ProcessIdentity::from_setting(Some(""));
        assert_eq!(identity.next_title(Some(&record()), Instant::now()), None);
    }

    #[test]
    fn cmdline_fill_terminates_and_marks_the_area() {
        let mut area = *b"nswrap\0--allow-root\0/srv/game\0";
        fill_cmdline(&mut area, "northstar [5/16 mp_glitch aitdm]");
        // 30 bytes: the title is cut to len - 2, then NUL, then the marker
        assert_eq!(&area[..28], b"northstar [5/16 mp_glitch ai");
        assert_eq!(area[28], 0);
        assert_eq!(area[29], b'.');

        let mut area = [b'x'; 16];
        fill_cmdline(&mut area, "northstar");
        assert_eq!(&area[..9], b"northstar");
        assert!(area[9..15].iter().all(|&b| b == 0));
        assert_eq!(area[15], b'.');
    }

    #[test]
    fn cmdline_bounds_come_from_stat_fields() {
        let mut fields: Vec<String> = (3..=52).map(|n| n.to_string()).collect();
        fields[45] = "1000".to_string();
        fields[46] = "1064".to_string();
        let stat = format!("42 (odd) name) {}", fields.join(" "));
        assert_eq!(cmdline_bounds(&stat), Some((1000, 1064)));
        assert_eq!(cmdline_bounds("42 (short) S 1"), None);

        let own = fs::read_to_string("/proc/self/stat").unwrap();
        let (start, end) = cmdline_bounds(&own).unwrap();
        assert!(end > start);
    }

    #[test]
    fn placeholder_is_a_blank_argument() {
        assert!(is_title_placeholder(&OsString::from(" ".repeat(TITLE_PLACEHOLDER_LEN))));
        assert!(!is_title_placeholder(&OsString::from("")));
        assert!(!is_title_placeholder(&OsString::from(" +map ")));
    }
}
