//! Process-table housekeeping: subreaper setup, child status collection, and the final
//! sweep that waits for every descendant before exit.

use anyhow::Result;
use std::io;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::lifecycle::ChildExit;
use crate::pty_session::errno_error;

const REAP_POLL: Duration = Duration::from_millis(100);
/// How long to wait for the server after SIGKILL before giving up on its status.
const KILL_WAIT: Duration = Duration::from_secs(1);

/// Adopt orphaned descendants (wineserver and friends) so they can be reaped here.
pub fn set_child_subreaper() -> Result<()> {
    // SAFETY: prctl with integer arguments only.
    if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) } != 0 {
        return Err(errno_error("prctl(PR_SET_CHILD_SUBREAPER) failed"));
    }
    Ok(())
}

pub fn set_no_new_privs() -> Result<()> {
    // SAFETY: prctl with integer arguments only.
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        return Err(errno_error("prctl(PR_SET_NO_NEW_PRIVS) failed"));
    }
    Ok(())
}

/// Non-blocking wait on `pid` (or any child for -1).
///
/// `Ok(None)` means nothing has changed state yet.
pub fn try_wait(pid: libc::pid_t) -> io::Result<Option<(libc::pid_t, libc::c_int)>> {
    loop {
        let mut status = 0;
        // SAFETY: status is a valid out-pointer.
        let reaped = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if reaped > 0 {
            return Ok(Some((reaped, status)));
        }
        if reaped == 0 {
            return Ok(None);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

/// One process collected by [`reap_exited`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub pid: libc::pid_t,
    pub exit: Option<ChildExit>,
}

/// Collect every child that has already exited.
///
/// signalfd coalesces SIGCHLD, so one notification can stand for several exits.
pub fn reap_exited() -> Vec<Reaped> {
    let mut reaped = Vec::new();
    loop {
        match try_wait(-1) {
            Ok(Some((pid, status))) => reaped.push(Reaped {
                pid,
                exit: ChildExit::from_wait_status(status),
            }),
            Ok(None) => break,
            Err(err) => {
                if err.raw_os_error() != Some(libc::ECHILD) {
                    warn!("waitpid failed: {err}");
                }
                break;
            }
        }
    }
    reaped
}

pub fn send_signal(pid: libc::pid_t, signo: libc::c_int) -> io::Result<()> {
    // SAFETY: kill with integer arguments only.
    if unsafe { libc::kill(pid, signo) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Get the server's exit status, killing it if it is still running after `grace`.
pub fn collect_child_exit(pid: libc::pid_t, grace: Duration) -> Option<ChildExit> {
    let grace_end = Instant::now() + grace;
    loop {
        match try_wait(pid) {
            Ok(Some((_, status))) => return ChildExit::from_wait_status(status),
            Ok(None) if Instant::now() < grace_end => thread::sleep(REAP_POLL / 10),
            Ok(None) => break,
            Err(err) => {
                warn!(pid, "failed to get server exit status: {err}");
                return None;
            }
        }
    }

    warn!(pid, "killing server");
    if let Err(err) = send_signal(pid, libc::SIGKILL) {
        warn!(pid, "failed to kill server: {err}");
    }
    let deadline = Instant::now() + KILL_WAIT;
    loop {
        match try_wait(pid) {
            Ok(Some((_, status))) => return ChildExit::from_wait_status(status),
            Ok(None) if Instant::now() < deadline => thread::sleep(REAP_POLL / 10),
            Ok(None) => {
                warn!(pid, "server did not exit even after being killed");
                return None;
            }
            Err(err) => {
                warn!(pid, "failed to get server exit status: {err}");
                return None;
            }
        }
    }
}

/// Wait up to `timeout` for every remaining descendant to exit.
///
/// Returns `false` if some were still running when the bound expired.
pub fn reap_descendants(timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        match try_wait(-1) {
            Ok(Some((pid, _))) => {
                debug!(pid, "reaped descendant");
                continue;
            }
            Ok(None) => {
                if start.elapsed() > timeout {
                    warn!("children did not exit in time");
                    return false;
                }
            }
            Err(err) => {
                if err.raw_os_error() != Some(libc::ECHILD) {
                    warn!("failed to reap remaining children: {err}");
                    return false;
                }
                return true;
            }
        }
        thread::sleep(REAP_POLL);
    }
}
