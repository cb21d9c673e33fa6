use anyhow::Result;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use crate::pty_session::errno_error;

/// A signal taken off the signalfd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalEvent {
    pub signo: i32,
    /// Sending process, or the exiting child for `SIGCHLD`.
    pub pid: libc::pid_t,
}

/// Blocks a set of signals for the calling thread and delivers them as fd reads.
///
/// Dropping it closes the fd and restores the previous signal mask.
pub struct SignalFd {
    fd: OwnedFd,
    previous_mask: libc::sigset_t,
}

impl std::fmt::Debug for SignalFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalFd").field("fd", &self.fd).finish()
    }
}

impl SignalFd {
    /// The supervisor's set: interrupt, terminate, and child state changes.
    pub fn supervisor() -> Result<Self> {
        Self::new(&[libc::SIGINT, libc::SIGTERM, libc::SIGCHLD])
    }

    pub fn new(signals: &[libc::c_int]) -> Result<Self> {
        // SAFETY: sigset_t is a plain C struct initialised by sigemptyset.
        let mut set: libc::sigset_t = unsafe { mem::zeroed() };
        let mut previous_mask: libc::sigset_t = unsafe { mem::zeroed() };
        // SAFETY: set is a valid stack local.
        unsafe {
            libc::sigemptyset(&mut set);
            for &signo in signals {
                libc::sigaddset(&mut set, signo);
            }
        }

        // SAFETY: both sets are valid stack locals.
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut previous_mask) };
        if rc != 0 {
            return Err(anyhow::anyhow!(
                "pthread_sigmask failed: {}",
                io::Error::from_raw_os_error(rc)
            ));
        }

        // SAFETY: set is initialised; -1 asks for a new fd.
        let fd = unsafe { libc::signalfd(-1, &set, libc::SFD_CLOEXEC | libc::SFD_NONBLOCK) };
        if fd < 0 {
            let err = errno_error("signalfd failed");
            // SAFETY: restores the mask captured above.
            unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &previous_mask, ptr::null_mut()) };
            return Err(err);
        }

        Ok(Self {
            // SAFETY: the fd was just created and is owned by nobody else.
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            previous_mask,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Take one pending signal, or `None` when nothing is queued.
    pub fn read(&self) -> Result<Option<SignalEvent>> {
        // SAFETY: signalfd_siginfo is plain data; zeroed is valid.
        let mut info: libc::signalfd_siginfo = unsafe { mem::zeroed() };
        let size = mem::size_of::<libc::signalfd_siginfo>();
        loop {
            // SAFETY: info is a writable buffer of exactly `size` bytes.
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    &mut info as *mut libc::signalfd_siginfo as *mut libc::c_void,
                    size,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => return Ok(None),
                    _ => return Err(anyhow::anyhow!("read signalfd failed: {err}")),
                }
            }
            if n as usize != size {
                return Err(anyhow::anyhow!("short read from signalfd ({n} bytes)"));
            }
            return Ok(Some(SignalEvent {
                signo: info.ssi_signo as i32,
                pid: info.ssi_pid as libc::pid_t,
            }));
        }
    }
}

impl Drop for SignalFd {
    fn drop(&mut self) {
        // SAFETY: restores the mask captured at construction for this thread.
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous_mask, ptr::null_mut());
        }
    }
}

/// Human-readable signal name for logs.
pub(crate) fn signal_name(signo: i32) -> &'static str {
    match signo {
        libc::SIGINT => "SIGINT",
        libc::SIGTERM => "SIGTERM",
        libc::SIGCHLD => "SIGCHLD",
        libc::SIGKILL => "SIGKILL",
        libc::SIGHUP => "SIGHUP",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGABRT => "SIGABRT",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGUSR2 => "SIGUSR2",
        _ => "signal",
    }
}
