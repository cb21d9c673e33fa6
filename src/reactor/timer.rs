use anyhow::Result;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use crate::pty_session::errno_error;

/// One-shot monotonic timer readable through epoll.
#[derive(Debug)]
pub struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    pub fn new() -> Result<Self> {
        // SAFETY: timerfd_create has no pointer arguments.
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC | libc::TFD_NONBLOCK)
        };
        if fd < 0 {
            return Err(errno_error("timerfd_create failed"));
        }
        // SAFETY: the fd was just created and is owned by nobody else.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Fire once after `after`, replacing any pending expiry.
    pub fn arm(&self, after: Duration) -> Result<()> {
        // a zero it_value disarms, so round up to the smallest representable delay
        let after = after.max(Duration::from_nanos(1));
        self.set(libc::timespec {
            tv_sec: after.as_secs() as libc::time_t,
            tv_nsec: after.subsec_nanos() as libc::c_long,
        })
    }

    /// Consume pending expirations; returns how many fired since the last read.
    pub fn read(&self) -> Result<u64> {
        let mut expirations = [0u8; mem::size_of::<u64>()];
        loop {
            // SAFETY: expirations is an 8-byte writable buffer.
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    expirations.as_mut_ptr() as *mut libc::c_void,
                    expirations.len(),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => return Ok(0),
                    _ => return Err(anyhow::anyhow!("read timerfd failed: {err}")),
                }
            }
            return Ok(u64::from_ne_bytes(expirations));
        }
    }

    fn set(&self, value: libc::timespec) -> Result<()> {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: value,
        };
        // SAFETY: spec is a valid itimerspec; the old value is not requested.
        let rc = unsafe { libc::timerfd_settime(self.fd.as_raw_fd(), 0, &spec, ptr::null_mut()) };
        if rc < 0 {
            return Err(errno_error("timerfd_settime failed"));
        }
        Ok(())
    }
}
