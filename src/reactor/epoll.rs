use anyhow::Result;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use tracing::trace;

use super::Token;
use crate::pty_session::errno_error;

/// One ready descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: Token,
    pub readable: bool,
    pub hangup: bool,
}

/// Owned epoll instance.
#[derive(Debug)]
pub struct Poller {
    fd: OwnedFd,
}

impl Poller {
    pub fn new() -> Result<Self> {
        // SAFETY: epoll_create1 has no pointer arguments.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(errno_error("epoll_create1 failed"));
        }
        // SAFETY: the fd was just created and is owned by nobody else.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Watch `fd` for readability under `token`.
    pub fn register(&self, fd: RawFd, token: Token) -> Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token.as_u64(),
        };
        // SAFETY: event is a valid epoll_event on the stack for the duration of the call.
        let rc = unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) };
        if rc < 0 {
            return Err(errno_error(&format!("epoll_ctl(ADD, {token:?}) failed")));
        }
        trace!(fd, ?token, "registered descriptor");
        Ok(())
    }

    pub fn deregister(&self, fd: RawFd) -> Result<()> {
        // SAFETY: EPOLL_CTL_DEL ignores the event pointer on current kernels.
        let rc = unsafe {
            libc::epoll_ctl(
                self.fd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            return Err(errno_error("epoll_ctl(DEL) failed"));
        }
        Ok(())
    }

    /// Block until one registered descriptor is ready.
    ///
    /// Returns `None` only when `timeout` elapses. Interrupted waits are retried.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Option<Event>> {
        let timeout_ms = timeout
            .map(|t| i32::try_from(t.as_millis()).unwrap_or(i32::MAX))
            .unwrap_or(-1);
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        loop {
            // SAFETY: event is a single writable epoll_event and maxevents is 1.
            let n = unsafe { libc::epoll_wait(self.fd.as_raw_fd(), &mut event, 1, timeout_ms) };
            if n < 0 {
                if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(errno_error("epoll_wait failed"));
            }
            if n == 0 {
                return Ok(None);
            }
            let flags = event.events;
            let raw = event.u64;
            let Some(token) = Token::from_u64(raw) else {
                trace!(raw, "ignoring event with unknown token");
                continue;
            };
            return Ok(Some(Event {
                token,
                readable: flags & libc::EPOLLIN as u32 != 0,
                hangup: flags & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0,
            }));
        }
    }
}
