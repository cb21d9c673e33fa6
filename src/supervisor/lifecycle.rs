use std::fmt;
use std::time::Instant;

use crate::pty_session::EXEC_FAILED_STATUS;

/// Where the supervisor is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    Running,
    /// SIGTERM sent; the server is killed if it is still alive at `deadline`.
    Stopping { deadline: Instant },
    Reaping,
    Done,
}

impl Lifecycle {
    pub fn is_active(self) -> bool {
        matches!(self, Lifecycle::Running | Lifecycle::Stopping { .. })
    }
}

/// Why the event loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopCause {
    ChildExited,
    ExecFailed { errno: i32 },
    Watchdog(String),
    ShutdownDeadline,
    /// A second interrupt/terminate while already stopping.
    UserForced,
    Error(String),
}

impl StopCause {
    /// Whether the server must be killed rather than waited for.
    pub fn forces_kill(&self) -> bool {
        !matches!(self, StopCause::ChildExited | StopCause::ExecFailed { .. })
    }
}

/// How the server process ended, decoded from a wait status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    Signaled { signal: i32, core_dumped: bool },
}

impl ChildExit {
    pub fn from_wait_status(status: libc::c_int) -> Option<Self> {
        if libc::WIFEXITED(status) {
            Some(ChildExit::Exited(libc::WEXITSTATUS(status)))
        } else if libc::WIFSIGNALED(status) {
            Some(ChildExit::Signaled {
                signal: libc::WTERMSIG(status),
                core_dumped: libc::WCOREDUMP(status),
            })
        } else {
            None
        }
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ChildExit::Exited(EXEC_FAILED_STATUS) => f.write_str("failed to start"),
            ChildExit::Exited(code) => write!(f, "exited with status {code}"),
            ChildExit::Signaled {
                core_dumped: true, ..
            } => f.write_str("dumped core"),
            ChildExit::Signaled { signal, .. } => write!(f, "killed by signal {signal}"),
        }
    }
}

/// Final outcome of a supervisor run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitDisposition {
    pub cause: StopCause,
    pub child: Option<ChildExit>,
    /// Every descendant was reaped within the bound.
    pub descendants_reaped: bool,
}

impl ExitDisposition {
    /// Process exit status for the supervisor itself.
    pub fn exit_code(&self) -> i32 {
        match &self.cause {
            StopCause::ExecFailed { .. } => EXEC_FAILED_STATUS,
            StopCause::Watchdog(_)
            | StopCause::ShutdownDeadline
            | StopCause::UserForced
            | StopCause::Error(_) => 1,
            StopCause::ChildExited => match self.child {
                Some(ChildExit::Exited(code)) => code,
                Some(ChildExit::Signaled { signal, .. }) => 128 + signal,
                None => 1,
            },
        }
    }
}
