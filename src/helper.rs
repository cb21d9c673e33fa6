//! Optional headless X server started before the game server.
//!
//! Xvfb picks a free display and writes its number to the fd named by `-displayfd`.
//! That pipe, a readiness timer, and the supervisor's signalfd are all waited on through
//! the same [`Poller`], so an interrupt during startup is handled like any other event.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pty_session::{pipe_cloexec, read_chunk, set_nonblocking, ReadOutcome};
use crate::reactor::{signal_name, Poller, SignalFd, TimerFd, Token};

pub const DEFAULT_HELPER_TIMEOUT: Duration = Duration::from_secs(3);

/// Xvfb may write the trailing newline separately and exits if that write fails.
const SETTLE_DELAY: Duration = Duration::from_millis(50);
const DISPLAY_REPLY_MAX: usize = 16;

#[derive(Debug, Error)]
pub enum HelperError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("helper exited before reporting a display ({0})")]
    Exited(ExitStatus),
    #[error("helper sent an invalid display number: {0:?}")]
    Protocol(String),
    #[error("helper didn't initialize within {}s", .0.as_secs_f32())]
    Timeout(Duration),
    #[error("interrupted by {0} while waiting for the helper")]
    Interrupted(&'static str),
    #[error("helper setup failed: {0:#}")]
    Setup(anyhow::Error),
}

impl From<anyhow::Error> for HelperError {
    fn from(err: anyhow::Error) -> Self {
        HelperError::Setup(err)
    }
}

/// How to launch the display server. The display-fd arguments are appended.
#[derive(Debug, Clone)]
pub struct HelperCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl HelperCommand {
    pub fn xvfb() -> Self {
        Self {
            program: "Xvfb".to_string(),
            args: Vec::new(),
        }
    }

    fn command(&self, display_fd: i32) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("-displayfd")
            .arg(display_fd.to_string())
            .args(["-nolisten", "tcp", "-nolisten", "unix", "-noreset"])
            .stdin(Stdio::null());
        command
    }
}

/// A running helper that reported its display.
#[derive(Debug)]
pub struct Helper {
    pid: libc::pid_t,
    display: String,
}

impl Helper {
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Display name for the child environment, e.g. `:1`.
    pub fn display(&self) -> &str {
        &self.display
    }

    pub fn kill(&self) {
        // SAFETY: the pid belongs to a child this process spawned and has not reaped.
        if unsafe { libc::kill(self.pid, libc::SIGKILL) } == -1 {
            debug!(pid = self.pid, "kill helper: {}", io::Error::last_os_error());
        }
    }
}

/// Start the helper and wait until it reports a display, it dies, `timeout` passes, or
/// an interrupt/terminate signal arrives on `signals`.
///
/// `signals` must already be registered with `poller` under [`Token::Signal`].
pub fn start_helper(
    command: &HelperCommand,
    poller: &Poller,
    signals: &SignalFd,
    timeout: Duration,
) -> Result<Helper, HelperError> {
    let (display_read, display_write) = pipe_cloexec()?;
    set_nonblocking(display_read.as_raw_fd())?;
    let timer = TimerFd::new()?;

    let mut child = spawn(command, &display_write)?;
    drop(display_write);
    info!(pid = child.id(), program = %command.program, "started display helper");

    let result = register_and_wait(poller, signals, &timer, &display_read, &mut child, timeout);
    for fd in [display_read.as_raw_fd(), timer.fd()] {
        // the display fd may already be gone after an early EOF
        if let Err(err) = poller.deregister(fd) {
            debug!("helper cleanup: {err:#}");
        }
    }

    match result {
        Ok(name) => {
            thread::sleep(SETTLE_DELAY);
            info!(display = %name, "display helper is ready");
            Ok(Helper {
                pid: child.id() as libc::pid_t,
                display: name,
            })
        }
        Err(err) => {
            let _ = child.kill();
            let _ = child.wait();
            Err(err)
        }
    }
}

fn spawn(command: &HelperCommand, display_write: &OwnedFd) -> Result<Child, HelperError> {
    let write_fd = display_write.as_raw_fd();
    let mut cmd = command.command(write_fd);
    // SAFETY: the hook only calls async-signal-safe functions between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            // the display pipe must survive exec
            if libc::fcntl(write_fd, libc::F_SETFD, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    cmd.spawn().map_err(|source| HelperError::Spawn {
        program: command.program.clone(),
        source,
    })
}

fn register_and_wait(
    poller: &Poller,
    signals: &SignalFd,
    timer: &TimerFd,
    display_read: &OwnedFd,
    child: &mut Child,
    timeout: Duration,
) -> Result<String, HelperError> {
    poller.register(display_read.as_raw_fd(), Token::HelperDisplay)?;
    poller.register(timer.fd(), Token::HelperTimer)?;
    timer.arm(timeout)?;

    let mut reply = Vec::with_capacity(DISPLAY_REPLY_MAX);
    loop {
        let Some(event) = poller.wait(None)? else {
            continue;
        };
        match event.token {
            Token::HelperDisplay => {
                let mut buf = [0u8; DISPLAY_REPLY_MAX];
                match read_chunk(display_read.as_raw_fd(), &mut buf)
                    .map_err(|err| HelperError::Setup(anyhow::anyhow!("read display fd: {err}")))?
                {
                    ReadOutcome::Data(n) => {
                        reply.extend_from_slice(&buf[..n]);
                        if reply.contains(&b'\n') || reply.len() >= DISPLAY_REPLY_MAX {
                            return parse_display(&reply);
                        }
                    }
                    ReadOutcome::Eof => {
                        if reply.is_empty() {
                            // helper closed the pipe without writing; wait for its exit status
                            poller.deregister(display_read.as_raw_fd())?;
                            continue;
                        }
                        return parse_display(&reply);
                    }
                    ReadOutcome::WouldBlock => {}
                }
            }
            Token::HelperTimer => return Err(HelperError::Timeout(timeout)),
            Token::Signal => {
                while let Some(signal) = signals.read()? {
                    match signal.signo {
                        libc::SIGINT | libc::SIGTERM => {
                            return Err(HelperError::Interrupted(signal_name(signal.signo)))
                        }
                        _ => {
                            let status = child.try_wait().map_err(|err| {
                                HelperError::Setup(anyhow::anyhow!("wait for helper: {err}"))
                            })?;
                            if let Some(status) = status {
                                return Err(HelperError::Exited(status));
                            }
                        }
                    }
                }
            }
            other => warn!(token = ?other, "unexpected event while waiting for helper"),
        }
    }
}

/// Turn the `-displayfd` reply into a display name.
pub fn parse_display(reply: &[u8]) -> Result<String, HelperError> {
    let text = String::from_utf8_lossy(reply);
    let trimmed = text.trim();
    match trimmed.parse::<u32>() {
        Ok(number) => Ok(format!(":{number}")),
        Err(_) => Err(HelperError::Protocol(trimmed.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script_helper(script: &str) -> HelperCommand {
        // `$2` is the display fd once the -displayfd arguments are appended
        HelperCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "helper".to_string()],
        }
    }

    fn setup() -> (Poller, SignalFd) {
        let poller = Poller::new().unwrap();
        let signals = SignalFd::new(&[libc::SIGUSR2]).unwrap();
        poller.register(signals.fd(), Token::Signal).unwrap();
        (poller, signals)
    }

    #[test]
    fn parses_display_replies() {
        assert_eq!(parse_display(b"1\n").unwrap(), ":1");
        assert_eq!(parse_display(b"42").unwrap(), ":42");
        assert!(matches!(
            parse_display(b"x\n"),
            Err(HelperError::Protocol(ref s)) if s == "x"
        ));
        assert!(parse_display(b"").is_err());
    }

    #[test]
    fn helper_reports_display_through_the_pipe() {
        let (poller, signals) = setup();
        let command = script_helper("echo 7 >&$2; exec sleep 5");
        let helper = start_helper(&command, &poller, &signals, Duration::from_secs(3)).unwrap();
        assert_eq!(helper.display(), ":7");
        helper.kill();
        let mut status = 0;
        // SAFETY: the helper pid is our direct child.
        unsafe { libc::waitpid(helper.pid(), &mut status, 0) };
    }

    #[test]
    fn silent_helper_times_out() {
        let (poller, signals) = setup();
        let command = script_helper("exec sleep 5");
        let err = start_helper(&command, &poller, &signals, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, HelperError::Timeout(_)));
    }

    #[test]
    fn closed_display_fd_still_cleans_up_the_poller() {
        let (poller, signals) = setup();
        let command = script_helper("eval \"exec $2>&-\"; exec sleep 5");
        let err = start_helper(&command, &poller, &signals, Duration::from_millis(300)).unwrap_err();
        assert!(matches!(err, HelperError::Timeout(_)));
        // neither the display fd nor the timer is left behind
        assert!(poller.wait(Some(Duration::from_millis(50))).unwrap().is_none());
    }

    #[test]
    fn malformed_reply_is_a_protocol_error() {
        let (poller, signals) = setup();
        let command = script_helper("echo nope >&$2; exec sleep 5");
        let err = start_helper(&command, &poller, &signals, Duration::from_secs(3)).unwrap_err();
        assert!(matches!(err, HelperError::Protocol(_)));
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let (poller, signals) = setup();
        let command = HelperCommand {
            program: "/nonexistent/nswrap-test-xvfb".to_string(),
            args: Vec::new(),
        };
        let err = start_helper(&command, &poller, &signals, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, HelperError::Spawn { .. }));
    }
}
