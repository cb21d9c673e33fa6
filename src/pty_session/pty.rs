//! Pseudo-terminal (PTY) allocation and child launch.
//!
//! The server runs with the slave side as its controlling terminal and stdio. The
//! supervisor keeps both ends open for the whole session so the master never reports
//! hang-up while wine is still shuffling processes around.

use anyhow::{anyhow, Context, Result};
use std::ffi::{CString, OsStr};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use tracing::debug;

use super::io::{read_chunk, ReadOutcome};

/// Wide enough that the server never wraps a status line.
pub const PTY_COLUMNS: u16 = 1200;
pub const PTY_ROWS: u16 = 25;

/// Exit status used by the forked child when exec fails.
pub const EXEC_FAILED_STATUS: i32 = 127;

/// Both ends of the server console.
#[derive(Debug)]
pub struct Pty {
    master: OwnedFd,
    slave: OwnedFd,
}

impl Pty {
    /// Allocate a terminal in canonical mode with a 0.1s read timeout on the slave.
    pub fn open() -> Result<Self> {
        let mut master_fd: RawFd = -1;
        let mut slave_fd: RawFd = -1;

        // SAFETY: termios and winsize are plain C structs; zeroed is a valid baseline.
        let mut termios: libc::termios = unsafe { mem::zeroed() };
        termios.c_iflag = libc::BRKINT | libc::IGNPAR | libc::ISTRIP | libc::IGNCR | libc::IUTF8;
        termios.c_oflag = libc::OPOST | libc::ONOCR;
        termios.c_cflag = libc::CREAD;
        termios.c_lflag = libc::ISIG | libc::ICANON;
        // return from read() at least every 0.1s, whether or not data is available
        termios.c_cc[libc::VMIN] = 0;
        termios.c_cc[libc::VTIME] = 1;

        let mut winsize: libc::winsize = unsafe { mem::zeroed() };
        winsize.ws_col = PTY_COLUMNS;
        winsize.ws_row = PTY_ROWS;

        // SAFETY: openpty writes the two fds and reads termios/winsize from stack locals.
        let rc = unsafe {
            libc::openpty(
                &mut master_fd,
                &mut slave_fd,
                ptr::null_mut(),
                &mut termios,
                &mut winsize,
            )
        };
        if rc != 0 {
            return Err(errno_error("openpty failed"));
        }

        // SAFETY: openpty succeeded, so both fds are open and owned by nobody else.
        let pty = unsafe {
            Self {
                master: OwnedFd::from_raw_fd(master_fd),
                slave: OwnedFd::from_raw_fd(slave_fd),
            }
        };
        set_cloexec(pty.master.as_raw_fd())?;
        set_cloexec(pty.slave.as_raw_fd())?;
        set_nonblocking(pty.master.as_raw_fd())?;
        Ok(pty)
    }

    pub fn master(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    pub fn slave(&self) -> RawFd {
        self.slave.as_raw_fd()
    }
}

/// Program, arguments, and the complete environment for the server process.
#[derive(Debug, Clone)]
pub struct ChildCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ChildCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Render the command line for logs.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// A forked child attached to the terminal, plus the pipe that reports a failed exec.
#[derive(Debug)]
pub struct SpawnedChild {
    pub pid: libc::pid_t,
    pub exec_error: OwnedFd,
}

/// Fork and exec `command` with the terminal slave as its controlling terminal.
///
/// Everything the child touches is allocated before `fork()` so the child only makes
/// async-signal-safe calls.
pub fn spawn_in_pty(pty: &Pty, command: &ChildCommand) -> Result<SpawnedChild> {
    let program = std::iter::once(command.program.as_str());
    let argv = cstrings(program.chain(command.args.iter().map(String::as_str)))
        .context("child argument contains NUL byte")?;
    let envp = cstrings(command.env.iter().map(|(k, v)| format!("{k}={v}")))
        .context("child environment contains NUL byte")?;
    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|s| s.as_ptr()).collect();
    argv_ptrs.push(ptr::null());
    let mut envp_ptrs: Vec<*const libc::c_char> = envp.iter().map(|s| s.as_ptr()).collect();
    envp_ptrs.push(ptr::null());

    let (err_read, err_write) = pipe_cloexec()?;
    set_nonblocking(err_read.as_raw_fd())?;

    // SAFETY: the child branch only calls async-signal-safe functions and never returns.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(errno_error("fork failed"));
    }
    if pid == 0 {
        // SAFETY: we are in the freshly forked child; all pointers were built before fork.
        unsafe {
            child_exec(
                pty.slave(),
                err_write.as_raw_fd(),
                argv_ptrs.as_ptr(),
                envp_ptrs.as_ptr(),
            )
        }
    }

    drop(err_write);
    debug!(pid, command = %command.display(), "forked server process");
    Ok(SpawnedChild {
        pid,
        exec_error: err_read,
    })
}

/// Child process setup after fork: attaches the terminal and execs the target.
///
/// # Safety
///
/// Must only be called in the child process after `fork()`. It either replaces the
/// process image or reports errno on `err_fd` and calls `_exit(127)`.
unsafe fn child_exec(
    slave_fd: RawFd,
    err_fd: RawFd,
    argv: *const *const libc::c_char,
    envp: *const *const libc::c_char,
) -> ! {
    let fail = || -> ! {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        let bytes = errno.to_ne_bytes();
        let _ = libc::write(err_fd, bytes.as_ptr() as *const libc::c_void, bytes.len());
        libc::_exit(EXEC_FAILED_STATUS);
    };

    // the supervisor blocks its signals for signalfd and ignores SIGPIPE; undo both
    let mut empty: libc::sigset_t = mem::zeroed();
    libc::sigemptyset(&mut empty);
    libc::sigprocmask(libc::SIG_SETMASK, &empty, ptr::null_mut());
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);

    if libc::setsid() == -1 {
        fail();
    }
    if libc::ioctl(slave_fd, libc::TIOCSCTTY as libc::c_ulong, 0) == -1 {
        fail();
    }
    if libc::dup2(slave_fd, libc::STDIN_FILENO) < 0
        || libc::dup2(slave_fd, libc::STDOUT_FILENO) < 0
        || libc::dup2(slave_fd, libc::STDERR_FILENO) < 0
    {
        fail();
    }

    libc::execvpe(*argv, argv, envp);
    fail();
}

/// Read the errno the child wrote before `_exit`, if any.
///
/// `Ok(None)` means the pipe closed cleanly: exec succeeded.
pub fn read_exec_error(fd: RawFd) -> io::Result<Option<i32>> {
    let mut buf = [0u8; mem::size_of::<i32>()];
    match read_chunk(fd, &mut buf)? {
        ReadOutcome::Data(n) if n == buf.len() => Ok(Some(i32::from_ne_bytes(buf))),
        ReadOutcome::Data(_) => Ok(Some(libc::EIO)),
        ReadOutcome::Eof | ReadOutcome::WouldBlock => Ok(None),
    }
}

fn cstrings<I, S>(items: I) -> Result<Vec<CString>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .map(|item| {
            let item = item.as_ref();
            CString::new(item).map_err(|_| anyhow!("contains NUL byte: {item}"))
        })
        .collect()
}

/// Convert a path for use with libc calls.
pub fn path_cstring(path: &Path) -> Result<CString> {
    let raw: &OsStr = path.as_os_str();
    CString::new(raw.as_bytes())
        .with_context(|| format!("path contains NUL byte: {}", path.display()))
}

/// Create a pipe with both ends close-on-exec.
pub fn pipe_cloexec() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [-1; 2];
    // SAFETY: pipe2 writes two fds into the array.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(errno_error("pipe2 failed"));
    }
    // SAFETY: pipe2 succeeded; both fds are fresh and exclusively ours.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// Configure an fd for non-blocking reads.
pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    // SAFETY: fcntl on a caller-owned fd only manipulates its flags.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(errno_error("fcntl(F_GETFL) failed"));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(errno_error("fcntl(F_SETFL) failed"));
        }
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    // SAFETY: fcntl on a caller-owned fd only manipulates its descriptor flags.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD, 0);
        if flags < 0 {
            return Err(errno_error("fcntl(F_GETFD) failed"));
        }
        if libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(errno_error("fcntl(F_SETFD) failed"));
        }
    }
    Ok(())
}

/// Helper that formats OS errors with additional context.
pub fn errno_error(context: &str) -> anyhow::Error {
    anyhow!("{context}: {}", io::Error::last_os_error())
}
