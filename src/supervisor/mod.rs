//! Process Supervisor: launches the server on a pseudo-terminal, routes every event from
//! the [`Poller`], and turns the run into an [`ExitDisposition`].

mod lifecycle;
mod reap;

use anyhow::{Context, Result};
use std::env;
use std::os::fd::{AsRawFd, OwnedFd};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::helper::{start_helper, Helper, HelperCommand};
use crate::proctitle::ProcessIdentity;
use crate::pty_session::{
    read_chunk, read_exec_error, spawn_in_pty, write_all, OutputFilter, Pty, ReadOutcome,
    CHUNK_SIZE,
};
use crate::reactor::{signal_name, Event, Poller, SignalEvent, SignalFd, TimerFd, Token};
use crate::status::StatusTracker;
use crate::watchdog::{TickOutcome, Watchdog, WatchdogExpiry};

pub use lifecycle::{ChildExit, ExitDisposition, Lifecycle, StopCause};
pub use reap::{reap_descendants, set_child_subreaper, set_no_new_privs};

/// Upper bound on chunks read while draining the terminal on shutdown.
const DRAIN_MAX_CHUNKS: usize = 256;
/// How long a server that is already exiting gets before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(1);

pub struct Supervisor {
    config: SupervisorConfig,
    poller: Poller,
    signals: SignalFd,
    watchdog_timer: TimerFd,
    shutdown_timer: TimerFd,
    pty: Pty,
    filter: OutputFilter,
    status: StatusTracker,
    identity: ProcessIdentity,
    watchdog: Watchdog,
    helper: Option<Helper>,
    child_pid: libc::pid_t,
    exec_error: Option<OwnedFd>,
    child_exit: Option<ChildExit>,
    lifecycle: Lifecycle,
    stop: Option<StopCause>,
}

impl Supervisor {
    /// Set up every descriptor, start the helper if requested, and launch the server.
    ///
    /// Any failure here is a fatal startup error; descriptors opened so far are closed
    /// on return and a started helper is killed.
    pub fn start(config: SupervisorConfig) -> Result<Self> {
        if let Err(err) = set_no_new_privs() {
            warn!("{err:#}");
        }

        let poller = Poller::new().context("failed to create epoll fd")?;
        let signals = SignalFd::supervisor().context("failed to register signal handlers")?;
        poller
            .register(signals.fd(), Token::Signal)
            .context("failed to add signalfd to epoll")?;

        if let Err(err) = set_child_subreaper() {
            warn!("failed to set the child subreaper; processes will not be reaped: {err:#}");
        }

        let helper = if config.wants_helper() {
            info!("starting xvfb");
            let helper = start_helper(
                &HelperCommand::xvfb(),
                &poller,
                &signals,
                config.helper_timeout(),
            )
            .context("failed to start xvfb")?;
            info!(pid = helper.pid(), display = helper.display(), "xvfb started");
            Some(helper)
        } else {
            None
        };

        match Self::launch(config, poller, signals, helper.as_ref()) {
            Ok(mut supervisor) => {
                supervisor.helper = helper;
                Ok(supervisor)
            }
            Err(err) => {
                if let Some(helper) = &helper {
                    info!("killing xvfb");
                    helper.kill();
                    reap_descendants(Duration::from_secs(1));
                }
                Err(err)
            }
        }
    }

    fn launch(
        config: SupervisorConfig,
        poller: Poller,
        signals: SignalFd,
        helper: Option<&Helper>,
    ) -> Result<Self> {
        env::set_current_dir(&config.game_dir)
            .with_context(|| format!("chdir '{}'", config.game_dir.display()))?;

        let pty = Pty::open().context("failed to create server terminal")?;
        poller
            .register(pty.master(), Token::Output)
            .context("failed to add output pty to epoll")?;

        let watchdog_timer = TimerFd::new().context("failed to create watchdog")?;
        poller
            .register(watchdog_timer.fd(), Token::Watchdog)
            .context("failed to add watchdog to epoll")?;
        let shutdown_timer = TimerFd::new().context("failed to create exit timerfd")?;
        poller
            .register(shutdown_timer.fd(), Token::ShutdownTimer)
            .context("failed to add exit timerfd to epoll")?;

        match &config.winedebug {
            None => info!("using WINEDEBUG='{}'", config.effective_winedebug()),
            Some(custom) => warn!(
                "WINEDEBUG has been overridden to '{custom}' (replacing the recommended value '{}')",
                crate::config::DEFAULT_WINEDEBUG
            ),
        }

        let command = config.child_command(helper.map(Helper::display));
        info!(command = %command.display(), "starting wine");
        let child = spawn_in_pty(&pty, &command)?;
        poller
            .register(child.exec_error.as_raw_fd(), Token::ExecError)
            .context("failed to add errno pipe to epoll")?;

        let watchdog = Watchdog::new(config.watchdog_config(), Instant::now());
        watchdog_timer
            .arm(watchdog.initial_timeout())
            .context("failed to arm watchdog")?;

        let mut identity = ProcessIdentity::from_setting(config.title.as_deref());
        identity.apply_initial();

        let mut supervisor = Self {
            config,
            poller,
            signals,
            watchdog_timer,
            shutdown_timer,
            pty,
            filter: OutputFilter::new(),
            status: StatusTracker::new(),
            identity,
            watchdog,
            helper: None,
            child_pid: child.pid,
            exec_error: Some(child.exec_error),
            child_exit: None,
            lifecycle: Lifecycle::Starting,
            stop: None,
        };
        supervisor.lifecycle = Lifecycle::Running;
        Ok(supervisor)
    }

    pub fn child_pid(&self) -> libc::pid_t {
        self.child_pid
    }

    /// Run until the server is gone, then reap everything and report how it ended.
    pub fn run(mut self) -> ExitDisposition {
        while self.lifecycle.is_active() && self.stop.is_none() {
            match self.poller.wait(None) {
                Ok(Some(event)) => {
                    if let Err(err) = self.dispatch(event) {
                        error!("{err:#}");
                        self.request_stop(StopCause::Error(format!("{err:#}")));
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    error!("epoll: {err:#}");
                    self.request_stop(StopCause::Error(format!("{err:#}")));
                }
            }
        }
        self.finish()
    }

    fn dispatch(&mut self, event: Event) -> Result<()> {
        match event.token {
            Token::Signal => self.handle_signals(),
            Token::Output if event.hangup && !event.readable => {
                debug!("server terminal hung up");
                self.poller.deregister(self.pty.master())
            }
            Token::Output => self.handle_output(),
            Token::Watchdog => self.handle_watchdog(),
            Token::ShutdownTimer => {
                self.shutdown_timer.read()?;
                warn!("process did not exit in time; killing it");
                self.request_stop(StopCause::ShutdownDeadline);
                Ok(())
            }
            Token::ExecError => self.handle_exec_error(),
            token @ (Token::HelperDisplay | Token::HelperTimer) => {
                warn!(?token, "unexpected helper event after startup");
                Ok(())
            }
        }
    }

    fn request_stop(&mut self, cause: StopCause) {
        if self.stop.is_none() {
            self.stop = Some(cause);
        }
    }

    fn handle_signals(&mut self) -> Result<()> {
        while let Some(signal) = self.signals.read()? {
            match signal.signo {
                libc::SIGINT | libc::SIGTERM => self.handle_stop_request(signal)?,
                libc::SIGCHLD => self.handle_child_exits(),
                other => warn!("unexpected signal {other}; ignoring"),
            }
        }
        Ok(())
    }

    fn handle_stop_request(&mut self, signal: SignalEvent) -> Result<()> {
        let signo = signal.signo;
        debug!(signal = signal_name(signo), sender = signal.pid, "stop requested");
        match self.lifecycle {
            Lifecycle::Running => {
                if signo == libc::SIGINT {
                    info!("received SIGINT; waiting for server to exit (press ctrl-c again to kill)");
                } else {
                    info!("received SIGTERM; waiting for server to exit");
                }
                let timeout = self.config.shutdown_timeout();
                self.shutdown_timer
                    .arm(timeout)
                    .context("failed to set exit timer")?;
                if let Err(err) = reap::send_signal(self.child_pid, libc::SIGTERM) {
                    warn!(pid = self.child_pid, "failed to send SIGTERM: {err}");
                }
                self.lifecycle = Lifecycle::Stopping {
                    deadline: Instant::now() + timeout,
                };
            }
            Lifecycle::Stopping { deadline } => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                info!(
                    signal = signal_name(signo),
                    remaining_ms = remaining.as_millis() as u64,
                    "killing process before the shutdown deadline"
                );
                self.request_stop(StopCause::UserForced);
            }
            Lifecycle::Starting | Lifecycle::Reaping | Lifecycle::Done => {
                debug!(signal = signal_name(signo), "ignoring stop request");
            }
        }
        Ok(())
    }

    fn handle_child_exits(&mut self) {
        for reaped in reap::reap_exited() {
            if reaped.pid == self.child_pid {
                self.child_exit = reaped.exit;
                self.request_stop(StopCause::ChildExited);
            } else if self.helper.as_ref().map(Helper::pid) == Some(reaped.pid) {
                match reaped.exit {
                    Some(exit) => warn!("xvfb terminated: {exit}"),
                    None => warn!("xvfb terminated"),
                }
                self.helper = None;
            } else {
                debug!(pid = reaped.pid, "reaped descendant");
            }
        }
    }

    fn handle_output(&mut self) -> Result<()> {
        let mut buf = [0u8; CHUNK_SIZE];
        match read_chunk(self.pty.master(), &mut buf).context("failed to process i/o")? {
            ReadOutcome::Data(n) => self.forward(&buf[..n]),
            ReadOutcome::Eof => {
                debug!("server terminal closed");
                self.poller.deregister(self.pty.master())
            }
            ReadOutcome::WouldBlock => Ok(()),
        }
    }

    /// Filter one chunk, write the clean bytes to stdout, then act on any titles.
    fn forward(&mut self, chunk: &[u8]) -> Result<()> {
        let mut titles = Vec::new();
        let clean = self
            .filter
            .process(chunk, |title| titles.push(title.to_vec()));
        if !clean.is_empty() {
            write_all(libc::STDOUT_FILENO, clean)?;
        }
        for title in titles {
            self.handle_title(&title)?;
        }
        Ok(())
    }

    fn handle_title(&mut self, raw: &[u8]) -> Result<()> {
        if raw.is_empty() {
            return Ok(());
        }
        let title = String::from_utf8_lossy(raw);
        let now = Instant::now();
        let Some(record) = self.status.observe(&title) else {
            self.identity.refresh(None, now);
            return Ok(());
        };
        let outcome = self.watchdog.on_tick(now);
        match outcome {
            TickOutcome::Promoted => info!(
                ticks = self.watchdog.tick_count(),
                "watchdog initialized"
            ),
            TickOutcome::Reset => debug!("late status update; watchdog initialization restarted"),
            TickOutcome::Counted | TickOutcome::Rearmed => {}
        }
        if outcome.rearms_timer() {
            self.watchdog_timer
                .arm(self.watchdog.interval())
                .context("failed to update watchdog")?;
        }
        self.identity.refresh(Some(record), now);
        Ok(())
    }

    fn handle_watchdog(&mut self) -> Result<()> {
        if self.watchdog_timer.read()? == 0 {
            return Ok(());
        }
        match self.watchdog.on_timeout(Instant::now()) {
            WatchdogExpiry::Warning(message) => warn!("watchdog: {message}"),
            WatchdogExpiry::Fatal(message) => {
                error!("watchdog: {message}");
                self.request_stop(StopCause::Watchdog(message));
            }
        }
        Ok(())
    }

    fn handle_exec_error(&mut self) -> Result<()> {
        let Some(fd) = self.exec_error.take() else {
            return Ok(());
        };
        self.poller.deregister(fd.as_raw_fd())?;
        match read_exec_error(fd.as_raw_fd()) {
            Ok(Some(errno)) => {
                error!(
                    "exec '{}' failed: {}",
                    self.config.wine_cmd,
                    std::io::Error::from_raw_os_error(errno)
                );
                self.request_stop(StopCause::ExecFailed { errno });
            }
            Ok(None) => debug!("server exec succeeded"),
            Err(err) => {
                error!(
                    "exec '{}' failed, but the error could not be read: {err}",
                    self.config.wine_cmd
                );
                self.request_stop(StopCause::ExecFailed { errno: libc::EIO });
            }
        }
        Ok(())
    }

    /// Copy whatever is still buffered in the terminal through the filter.
    fn drain_output(&mut self) {
        let mut buf = [0u8; CHUNK_SIZE];
        for _ in 0..DRAIN_MAX_CHUNKS {
            match read_chunk(self.pty.master(), &mut buf) {
                Ok(ReadOutcome::Data(n)) => {
                    if let Err(err) = self.forward(&buf[..n]) {
                        debug!("drain output: {err:#}");
                        break;
                    }
                }
                Ok(ReadOutcome::Eof) | Ok(ReadOutcome::WouldBlock) => break,
                Err(err) => {
                    debug!("drain output: {err}");
                    break;
                }
            }
        }
    }

    fn finish(mut self) -> ExitDisposition {
        self.lifecycle = Lifecycle::Reaping;
        let cause = self.stop.take().unwrap_or(StopCause::ChildExited);

        if self.child_exit.is_none() {
            let grace = if cause.forces_kill() {
                Duration::ZERO
            } else {
                EXIT_GRACE
            };
            self.child_exit = reap::collect_child_exit(self.child_pid, grace);
        }
        self.drain_output();

        // a failed exec may race the SIGCHLD that ended the loop
        if let Some(fd) = self.exec_error.take() {
            if let Ok(Some(errno)) = read_exec_error(fd.as_raw_fd()) {
                error!(
                    "exec '{}' failed: {}",
                    self.config.wine_cmd,
                    std::io::Error::from_raw_os_error(errno)
                );
            }
        }

        if let Some(last) = self.status.latest() {
            info!(status = %last, "last server status");
        }
        match self.child_exit {
            Some(exit) => info!(pid = self.child_pid, "northstar {exit}"),
            None => error!("failed to get northstar exit status"),
        }

        if let Some(helper) = self.helper.take() {
            if reap::send_signal(helper.pid(), 0).is_ok() {
                info!("killing xvfb");
                helper.kill();
            }
        }

        info!("waiting for children to exit");
        let descendants_reaped = reap_descendants(self.config.reap_timeout());
        self.lifecycle = Lifecycle::Done;

        ExitDisposition {
            cause,
            child: self.child_exit,
            descendants_reaped,
        }
    }
}
