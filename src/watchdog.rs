//! Liveness watchdog fed by successful status parses.
//!
//! The server must first prove it is up by producing `init_ticks` status updates, none
//! more than `interval` apart, within `init_window`. After that it only has to produce
//! one update per `interval`. Missing the startup window is only reported: a server that
//! keeps ticking too slowly stays in `Initializing` and is left running. Missing a
//! steady-state interval ends the session. The watchdog itself is a pure state machine
//! over [`Instant`]; the supervisor owns the timerfd and re-arms it when told to.

use std::time::{Duration, Instant};

pub const DEFAULT_INIT_TICKS: u32 = 10;
pub const DEFAULT_INIT_WINDOW: Duration = Duration::from_secs(240);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub init_ticks: u32,
    pub init_window: Duration,
    pub interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            init_ticks: DEFAULT_INIT_TICKS,
            init_window: DEFAULT_INIT_WINDOW,
            interval: DEFAULT_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogPhase {
    Initializing,
    SteadyState,
}

/// What a tick did to the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Counted toward initialization; the startup deadline is unchanged.
    Counted,
    /// Arrived too late during initialization; the count restarted.
    Reset,
    /// Completed initialization; the timer moves to `now + interval`.
    Promoted,
    /// Steady-state tick; the timer moves to `now + interval`.
    Rearmed,
}

impl TickOutcome {
    pub fn rearms_timer(self) -> bool {
        matches!(self, Self::Promoted | Self::Rearmed)
    }
}

/// A fired watchdog timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogExpiry {
    /// The startup window passed without promotion; the timer stays disarmed.
    Warning(String),
    /// No status update within the steady-state interval.
    Fatal(String),
}

impl WatchdogExpiry {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Warning(message) | Self::Fatal(message) => message,
        }
    }
}

#[derive(Debug)]
pub struct Watchdog {
    config: WatchdogConfig,
    phase: WatchdogPhase,
    tick_count: u32,
    last_tick: Option<Instant>,
    started: Instant,
}

impl Watchdog {
    /// Start in `Initializing`; the caller arms the timer for [`Watchdog::initial_timeout`].
    pub fn new(config: WatchdogConfig, now: Instant) -> Self {
        Self {
            config,
            phase: WatchdogPhase::Initializing,
            tick_count: 0,
            last_tick: None,
            started: now,
        }
    }

    pub fn config(&self) -> WatchdogConfig {
        self.config
    }

    pub fn phase(&self) -> WatchdogPhase {
        self.phase
    }

    pub fn tick_count(&self) -> u32 {
        self.tick_count
    }

    pub fn initial_timeout(&self) -> Duration {
        self.config.init_window
    }

    /// Delay to arm after a tick that reports [`TickOutcome::rearms_timer`].
    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    /// Record one successful status update.
    pub fn on_tick(&mut self, now: Instant) -> TickOutcome {
        let previous = self.last_tick.replace(now);
        match self.phase {
            WatchdogPhase::SteadyState => TickOutcome::Rearmed,
            WatchdogPhase::Initializing => {
                let late = previous
                    .map(|last| now.saturating_duration_since(last) > self.config.interval)
                    .unwrap_or(false);
                if late {
                    self.tick_count = 0;
                    return TickOutcome::Reset;
                }
                self.tick_count = self.tick_count.saturating_add(1);
                if self.tick_count >= self.config.init_ticks {
                    self.phase = WatchdogPhase::SteadyState;
                    TickOutcome::Promoted
                } else {
                    TickOutcome::Counted
                }
            }
        }
    }

    /// Classify the expiry that just fired.
    pub fn on_timeout(&self, now: Instant) -> WatchdogExpiry {
        match self.phase {
            WatchdogPhase::SteadyState => {
                let since = self.last_tick.unwrap_or(self.started);
                WatchdogExpiry::Fatal(format!(
                    "watchdog did not receive a status update in time: last tick was {}s ago",
                    now.saturating_duration_since(since).as_secs()
                ))
            }
            WatchdogPhase::Initializing => WatchdogExpiry::Warning(format!(
                "watchdog did not receive enough status updates for initialization: only received {}/{} initial ticks less than {}s apart within {}s",
                self.tick_count,
                self.config.init_ticks,
                self.config.interval.as_secs(),
                self.config.init_window.as_secs()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WatchdogConfig {
        WatchdogConfig {
            init_ticks: 3,
            init_window: Duration::from_secs(240),
            interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn promotes_after_enough_quick_ticks() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(config(), start);
        assert_eq!(watchdog.phase(), WatchdogPhase::Initializing);

        assert_eq!(watchdog.on_tick(start + Duration::from_secs(1)), TickOutcome::Counted);
        assert_eq!(watchdog.on_tick(start + Duration::from_secs(30)), TickOutcome::Counted);
        let outcome = watchdog.on_tick(start + Duration::from_secs(60));
        assert_eq!(outcome, TickOutcome::Promoted);
        assert!(outcome.rearms_timer());
        assert_eq!(watchdog.phase(), WatchdogPhase::SteadyState);
    }

    #[test]
    fn late_tick_resets_count_but_not_phase() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(config(), start);
        watchdog.on_tick(start);
        watchdog.on_tick(start + Duration::from_secs(10));
        assert_eq!(watchdog.tick_count(), 2);

        let outcome = watchdog.on_tick(start + Duration::from_secs(71));
        assert_eq!(outcome, TickOutcome::Reset);
        assert!(!outcome.rearms_timer());
        assert_eq!(watchdog.tick_count(), 0);
        assert_eq!(watchdog.phase(), WatchdogPhase::Initializing);

        // the late tick becomes the reference point for the next gap
        assert_eq!(
            watchdog.on_tick(start + Duration::from_secs(80)),
            TickOutcome::Counted
        );
        assert_eq!(watchdog.tick_count(), 1);
    }

    #[test]
    fn laggy_child_never_promotes() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(config(), start);
        for i in 0..10u64 {
            watchdog.on_tick(start + Duration::from_secs(61 * i));
        }
        assert_eq!(watchdog.phase(), WatchdogPhase::Initializing);
        assert!(watchdog.tick_count() <= 1);
    }

    #[test]
    fn steady_state_ticks_always_rearm() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(config(), start);
        for i in 0..3u64 {
            watchdog.on_tick(start + Duration::from_secs(i));
        }
        assert_eq!(watchdog.phase(), WatchdogPhase::SteadyState);
        // gaps no longer matter once promoted
        assert_eq!(
            watchdog.on_tick(start + Duration::from_secs(500)),
            TickOutcome::Rearmed
        );
        assert_eq!(watchdog.phase(), WatchdogPhase::SteadyState);
    }

    #[test]
    fn startup_window_expiry_only_warns() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(config(), start);
        watchdog.on_tick(start + Duration::from_secs(5));
        let expiry = watchdog.on_timeout(start + Duration::from_secs(240));
        assert!(!expiry.is_fatal());
        assert_eq!(
            expiry.message(),
            "watchdog did not receive enough status updates for initialization: only received 1/3 initial ticks less than 60s apart within 240s"
        );
        assert_eq!(watchdog.phase(), WatchdogPhase::Initializing);

        // a slow server can still promote after the window passed
        assert_eq!(
            watchdog.on_tick(start + Duration::from_secs(250)),
            TickOutcome::Reset
        );
        watchdog.on_tick(start + Duration::from_secs(260));
        watchdog.on_tick(start + Duration::from_secs(270));
        assert_eq!(
            watchdog.on_tick(start + Duration::from_secs(280)),
            TickOutcome::Promoted
        );
    }

    #[test]
    fn steady_state_expiry_is_fatal() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(config(), start);
        for i in 5..8u64 {
            watchdog.on_tick(start + Duration::from_secs(i));
        }
        let expiry = watchdog.on_timeout(start + Duration::from_secs(67));
        assert!(expiry.is_fatal());
        assert_eq!(
            expiry,
            WatchdogExpiry::Fatal(
                "watchdog did not receive a status update in time: last tick was 60s ago".to_string()
            )
        );
    }

    #[test]
    fn defaults_match_documented_tunables() {
        let config = WatchdogConfig::default();
        assert_eq!(config.init_ticks, 10);
        assert_eq!(config.init_window, Duration::from_secs(240));
        assert_eq!(config.interval, Duration::from_secs(60));
        let watchdog = Watchdog::new(config, Instant::now());
        assert_eq!(watchdog.initial_timeout(), Duration::from_secs(240));
        assert_eq!(watchdog.interval(), Duration::from_secs(60));
    }
}
