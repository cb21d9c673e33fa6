//! Event Dispatcher: one epoll set that every event source registers with.
//!
//! Signals arrive through a signalfd and deadlines through timerfds, so the supervisor
//! loop only ever blocks in [`Poller::wait`] and handles exactly one event per turn.

mod epoll;
mod signals;
mod timer;


pub use epoll::{Event, Poller};
pub use signals::{SignalEvent, SignalFd};
pub(crate) use signals::signal_name;
pub use timer::TimerFd;

/// Identity of a registered descriptor, stored in the epoll user data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    Signal,
    Output,
    Watchdog,
    ShutdownTimer,
    ExecError,
    HelperDisplay,
    HelperTimer,
}

impl Token {
    const ALL: [Token; 7] = [
        Token::Signal,
        Token::Output,
        Token::Watchdog,
        Token::ShutdownTimer,
        Token::ExecError,
        Token::HelperDisplay,
        Token::HelperTimer,
    ];

    pub(crate) fn as_u64(self) -> u64 {
        match self {
            Token::Signal => 1,
            Token::Output => 2,
            Token::Watchdog => 3,
            Token::ShutdownTimer => 4,
            Token::ExecError => 5,
            Token::HelperDisplay => 6,
            Token::HelperTimer => 7,
        }
    }

    pub(crate) fn from_u64(raw: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|token| token.as_u64() == raw)
    }
}
