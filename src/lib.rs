pub mod config;
pub mod doctor;
pub mod helper;
pub mod proctitle;
pub mod pty_session;
pub mod reactor;
pub mod status;
pub mod supervisor;
pub mod telemetry;
pub mod watchdog;

pub use status::{parse_status, StatusParseError, StatusRecord};
pub use supervisor::{ExitDisposition, Supervisor};
pub use watchdog::{Watchdog, WatchdogConfig, WatchdogExpiry, WatchdogPhase};
