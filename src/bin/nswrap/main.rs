//! nswrap entrypoint: runs the dedicated server under a pseudo-terminal and exits with
//! a status that reflects how it ended.
//!
//! Usage errors exit 2 (clap), startup failures exit 1, and otherwise the server's own
//! status is passed through (127 when it failed to start, 128+N when killed by signal N).

use std::process::ExitCode;
use tracing::{error, info};

use nswrap::config::SupervisorConfig;
use nswrap::doctor::{base_doctor_report, log_startup_report};
use nswrap::proctitle::reserve_title_space;
use nswrap::telemetry::{init_tracing, install_panic_hook};
use nswrap::Supervisor;

fn main() -> ExitCode {
    init_tracing();
    install_panic_hook();
    reserve_title_space();
    let mut config = SupervisorConfig::parse_args();

    if config.doctor {
        println!("{}", base_doctor_report(&config).render());
        return ExitCode::SUCCESS;
    }

    if let Err(err) = config.validate() {
        error!("{err:#}");
        return ExitCode::FAILURE;
    }
    log_startup_report(&config);

    let supervisor = match Supervisor::start(config) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            error!("{err:#}");
            return ExitCode::FAILURE;
        }
    };
    info!(pid = supervisor.child_pid(), "server started");
    let disposition = supervisor.run();
    ExitCode::from(u8::try_from(disposition.exit_code()).unwrap_or(1))
}
