use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn nswrap_bin() -> &'static str {
    option_env!("CARGO_BIN_EXE_nswrap").expect("nswrap test binary not built")
}

fn combined_output(output: &Output) -> String {
    let mut combined = String::new();
    combined.push_str(&String::from_utf8_lossy(&output.stdout));
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    combined
}

/// A game directory whose launcher is a shell script, run as `sh <launcher> -dedicated ...`.
struct Server {
    game_dir: TempDir,
    prefix: TempDir,
}

impl Server {
    fn with_script(script: &str) -> Self {
        let game_dir = tempfile::tempdir().expect("game dir");
        fs::write(game_dir.path().join("NorthstarLauncher.exe"), script).expect("write launcher");
        Self {
            game_dir,
            prefix: tempfile::tempdir().expect("wine prefix"),
        }
    }

    fn command(&self, flags: &[&str], server_args: &[&str]) -> Command {
        self.command_with_wine("sh", flags, server_args)
    }

    fn command_with_wine(&self, wine_cmd: &str, flags: &[&str], server_args: &[&str]) -> Command {
        let mut command = Command::new(nswrap_bin());
        command
            .args(["--allow-root", "--wine-cmd", wine_cmd])
            .args(flags)
            .arg(self.game_dir.path())
            .args(server_args)
            .env("WINEPREFIX", self.prefix.path())
            .env("DISPLAY", ":99")
            .env("NSWRAP_LOG", "info")
            .env_remove("NSWRAP_TRACE_LOG")
            .env_remove("NSWRAP_TITLE")
            .env_remove("WINEDEBUG")
            .stdin(Stdio::null());
        command
    }

    fn run(&self, flags: &[&str], server_args: &[&str]) -> Output {
        self.command(flags, server_args)
            .output()
            .expect("run nswrap")
    }
}

fn wait_with_deadline(child: &mut std::process::Child, limit: Duration) -> std::process::ExitStatus {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait().expect("try_wait") {
            return status;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("nswrap did not exit within {limit:?}");
        }
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn help_describes_the_wrapper() {
    let output = Command::new(nswrap_bin())
        .arg("--help")
        .output()
        .expect("run nswrap --help");
    assert!(output.status.success());
    let combined = combined_output(&output);
    assert!(combined.contains("pseudo-terminal"));
    assert!(combined.contains("GAME_DIR"));
}

#[test]
fn missing_game_dir_argument_is_usage_error() {
    let output = Command::new(nswrap_bin())
        .output()
        .expect("run nswrap without args");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn nonexistent_game_dir_fails_startup() {
    let server = Server::with_script("exit 0\n");
    let output = Command::new(nswrap_bin())
        .args(["--allow-root", "/nonexistent/nswrap-game-dir"])
        .env("WINEPREFIX", server.prefix.path())
        .output()
        .expect("run nswrap");
    assert_eq!(output.status.code(), Some(1));
    assert!(combined_output(&output).contains("nswrap-game-dir"));
}

#[test]
fn missing_launcher_fails_startup() {
    let server = Server::with_script("exit 0\n");
    fs::remove_file(server.game_dir.path().join("NorthstarLauncher.exe")).unwrap();
    let output = server.run(&[], &[]);
    assert_eq!(output.status.code(), Some(1));
    assert!(combined_output(&output).contains("NorthstarLauncher.exe missing"));
}

#[test]
fn missing_wineprefix_fails_startup() {
    let server = Server::with_script("exit 0\n");
    let output = server
        .command(&[], &[])
        .env_remove("WINEPREFIX")
        .output()
        .expect("run nswrap");
    assert_eq!(output.status.code(), Some(1));
    assert!(combined_output(&output).contains("WINEPREFIX not set"));
}

#[test]
fn doctor_prints_report_and_exits() {
    let server = Server::with_script("exit 0\n");
    let output = server.run(&["--doctor"], &[]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("nswrap doctor"));
    assert!(stdout.contains("system info:"));
    assert!(stdout.contains("validation: ok"));
}

#[test]
fn server_exit_code_passes_through() {
    let server = Server::with_script("exit 3\n");
    let output = server.run(&[], &[]);
    assert_eq!(output.status.code(), Some(3));
    assert!(combined_output(&output).contains("exited with status 3"));
}

#[test]
fn server_receives_dedicated_and_trailing_args() {
    let server = Server::with_script("echo \"args:$*\"\n");
    let output = server.run(&[], &["-port", "37015", "+setplaylist", "ps"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("args:-dedicated -port 37015 +setplaylist ps"),
        "{stdout}"
    );
}

#[test]
fn exec_failure_reports_127() {
    let server = Server::with_script("exit 0\n");
    let output = server
        .command_with_wine("nswrap-test-missing-wine", &[], &[])
        .output()
        .expect("run nswrap");
    assert_eq!(output.status.code(), Some(127));
    let combined = combined_output(&output);
    assert!(combined.contains("nswrap-test-missing-wine"), "{combined}");
    assert!(combined.contains("failed to start"), "{combined}");
}

#[test]
fn titles_are_removed_from_forwarded_output() {
    let server = Server::with_script(
        "printf 'hello\\n\\033]0;Foo - mp_grave 3/8 (pilots)\\007world\\n\\033[?25l'\n",
    );
    let output = server.run(&[], &[]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("hello"), "{stdout}");
    assert!(stdout.contains("world"), "{stdout}");
    assert!(!stdout.contains("mp_grave"), "{stdout}");
    assert!(!stdout.contains('\u{1b}'), "{stdout:?}");
}

#[test]
fn status_updates_satisfy_the_watchdog() {
    let server = Server::with_script(
        "for i in 1 2 3; do printf '\\033]0;Foo - mp_lobby %s/16 players (private_match)\\007' \"$i\"; done\nsleep 3\nexit 0\n",
    );
    let output = server.run(
        &["--watchdog-init-ticks", "2", "--watchdog-init-window-secs", "2"],
        &[],
    );
    assert_eq!(
        output.status.code(),
        Some(0),
        "{}",
        combined_output(&output)
    );
    assert!(combined_output(&output).contains("watchdog initialized"));
}

#[test]
fn missed_startup_window_only_warns() {
    // ticks slower than the interval never promote, but the server keeps running
    let server = Server::with_script(
        "for i in 1 2 3; do printf '\\033]0;Foo - mp_lobby %s/16 (private_match)\\007' \"$i\"; sleep 1.5; done\nexit 4\n",
    );
    let output = server.run(
        &[
            "--watchdog-init-ticks",
            "3",
            "--watchdog-interval-secs",
            "1",
            "--watchdog-init-window-secs",
            "2",
        ],
        &[],
    );
    let combined = combined_output(&output);
    assert_eq!(output.status.code(), Some(4), "{combined}");
    assert!(
        combined.contains("did not receive enough status updates"),
        "{combined}"
    );
    assert!(!combined.contains("killing server"), "{combined}");
}

#[test]
fn silent_server_is_killed_after_promotion() {
    let server = Server::with_script(
        "printf '\\033]0;Foo - mp_lobby 1/16 (private_match)\\007'\nprintf '\\033]0;Foo - mp_lobby 2/16 (private_match)\\007'\nexec sleep 30\n",
    );
    let start = Instant::now();
    let output = server.run(
        &[
            "--watchdog-init-ticks",
            "2",
            "--watchdog-interval-secs",
            "1",
            "--watchdog-init-window-secs",
            "20",
            "--reap-timeout-secs",
            "1",
        ],
        &[],
    );
    let combined = combined_output(&output);
    assert_eq!(output.status.code(), Some(1), "{combined}");
    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(combined.contains("watchdog initialized"), "{combined}");
    assert!(
        combined.contains("did not receive a status update in time"),
        "{combined}"
    );
}

fn spawn_until_ready(server: &Server, flags: &[&str]) -> std::process::Child {
    let mut child = server
        .command(flags, &[])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn nswrap");
    let stdout = child.stdout.take().expect("piped stdout");
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    reader.read_line(&mut line).expect("read ready line");
    assert!(line.contains("ready"), "{line:?}");
    // keep the pipe open so later output never hits EPIPE
    thread::spawn(move || {
        let _ = std::io::copy(&mut reader, &mut std::io::sink());
    });
    child
}

fn terminate(child: &std::process::Child) {
    // SAFETY: kill with integer arguments only.
    let rc = unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
    assert_eq!(rc, 0);
}

#[test]
fn sigterm_lets_the_server_exit_gracefully() {
    let server = Server::with_script(
        "trap 'exit 0' TERM\necho ready\nwhile :; do sleep 0.1; done\n",
    );
    let mut child = spawn_until_ready(&server, &["--reap-timeout-secs", "1"]);
    terminate(&child);
    let status = wait_with_deadline(&mut child, Duration::from_secs(10));
    assert_eq!(status.code(), Some(0));
}

#[test]
fn server_ignoring_sigterm_is_killed_after_the_deadline() {
    let server = Server::with_script("trap '' TERM\necho ready\nexec sleep 30\n");
    let mut child = spawn_until_ready(
        &server,
        &["--shutdown-timeout-secs", "1", "--reap-timeout-secs", "1"],
    );
    let start = Instant::now();
    terminate(&child);
    let status = wait_with_deadline(&mut child, Duration::from_secs(10));
    assert_eq!(status.code(), Some(1));
    assert!(start.elapsed() >= Duration::from_millis(900));
}

#[test]
fn second_stop_request_kills_without_waiting_for_the_deadline() {
    let server = Server::with_script("trap '' TERM\necho ready\nexec sleep 30\n");
    let mut child = spawn_until_ready(
        &server,
        &["--shutdown-timeout-secs", "30", "--reap-timeout-secs", "1"],
    );
    let start = Instant::now();
    terminate(&child);
    // separate deliveries; signalfd would merge two pending SIGTERMs
    thread::sleep(Duration::from_millis(300));
    terminate(&child);
    let status = wait_with_deadline(&mut child, Duration::from_secs(10));
    assert_eq!(status.code(), Some(1));
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[test]
fn orphaned_descendants_are_reaped_before_exit() {
    let server = Server::with_script("(sleep 1; touch reaped) &\nexit 0\n");
    let start = Instant::now();
    let output = server.run(&["--reap-timeout-secs", "5"], &[]);
    assert_eq!(output.status.code(), Some(0), "{}", combined_output(&output));
    assert!(server.game_dir.path().join("reaped").exists());
    assert!(start.elapsed() >= Duration::from_millis(900));
}

#[test]
fn process_identity_replaces_the_command_line() {
    let server = Server::with_script(concat!(
        "title() { printf '\\033]0;%s\\007' \"$1\"; }\n",
        "show() { printf '%s:' \"$1\"; tr '\\000' ' ' < /proc/$PPID/cmdline; echo; }\n",
        "sleep 0.3\n",
        "title 'Foo - mp_lobby 5/16 players (private_match)'\n",
        "sleep 0.3\n",
        "show with_status\n",
        "title 'Loading'\n",
        "sleep 0.3\n",
        "show without_status\n",
    ));
    let output = server.run(&[], &[]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = |tag: &str| {
        stdout
            .lines()
            .find_map(|line| line.trim().strip_prefix(tag).map(str::to_string))
            .unwrap_or_else(|| panic!("no {tag} line in {stdout:?}"))
    };
    let with_status = line("with_status:");
    assert!(
        with_status.starts_with("northstar [5/16 mp_lobby private_match]"),
        "{with_status:?}"
    );
    let without_status = line("without_status:");
    assert!(without_status.starts_with("northstar"), "{without_status:?}");
    assert!(!without_status.contains('['), "{without_status:?}");
}

#[test]
fn game_dir_must_be_a_directory() {
    let server = Server::with_script("exit 0\n");
    let file = server.game_dir.path().join("NorthstarLauncher.exe");
    let output = Command::new(nswrap_bin())
        .args(["--allow-root"])
        .arg(Path::new(&file))
        .env("WINEPREFIX", server.prefix.path())
        .output()
        .expect("run nswrap");
    assert_eq!(output.status.code(), Some(1));
}
