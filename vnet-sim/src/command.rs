//! Utilities for [`std::process::Command`].
//!
//! [`Runner::checked`] is used for short-lived configuration commands (`ip`, `tc`, `sysctl`) and
//! turns a non-zero exit into an error. [`Runner::with_timeout`] is used for user commands: it
//! captures output incrementally, so that a process killed at its deadline still reports what it
//! printed so far.

use std::{
    fmt::{self, Display},
    io,
    os::unix::process::{CommandExt as _, ExitStatusExt as _},
    process::{self, Stdio},
    sync::Arc,
    time::Duration,
};

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt as _};

/// How long to keep draining pipes after the process is gone. Grandchildren may inherit the pipes
/// and keep them open past the deadline.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// How long a process gets to exit after `SIGTERM` at the deadline before it is killed.
pub const TERM_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("empty command provided")]
    Empty,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("`{command}` exited with {}: {}", .output.exit, .output.stderr.trim())]
    NonZero { command: String, output: Output },
}

pub type Result<T> = std::result::Result<T, Error>;

/// How a process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitCode {
    /// The process exited with the given status code.
    Code(i32),
    /// The process was terminated by the given signal.
    Signal(i32),
    /// The process was still running at the deadline and has been killed.
    Timeout,
}

impl ExitCode {
    #[inline]
    pub fn success(&self) -> bool {
        matches!(self, Self::Code(0))
    }
}

impl From<process::ExitStatus> for ExitCode {
    fn from(status: process::ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Code(code),
            (None, Some(signal)) => Self::Signal(signal),
            // Neither a code nor a signal: treat as an abnormal exit.
            (None, None) => Self::Code(-1),
        }
    }
}

impl Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signal(signal) => write!(f, "signal {signal}"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Captured result of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub exit: ExitCode,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn new(exit: ExitCode, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self { exit, stdout: stdout.into(), stderr: stderr.into() }
    }

    /// A successful, silent output.
    pub fn empty() -> Self {
        Self::new(ExitCode::Code(0), String::new(), String::new())
    }

    #[inline]
    pub fn success(&self) -> bool {
        self.exit.success()
    }
}

impl From<process::Output> for Output {
    fn from(value: process::Output) -> Self {
        Self {
            exit: value.status.into(),
            stdout: String::from_utf8_lossy(&value.stdout).to_string(),
            stderr: String::from_utf8_lossy(&value.stderr).to_string(),
        }
    }
}

/// A growable buffer shared between a pipe reader and the caller.
#[derive(Debug, Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    async fn fill<R: AsyncRead + Unpin>(self, mut pipe: R) {
        let mut chunk = [0u8; 4096];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => self.0.lock().extend_from_slice(&chunk[..n]),
            }
        }
    }

    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).to_string()
    }
}

#[derive(Debug)]
pub struct Runner;

impl Runner {
    /// Runs `args[0]` with the remaining arguments and waits for it to finish. A non-zero exit
    /// status is returned as [`Error::NonZero`].
    pub fn checked(args: &[&str]) -> Result<Output> {
        let (program, rest) = args.split_first().ok_or(Error::Empty)?;
        let mut cmd = process::Command::new(program);
        cmd.args(rest).stdin(Stdio::null()).stderr(Stdio::piped()).stdout(Stdio::piped());

        tracing::debug!(?cmd, "running command");

        let output: Output = cmd.spawn()?.wait_with_output()?.into();

        if !output.success() {
            tracing::debug!(?output.stderr, %output.exit, ?cmd, "command returned non-zero status");
            return Err(Error::NonZero { command: args.join(" "), output });
        }

        Ok(output)
    }

    /// Runs `args[0]` with the remaining arguments, killing it if it is still running after
    /// `timeout`.
    ///
    /// The process is started in its own process group. At the deadline the process and its group
    /// get `SIGTERM`, and whatever is still running [`TERM_GRACE`] later gets `SIGKILL`. A
    /// non-zero exit status is not an error: it is reported in [`Output::exit`].
    pub fn with_timeout(args: &[&str], timeout: Duration) -> Result<Output> {
        let (program, rest) = args.split_first().ok_or(Error::Empty)?;
        let mut cmd = process::Command::new(program);
        cmd.args(rest)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .stdout(Stdio::piped())
            .process_group(0);

        tracing::debug!(?cmd, ?timeout, "running command with deadline");

        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        rt.block_on(wait_with_deadline(cmd.into(), timeout))
    }
}

async fn wait_with_deadline(mut cmd: tokio::process::Command, timeout: Duration) -> Result<Output> {
    // Dropping the child on any early return kills it.
    cmd.kill_on_drop(true);
    let mut child = cmd.spawn()?;

    let stdout = Capture::default();
    let stderr = Capture::default();
    let readers = [
        child.stdout.take().map(|pipe| tokio::spawn(stdout.clone().fill(pipe))),
        child.stderr.take().map(|pipe| tokio::spawn(stderr.clone().fill(pipe))),
    ];

    let waited = tokio::time::timeout(timeout, child.wait()).await;
    let exit = match waited {
        Ok(status) => ExitCode::from(status?),
        Err(_) => {
            tracing::debug!(pid = ?child.id(), ?timeout, "deadline elapsed, terminating process");
            terminate(&mut child).await;
            ExitCode::Timeout
        }
    };

    for reader in readers.into_iter().flatten() {
        if tokio::time::timeout(DRAIN_GRACE, reader).await.is_err() {
            tracing::debug!("pipe still open after exit, keeping partial output");
        }
    }

    Ok(Output { exit, stdout: stdout.contents(), stderr: stderr.contents() })
}

/// Stops a process that ran past its deadline. `sudo` relays `SIGTERM` to the command it runs
/// but cannot relay `SIGKILL`, so the polite signal goes first.
async fn terminate(child: &mut tokio::process::Child) {
    send(child, Signal::SIGTERM);
    if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
        return;
    }

    tracing::debug!(pid = ?child.id(), "process survived SIGTERM, killing it");
    send(child, Signal::SIGKILL);
    if let Err(e) = child.kill().await {
        tracing::debug!(?e, "failed to kill child");
    }
}

/// Sends `sig` to `child` and to the process group it leads.
fn send(child: &tokio::process::Child, sig: Signal) {
    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else { return };
    let pid = Pid::from_raw(pid);

    if let Err(e) = signal::kill(pid, sig) {
        tracing::debug!(?e, %pid, ?sig, "failed to signal process");
    }
    if let Err(e) = signal::killpg(pid, sig) {
        // Expected when the group runs with higher privileges (e.g. under sudo).
        tracing::debug!(?e, %pid, ?sig, "failed to signal process group");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checked_captures_stdout() {
        let _ = tracing_subscriber::fmt::try_init();

        let output = Runner::checked(&["sh", "-c", "echo hello"]).unwrap();
        assert_eq!(output.exit, ExitCode::Code(0));
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn checked_reports_non_zero() {
        let err = Runner::checked(&["sh", "-c", "echo oops >&2; exit 3"]).unwrap_err();
        match err {
            Error::NonZero { output, .. } => {
                assert_eq!(output.exit, ExitCode::Code(3));
                assert_eq!(output.stderr.trim(), "oops");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(Runner::checked(&[]), Err(Error::Empty)));
        assert!(matches!(Runner::with_timeout(&[], Duration::from_secs(1)), Err(Error::Empty)));
    }

    #[test]
    fn non_zero_exit_is_data_with_deadline() {
        let args = ["sh", "-c", "echo out; exit 2"];
        let output = Runner::with_timeout(&args, Duration::from_secs(5)).unwrap();
        assert_eq!(output.exit, ExitCode::Code(2));
        assert!(!output.success());
        assert_eq!(output.stdout.trim(), "out");
    }

    #[test]
    fn timeout_keeps_partial_output() {
        let _ = tracing_subscriber::fmt::try_init();

        let start = std::time::Instant::now();
        let output = Runner::with_timeout(
            &["sh", "-c", "echo before; sleep 30; echo after"],
            Duration::from_millis(300),
        )
        .unwrap();

        assert_eq!(output.exit, ExitCode::Timeout);
        assert_eq!(output.stdout.trim(), "before");
        assert!(start.elapsed() < Duration::from_secs(10), "runner did not honour the deadline");
    }

    /// Whether `pid` has exited, counting zombies nobody reaped yet.
    fn exited(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => {
                stat.rsplit(')').next().is_some_and(|rest| rest.trim_start().starts_with('Z'))
            }
            Err(_) => true,
        }
    }

    #[test]
    fn timeout_terminates_the_whole_group() {
        let _ = tracing_subscriber::fmt::try_init();

        let output = Runner::with_timeout(
            &["sh", "-c", "trap 'echo stopping; exit 0' TERM; sleep 30 & echo $!; wait"],
            Duration::from_millis(300),
        )
        .unwrap();
        assert_eq!(output.exit, ExitCode::Timeout);

        let mut lines = output.stdout.lines();
        let sleeper: u32 = lines.next().unwrap().trim().parse().unwrap();
        // The shell got SIGTERM rather than SIGKILL.
        assert_eq!(lines.next(), Some("stopping"));

        let gone = (0..20).any(|_| {
            std::thread::sleep(Duration::from_millis(50));
            exited(sleeper)
        });
        assert!(gone, "background process {sleeper} outlived the deadline");
    }

    #[test]
    fn exit_code_display() {
        assert_eq!(ExitCode::Code(1).to_string(), "exit code 1");
        assert_eq!(ExitCode::Timeout.to_string(), "timeout");
        assert!(ExitCode::Code(0).success());
        assert!(!ExitCode::Signal(9).success());
    }
}
