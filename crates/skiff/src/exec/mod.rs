//! Process execution.
//!
//! The lifecycle manager never spawns processes itself. It hands a
//! [`SpawnRequest`] to an [`IsolationRuntime`] and gets back a pid plus a
//! one-shot [`ExitWaiter`] that resolves when the process is reaped.

#[cfg(target_os = "linux")]
pub mod native;
pub mod rootfs;

use std::path::PathBuf;

use async_trait::async_trait;
use skiff_common::{ContainerId, SkiffError, SkiffResult};
use tokio::sync::oneshot;

use crate::isolation::{IsolationConfig, NamespaceJoin};

#[cfg(target_os = "linux")]
pub use native::NativeRuntime;

/// Resolves once with the termination status of a spawned process.
pub type ExitWaiter = oneshot::Receiver<ExitStatus>;

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal exit with a status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(i32),
    /// The process could not be reaped.
    Lost(String),
}

impl ExitStatus {
    /// Exit code recorded for a lost process.
    pub const LOST_EXIT_CODE: i64 = -1;

    /// Exit code as recorded on the container.
    ///
    /// Signal terminations are reported as `128 + signal`.
    #[must_use]
    pub fn exit_code(&self) -> i64 {
        match self {
            Self::Exited(code) => i64::from(*code),
            Self::Signaled(signal) => 128 + i64::from(*signal),
            Self::Lost(_) => Self::LOST_EXIT_CODE,
        }
    }

    /// Returns true if the process was reaped normally.
    #[must_use]
    pub const fn was_reaped(&self) -> bool {
        !matches!(self, Self::Lost(_))
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(signal)) => Self::Signaled(signal),
            (None, None) => Self::Lost(format!("unexpected wait status: {status}")),
        }
    }
}

/// Where a container's output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdioMode {
    /// Share the caller's stdout and stderr.
    Inherit,
    /// Append to log files.
    Log {
        /// Standard output log.
        stdout: PathBuf,
        /// Standard error log.
        stderr: PathBuf,
    },
}

/// Everything needed to launch one container process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Container the process belongs to.
    pub container_id: ContainerId,
    /// Root filesystem to pivot into.
    pub rootfs: PathBuf,
    /// Executable and arguments.
    pub args: Vec<String>,
    /// Environment (`KEY=VALUE`).
    pub env: Vec<String>,
    /// Working directory inside the rootfs.
    pub working_dir: String,
    /// Namespace and security settings.
    pub isolation: IsolationConfig,
    /// Namespaces of other processes to enter.
    pub joins: Vec<NamespaceJoin>,
    /// Output routing.
    pub stdio: StdioMode,
}

/// A launched process.
#[derive(Debug)]
pub struct SpawnedProcess {
    /// Host pid.
    pub pid: u32,
    /// Resolves when the process is reaped.
    pub exit: ExitWaiter,
}

/// The OS isolation primitive the lifecycle manager drives.
#[async_trait]
pub trait IsolationRuntime: Send + Sync {
    /// Launch a process inside the requested isolation.
    ///
    /// Returns once the process exists; errors mean no process was left
    /// behind.
    async fn spawn(&self, request: SpawnRequest) -> SkiffResult<SpawnedProcess>;

    /// Deliver `signal` to `pid`. A process that is already gone is not an error.
    fn signal(&self, pid: u32, signal: i32) -> SkiffResult<()>;

    /// Deliver `SIGKILL` to `pid`.
    fn kill(&self, pid: u32) -> SkiffResult<()> {
        self.signal(pid, libc::SIGKILL)
    }
}

/// Returns true if a process with `pid` exists.
#[must_use]
pub fn process_exists(pid: u32) -> bool {
    let Some(pid) = i32::try_from(pid).ok().and_then(rustix::process::Pid::from_raw) else {
        return false;
    };
    match rustix::process::test_kill_process(pid) {
        Ok(()) => true,
        Err(err) => err == rustix::io::Errno::PERM,
    }
}

/// Parse a signal given as `SIGTERM`, `TERM` or `15`.
///
/// # Errors
///
/// Returns [`SkiffError::Validation`] for unknown names and out-of-range numbers.
pub fn parse_signal(value: &str) -> SkiffResult<i32> {
    if let Ok(number) = value.parse::<i32>() {
        if (1..=64).contains(&number) {
            return Ok(number);
        }
        return Err(SkiffError::validation(format!("invalid signal: {value}")));
    }

    let upper = value.to_ascii_uppercase();
    let name = upper.strip_prefix("SIG").unwrap_or(&upper);
    let signal = match name {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "KILL" => libc::SIGKILL,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "TERM" => libc::SIGTERM,
        "STOP" => libc::SIGSTOP,
        "CONT" => libc::SIGCONT,
        "ALRM" => libc::SIGALRM,
        "WINCH" => libc::SIGWINCH,
        _ => return Err(SkiffError::validation(format!("invalid signal: {value}"))),
    };

    Ok(signal)
}
