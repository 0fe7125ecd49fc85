//! Server process lifecycle.
//!
//! State machine: `NotStarted → Running → Stopping → Stopped`. Stopping is
//! graceful-then-forced: SIGTERM, wait up to the grace period, then SIGKILL.
//! Needing the kill is an expected outcome, not an error.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::error::ClientError;

/// How long to wait for the kernel to reap a SIGKILLed child.
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Added on top of the inherited environment.
    pub envs: Vec<(OsString, OsString)>,
    pub current_dir: Option<PathBuf>,
}

impl LaunchConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
        }
    }

    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running.
    NotRunning,
    /// The process had already exited on its own.
    AlreadyExited(ExitStatus),
    /// Exited within the grace period after SIGTERM.
    Terminated(ExitStatus),
    /// Needed SIGKILL. `None` if the exit could not be confirmed in time.
    Killed(Option<ExitStatus>),
}

/// The three stdio pipes of a freshly started server.
pub struct ServerPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

pub struct ProcessSupervisor {
    config: LaunchConfig,
    state: ProcessState,
    child: Option<Child>,
}

impl ProcessSupervisor {
    pub fn new(config: LaunchConfig) -> Self {
        Self {
            config,
            state: ProcessState::NotStarted,
            child: None,
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// Spawn the server. A supervisor starts at most once.
    pub fn start(&mut self) -> Result<ServerPipes, ClientError> {
        if self.state != ProcessState::NotStarted {
            return Err(ClientError::AlreadyStarted);
        }

        let program = self.config.program.display().to_string();
        let spawn_failure = |source: std::io::Error| ClientError::SpawnFailure {
            program: program.clone(),
            source,
        };

        let mut child = self.config.command().spawn().map_err(spawn_failure)?;

        let missing =
            |pipe: &str| spawn_failure(std::io::Error::other(format!("{pipe} not captured")));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        tracing::info!(
            program = %program,
            args = ?self.config.args,
            pid = child.id(),
            "Spawned server process"
        );

        self.child = Some(child);
        self.state = ProcessState::Running;
        Ok(ServerPipes {
            stdin,
            stdout,
            stderr,
        })
    }

    /// Stop the server: SIGTERM, up to `grace` to exit, then SIGKILL.
    ///
    /// Idempotent. Always leaves a started supervisor `Stopped`.
    pub async fn stop(&mut self, grace: Duration) -> StopOutcome {
        let Some(mut child) = self.child.take() else {
            if self.state != ProcessState::NotStarted {
                self.state = ProcessState::Stopped;
            }
            return StopOutcome::NotRunning;
        };

        self.state = ProcessState::Stopping;
        let outcome = shutdown_child(&mut child, grace).await;
        self.state = ProcessState::Stopped;
        tracing::info!(?outcome, "Server process stopped");
        outcome
    }
}

async fn shutdown_child(child: &mut Child, grace: Duration) -> StopOutcome {
    if let Ok(Some(status)) = child.try_wait() {
        return StopOutcome::AlreadyExited(status);
    }

    if send_sigterm(child) {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => return StopOutcome::Terminated(status),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "wait failed after SIGTERM");
            }
            Err(_) => {
                tracing::warn!(?grace, "Server did not exit within grace period");
            }
        }
    }

    tracing::warn!(pid = child.id(), "Sending SIGKILL");
    if let Err(e) = child.start_kill() {
        tracing::error!(error = %e, "SIGKILL failed");
    }

    match tokio::time::timeout(KILL_CONFIRM_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => StopOutcome::Killed(Some(status)),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "wait failed after SIGKILL");
            StopOutcome::Killed(None)
        }
        Err(_) => {
            tracing::error!("Server exit not confirmed after SIGKILL");
            StopOutcome::Killed(None)
        }
    }
}

/// Returns true if a graceful termination request was delivered.
#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    tracing::debug!(pid, "Sending SIGTERM");
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(pid, error = %e, "SIGTERM failed");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}
