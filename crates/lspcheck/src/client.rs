//! One server process with a session attached.

use std::time::Duration;

use tokio::process::{ChildStdin, ChildStdout};

use crate::error::ClientError;
use crate::session::Session;
use crate::side_channel::SideChannel;
use crate::supervisor::{LaunchConfig, ProcessSupervisor, StopOutcome};
use crate::transport::Transport;

/// How long stderr gets to reach EOF once the process is gone.
const SHUTDOWN_STDERR_SETTLE: Duration = Duration::from_millis(500);

pub type ChildSession = Session<ChildStdout, ChildStdin>;

/// Result of [`Client::shutdown`].
#[derive(Debug)]
pub struct Shutdown {
    pub outcome: StopOutcome,
    /// stderr lines the caller had not drained yet.
    pub stderr: Vec<String>,
}

/// A running server wired to a [`Session`].
///
/// The process is spawned with `kill_on_drop`, so dropping a `Client` without
/// calling [`shutdown`](Self::shutdown) still reaps it, just without the
/// graceful phase.
pub struct Client {
    supervisor: ProcessSupervisor,
    session: ChildSession,
}

impl Client {
    /// Spawn the server and attach a session. Must be called within a tokio
    /// runtime (the stderr drain is a spawned task).
    pub fn launch(config: LaunchConfig) -> Result<Self, ClientError> {
        let mut supervisor = ProcessSupervisor::new(config);
        let pipes = supervisor.start()?;

        let side_channel = SideChannel::spawn(pipes.stderr);
        let transport = Transport::new(pipes.stdout, pipes.stdin, side_channel);

        Ok(Self {
            supervisor,
            session: Session::new(transport),
        })
    }

    pub fn session(&mut self) -> &mut ChildSession {
        &mut self.session
    }

    pub fn pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    /// Stop the server and collect whatever it still had to say on stderr.
    pub async fn shutdown(mut self, grace: Duration) -> Shutdown {
        let outcome = self.supervisor.stop(grace).await;

        let side_channel = self.session.transport_mut().side_channel_mut();
        side_channel.settle(SHUTDOWN_STDERR_SETTLE).await;
        let stderr = self.session.drain_diagnostics();

        tracing::debug!(?outcome, stderr_lines = stderr.len(), "Client shut down");
        Shutdown { outcome, stderr }
    }
}
