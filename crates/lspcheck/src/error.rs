use std::io;
use std::time::Duration;

use crate::bridge::CodecError;

/// Failures of the transport, session and process layers.
///
/// Every variant leaves the session in a state that should not be trusted
/// further; none of them is retried. Protocol-level errors returned by the
/// server are not represented here, see [`crate::bridge::ResponseError`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("timed out after {waited:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: String,
        waited: Duration,
    },

    #[error("server closed its output stream")]
    UnexpectedEof,

    #[error("server input stream closed: {0}")]
    TransportClosed(#[source] io::Error),

    #[error("failed to spawn {program}: {source}")]
    SpawnFailure {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("server process already started")]
    AlreadyStarted,
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
