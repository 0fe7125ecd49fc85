//! Framed message transport over a server's stdio.
//!
//! One serialized writer (server stdin) and one serialized reader (server
//! stdout), plus the stderr side channel for diagnostics. Generic over
//! AsyncRead/AsyncWrite so the same code runs against child pipes and
//! in-memory duplex streams.

use std::io;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::{CodecError, LspCodec, Message};
use crate::error::ClientError;
use crate::side_channel::{SERVER_LOG_TARGET, SideChannel};

/// How long a dead server gets to flush its stderr before we collect it.
const STDERR_SETTLE: Duration = Duration::from_millis(250);

pub type ChildTransport = Transport<ChildStdout, ChildStdin>;

pub struct Transport<R, W> {
    reader: FramedRead<R, LspCodec>,
    writer: FramedWrite<W, LspCodec>,
    side_channel: SideChannel,
    failure_diagnostics: Vec<String>,
}

impl<R, W> Transport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, side_channel: SideChannel) -> Self {
        Self {
            reader: FramedRead::new(reader, LspCodec::new()),
            writer: FramedWrite::new(writer, LspCodec::new()),
            side_channel,
            failure_diagnostics: Vec::new(),
        }
    }

    /// Encode, write and flush one message.
    pub async fn write(&mut self, message: Message) -> Result<(), ClientError> {
        // SinkExt::send flushes before resolving.
        self.writer.send(message).await.map_err(|e| match e {
            CodecError::Io(e) => ClientError::TransportClosed(e),
            other => ClientError::Codec(other),
        })
    }

    /// Read exactly one frame, giving up at `deadline`.
    ///
    /// A timeout leaves any partly received frame buffered; the next read
    /// completes it. On any other failure the stderr collected so far is
    /// logged and kept in [`failure_diagnostics`](Self::failure_diagnostics).
    pub async fn read(&mut self, deadline: Instant) -> Result<Message, ClientError> {
        let started = Instant::now();

        let err = match tokio::time::timeout_at(deadline, self.reader.next()).await {
            Ok(Some(Ok(message))) => {
                tracing::trace!(
                    method = message.label(),
                    id = ?message.id,
                    "Received frame"
                );
                return Ok(message);
            }
            Ok(Some(Err(e))) => read_error(e),
            Ok(None) => ClientError::UnexpectedEof,
            Err(_) => ClientError::Timeout {
                waiting_for: "a frame from the server".to_string(),
                waited: started.elapsed(),
            },
        };

        if err.is_timeout() {
            // Callers may treat a timeout as a normal outcome; stderr stays queued.
            tracing::debug!(error = %err, "Read timed out");
        } else {
            self.side_channel.settle(STDERR_SETTLE).await;
            self.capture_diagnostics(&err);
        }
        Err(err)
    }

    fn capture_diagnostics(&mut self, err: &ClientError) {
        let lines = self.side_channel.drain_now();
        if lines.is_empty() {
            tracing::warn!(error = %err, "Read failed; server wrote nothing to stderr");
            return;
        }

        tracing::warn!(error = %err, lines = lines.len(), "Read failed; server stderr follows");
        for line in &lines {
            tracing::warn!(target: SERVER_LOG_TARGET, "{}", line);
        }
        self.failure_diagnostics.extend(lines);
    }

    /// stderr lines captured at read failures.
    pub fn failure_diagnostics(&self) -> &[String] {
        &self.failure_diagnostics
    }

    /// Everything stderr produced that the caller has not seen yet: lines
    /// captured at failures followed by whatever is still queued.
    pub fn drain_diagnostics(&mut self) -> Vec<String> {
        let mut lines = std::mem::take(&mut self.failure_diagnostics);
        lines.extend(self.side_channel.drain_now());
        lines
    }

    pub fn side_channel_mut(&mut self) -> &mut SideChannel {
        &mut self.side_channel
    }
}

fn read_error(e: CodecError) -> ClientError {
    match e {
        CodecError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => ClientError::UnexpectedEof,
        CodecError::Io(e) => ClientError::TransportClosed(e),
        other => ClientError::Codec(other),
    }
}
