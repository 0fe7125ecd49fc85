//! Background drain of the server's stderr.
//!
//! stderr is free-form diagnostic text. If nobody reads it, a chatty server
//! fills the pipe and blocks on its next write, which looks like a hang on
//! the protocol stream. The drain task reads it continuously into an
//! unbounded queue so it can be inspected later, typically after a failure.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Log target for server stderr lines.
pub const SERVER_LOG_TARGET: &str = "lspcheck::server";

/// Queue of stderr lines filled by a background task.
pub struct SideChannel {
    rx: mpsc::UnboundedReceiver<String>,
    task: Option<JoinHandle<()>>,
}

impl SideChannel {
    /// Start draining `stream`. Must be called within a tokio runtime.
    pub fn spawn<R>(stream: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(drain_lines(stream, tx));
        Self {
            rx,
            task: Some(task),
        }
    }

    /// Take every line buffered so far, oldest first. Never blocks.
    pub fn drain_now(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = self.rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    /// True once the stream hit EOF (or a read error) and the task exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Give the drain task up to `wait` to reach EOF.
    ///
    /// Used after the server died: its last words on stderr may still be in
    /// the pipe when stdout reports EOF.
    pub async fn settle(&mut self, wait: Duration) {
        if let Some(task) = self.task.as_mut()
            && tokio::time::timeout(wait, task).await.is_ok()
        {
            self.task = None;
        }
    }
}

async fn drain_lines<R>(stream: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                tracing::trace!(target: SERVER_LOG_TARGET, "{}", line);
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "stderr drain stopped on read error");
                break;
            }
        }
    }

    tracing::trace!("stderr drain exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn drains_lines_in_order() {
        let (mut server, client) = tokio::io::duplex(64);
        let mut channel = SideChannel::spawn(client);

        server
            .write_all(b"first\nsecond\r\nthird without newline")
            .await
            .unwrap();
        drop(server);

        channel.settle(Duration::from_secs(2)).await;
        assert!(channel.is_finished());
        assert_eq!(
            channel.drain_now(),
            vec!["first", "second", "third without newline"]
        );
        assert!(channel.drain_now().is_empty());
    }

    #[tokio::test]
    async fn drain_now_does_not_block_on_open_stream() {
        let (_server, client) = tokio::io::duplex(64);
        let mut channel = SideChannel::spawn(client);

        assert!(channel.drain_now().is_empty());
        assert!(!channel.is_finished());
    }

    #[tokio::test]
    async fn writer_is_never_blocked_by_slow_consumer() {
        // Far more output than the pipe buffer holds; the writer only
        // finishes if the drain keeps consuming without us reading the queue.
        let (mut server, client) = tokio::io::duplex(256);
        let mut channel = SideChannel::spawn(client);

        let writer = tokio::spawn(async move {
            for i in 0..2_000 {
                server
                    .write_all(format!("diagnostic line {i}\n").as_bytes())
                    .await
                    .unwrap();
            }
        });

        tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .expect("writer stalled")
            .unwrap();

        channel.settle(Duration::from_secs(2)).await;
        let lines = channel.drain_now();
        assert_eq!(lines.len(), 2_000);
        assert_eq!(lines[1_999], "diagnostic line 1999");
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_stop_the_drain() {
        let (mut server, client) = tokio::io::duplex(64);
        let mut channel = SideChannel::spawn(client);

        server.write_all(b"bad \xff byte\nnext\n").await.unwrap();
        drop(server);

        channel.settle(Duration::from_secs(2)).await;
        let lines = channel.drain_now();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "next");
    }
}
