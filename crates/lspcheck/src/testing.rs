//! In-memory server harness for unit tests.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::{LspCodec, Message};
use crate::session::Session;
use crate::side_channel::SideChannel;
use crate::transport::Transport;

const PIPE_CAPACITY: usize = 64 * 1024;

pub type DuplexTransport = Transport<DuplexStream, DuplexStream>;
pub type DuplexSession = Session<DuplexStream, DuplexStream>;

/// The far end of a duplex transport, playing the language server.
pub struct FakeServer {
    reader: FramedRead<DuplexStream, LspCodec>,
    writer: Option<FramedWrite<DuplexStream, LspCodec>>,
    stderr: Option<DuplexStream>,
}

impl FakeServer {
    /// Next message the client wrote. Panics if the client hung up.
    pub async fn recv(&mut self) -> Message {
        self.reader
            .next()
            .await
            .expect("client closed its output")
            .expect("client sent an undecodable frame")
    }

    pub async fn send(&mut self, message: Message) {
        self.writer_mut()
            .send(message)
            .await
            .expect("client stopped reading");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let stream = self.writer_mut().get_mut();
        stream.write_all(bytes).await.expect("client stopped reading");
        stream.flush().await.expect("flush failed");
    }

    /// Write one line to the server's stderr.
    pub async fn log(&mut self, line: &str) {
        let stderr = self.stderr();
        stderr
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("stderr closed");
    }

    pub fn stderr(&mut self) -> &mut DuplexStream {
        self.stderr.as_mut().expect("stderr already closed")
    }

    /// Close stdout only; stderr stays open.
    pub fn close_stdout(&mut self) {
        self.writer = None;
    }

    /// Close stdout and stderr, as a crashing server would.
    pub fn close(&mut self) {
        self.writer = None;
        self.stderr = None;
    }

    fn writer_mut(&mut self) -> &mut FramedWrite<DuplexStream, LspCodec> {
        self.writer.as_mut().expect("server output already closed")
    }
}

pub fn duplex_transport() -> (DuplexTransport, FakeServer) {
    let (client_out, server_in) = tokio::io::duplex(PIPE_CAPACITY);
    let (server_out, client_in) = tokio::io::duplex(PIPE_CAPACITY);
    let (server_err, client_err) = tokio::io::duplex(PIPE_CAPACITY);

    let transport = Transport::new(client_in, client_out, SideChannel::spawn(client_err));
    let server = FakeServer {
        reader: FramedRead::new(server_in, LspCodec::new()),
        writer: Some(FramedWrite::new(server_out, LspCodec::new())),
        stderr: Some(server_err),
    };
    (transport, server)
}

pub fn duplex_session() -> (DuplexSession, FakeServer) {
    let (transport, server) = duplex_transport();
    (Session::new(transport), server)
}
