//! Scriptable stdio language server used by the integration tests.
//!
//! Speaks just enough of the protocol to drive the code-action scenario, with
//! flags to make it misbehave in the ways real servers do.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{Stdin, Stdout};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use lspcheck::bridge::{LspCodec, Message, MessageKind, RequestId, ResponseError};
use lspcheck::logging::init_tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Actions {
    /// Two actions, one titled "Evaluate Line".
    Evaluate,
    Empty,
    /// Answer code actions with an internal error.
    Error,
    /// Answer code actions with `null`.
    Null,
}

#[derive(Parser, Debug)]
#[command(name = "lspcheck-mock-server")]
struct Args {
    /// Accepted for command-line compatibility with real servers.
    #[arg(long, default_value = "lsp")]
    mode: String,

    #[arg(long, value_enum, default_value = "evaluate")]
    actions: Actions,

    /// Leave codeActionProvider out of the initialize result.
    #[arg(long)]
    no_code_action_provider: bool,

    /// window/logMessage notifications to send before every response.
    #[arg(long, default_value_t = 0)]
    noise: usize,

    /// Notification to send once a document is opened.
    #[arg(long)]
    ready_notification: Option<String>,

    /// Milliseconds to wait after didOpen before sending the ready notification.
    #[arg(long, default_value_t = 0)]
    ready_delay_ms: u64,

    /// Ask the client for workspace/configuration before answering initialize.
    #[arg(long)]
    server_request: bool,

    /// Exit with status 101 on receiving this method.
    #[arg(long)]
    crash_on: Option<String>,

    /// Keep running on SIGTERM.
    #[arg(long)]
    ignore_sigterm: bool,

    /// Log the value of this environment variable at startup.
    #[arg(long)]
    echo_env: Option<String>,
}

type Reader = FramedRead<Stdin, LspCodec>;
type Writer = FramedWrite<Stdout, LspCodec>;

struct MockServer {
    args: Args,
    writer: Writer,
}

impl MockServer {
    async fn send(&mut self, message: Message) -> Result<()> {
        self.writer
            .send(message)
            .await
            .context("failed to write to stdout")
    }

    async fn respond(
        &mut self,
        id: RequestId,
        result: Result<Value, ResponseError>,
    ) -> Result<()> {
        for i in 0..self.args.noise {
            self.send(Message::notification(
                "window/logMessage",
                Some(json!({"type": 4, "message": format!("noise {i}")})),
            ))
            .await?;
        }

        let reply = match result {
            Ok(value) => Message::response(id, value),
            Err(e) => Message::error_response(id, e),
        };
        self.send(reply).await
    }

    fn capabilities(&self) -> Value {
        let mut capabilities = json!({
            "textDocumentSync": 1,
            "executeCommandProvider": {"commands": ["mock.evaluate"]},
        });
        if !self.args.no_code_action_provider {
            capabilities["codeActionProvider"] = json!({"codeActionKinds": ["source"]});
        }
        capabilities
    }

    fn code_actions(&self) -> Result<Value, ResponseError> {
        match self.args.actions {
            Actions::Evaluate => Ok(json!([
                {"title": "Evaluate Line", "kind": "source", "command": {
                    "title": "Evaluate Line",
                    "command": "mock.evaluate",
                }},
                {"title": "Format Document", "kind": "source.format"},
            ])),
            Actions::Empty => Ok(json!([])),
            Actions::Null => Ok(Value::Null),
            Actions::Error => Err(ResponseError {
                code: -32603,
                message: "code actions unavailable".to_string(),
                data: None,
            }),
        }
    }

    /// Returns false once the client asked us to exit.
    async fn handle(&mut self, message: Message) -> Result<bool> {
        if let (Some(method), Some(crash_on)) = (&message.method, &self.args.crash_on)
            && method == crash_on
        {
            error!(%method, "crashing on request");
            std::process::exit(101);
        }

        match message.kind() {
            MessageKind::Request => {
                let (Some(id), Some(method)) = (message.id, message.method) else {
                    return Ok(true);
                };
                debug!(%method, %id, "Request");
                match method.as_str() {
                    "initialize" => {
                        if self.args.server_request {
                            self.send(Message {
                                id: Some(RequestId::String("mock-config-1".to_string())),
                                ..Message::notification(
                                    "workspace/configuration",
                                    Some(json!({"items": [{"section": "mock"}]})),
                                )
                            })
                            .await?;
                        }
                        let result = json!({
                            "capabilities": self.capabilities(),
                            "serverInfo": {"name": "lspcheck-mock-server"},
                        });
                        self.respond(id, Ok(result)).await?;
                    }
                    "textDocument/codeAction" => {
                        let actions = self.code_actions();
                        self.respond(id, actions).await?;
                    }
                    "shutdown" => self.respond(id, Ok(Value::Null)).await?,
                    other => {
                        let err = ResponseError {
                            code: lspcheck::bridge::protocol::METHOD_NOT_FOUND,
                            message: format!("unhandled method: {other}"),
                            data: None,
                        };
                        self.respond(id, Err(err)).await?;
                    }
                }
            }
            MessageKind::Notification => match message.label() {
                "exit" => return Ok(false),
                "textDocument/didOpen" => {
                    info!("Document opened");
                    if let Some(method) = self.args.ready_notification.clone() {
                        tokio::time::sleep(Duration::from_millis(self.args.ready_delay_ms)).await;
                        self.send(Message::notification(method, None)).await?;
                    }
                }
                other => debug!(method = other, "Notification"),
            },
            MessageKind::Response => match message.error {
                Some(e) => info!(id = ?message.id, code = e.code, "Client declined request"),
                None => info!(id = ?message.id, "Client answered request"),
            },
            MessageKind::Invalid => warn!(?message, "Invalid message"),
        }
        Ok(true)
    }
}

#[cfg(unix)]
fn ignore_sigterm() -> Result<()> {
    use nix::sys::signal::{SigHandler, Signal, signal};

    // SAFETY: SIG_IGN installs no handler code; nothing else in this process
    // manages SIGTERM.
    unsafe { signal(Signal::SIGTERM, SigHandler::SigIgn) }.context("failed to ignore SIGTERM")?;
    Ok(())
}

#[cfg(not(unix))]
fn ignore_sigterm() -> Result<()> {
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(false);

    if args.ignore_sigterm {
        ignore_sigterm()?;
    }
    if let Some(name) = &args.echo_env {
        let value = std::env::var(name).unwrap_or_default();
        info!("{name}={value}");
    }
    info!(mode = %args.mode, actions = ?args.actions, "Mock server started");

    let mut reader: Reader = FramedRead::new(tokio::io::stdin(), LspCodec::new());
    let mut server = MockServer {
        args,
        writer: FramedWrite::new(tokio::io::stdout(), LspCodec::new()),
    };

    while let Some(frame) = reader.next().await {
        let message = frame.context("failed to decode frame")?;
        if !server.handle(message).await? {
            info!("Exit requested");
            return Ok(());
        }
    }

    info!("stdin closed");
    Ok(())
}
