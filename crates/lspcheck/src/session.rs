//! Request/response orchestration on top of a [`Transport`].
//!
//! Requests and their responses are decoupled: [`Session::send_request`]
//! returns the allocated id immediately and [`Session::wait_for_response`]
//! reads the stream until that id comes back. Anything else that arrives in
//! the meantime is handled in place:
//!
//! - notifications are skipped
//! - responses to other ids are kept and handed out by a later wait
//! - server-initiated requests get a `MethodNotFound` error reply so a server
//!   blocking on them does not stall

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::bridge::{Message, MessageKind, ResponseError};
use crate::error::ClientError;
use crate::transport::Transport;

pub struct Session<R, W> {
    transport: Transport<R, W>,
    next_id: i64,
    /// Ids sent whose response no wait has returned yet.
    outstanding: HashSet<i64>,
    pending: HashMap<i64, Message>,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(transport: Transport<R, W>) -> Self {
        Self {
            transport,
            next_id: 1,
            outstanding: HashSet::new(),
            pending: HashMap::new(),
        }
    }

    /// Send a request and return its id without waiting for the response.
    pub async fn send_request(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<i64, ClientError> {
        let id = self.next_id;
        self.next_id += 1;
        self.outstanding.insert(id);

        tracing::debug!(id, method, "Sending request");
        self.transport
            .write(Message::request(id, method, params))
            .await?;
        Ok(id)
    }

    pub async fn send_notification(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), ClientError> {
        tracing::debug!(method, "Sending notification");
        self.transport
            .write(Message::notification(method, params))
            .await
    }

    /// Read exactly one message, whatever it is.
    pub async fn read_one(&mut self, deadline: Instant) -> Result<Message, ClientError> {
        self.transport.read(deadline).await
    }

    /// Wait for the response to request `id`.
    ///
    /// `deadline` bounds the whole wait, not each read. A response already
    /// buffered by an earlier wait is returned without touching the stream.
    pub async fn wait_for_response(
        &mut self,
        id: i64,
        deadline: Instant,
    ) -> Result<Message, ClientError> {
        if let Some(message) = self.pending.remove(&id) {
            tracing::debug!(id, "Response was already buffered");
            self.outstanding.remove(&id);
            return Ok(message);
        }

        let started = Instant::now();
        let waiting_for = || format!("response to request {id}");

        loop {
            // A server streaming notifications back to back never lets the
            // read itself time out.
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout {
                    waiting_for: waiting_for(),
                    waited: started.elapsed(),
                });
            }

            let message = self.read_one(deadline).await.map_err(|e| match e {
                ClientError::Timeout { .. } => ClientError::Timeout {
                    waiting_for: waiting_for(),
                    waited: started.elapsed(),
                },
                other => other,
            })?;

            if message.is_response_to(id) {
                tracing::debug!(id, elapsed = ?started.elapsed(), "Response received");
                self.outstanding.remove(&id);
                return Ok(message);
            }
            self.handle_unsolicited(message).await?;
        }
    }

    /// Wait for a notification named `method`.
    ///
    /// Responses read while waiting are buffered for later waits.
    pub async fn wait_for_notification(
        &mut self,
        method: &str,
        deadline: Instant,
    ) -> Result<Message, ClientError> {
        let started = Instant::now();

        loop {
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout {
                    waiting_for: format!("{method} notification"),
                    waited: started.elapsed(),
                });
            }

            let message = self.read_one(deadline).await.map_err(|e| match e {
                ClientError::Timeout { .. } => ClientError::Timeout {
                    waiting_for: format!("{method} notification"),
                    waited: started.elapsed(),
                },
                other => other,
            })?;

            if message.kind() == MessageKind::Notification
                && message.method.as_deref() == Some(method)
            {
                return Ok(message);
            }
            self.handle_unsolicited(message).await?;
        }
    }

    /// Send a request and wait for its response.
    pub async fn request(
        &mut self,
        method: &str,
        params: Option<Value>,
        deadline: Instant,
    ) -> Result<Message, ClientError> {
        let id = self.send_request(method, params).await?;
        self.wait_for_response(id, deadline).await
    }

    async fn handle_unsolicited(&mut self, message: Message) -> Result<(), ClientError> {
        match message.kind() {
            MessageKind::Notification => {
                tracing::debug!(method = message.label(), "Skipping notification");
            }
            MessageKind::Request => {
                let method = message.label().to_string();
                tracing::debug!(%method, id = ?message.id, "Declining server request");
                if let Some(id) = message.id {
                    let reply =
                        Message::error_response(id, ResponseError::method_not_found(&method));
                    self.transport.write(reply).await?;
                }
            }
            MessageKind::Response => match message.id.as_ref().and_then(|id| id.as_number()) {
                Some(id)
                    if self.outstanding.contains(&id) && !self.pending.contains_key(&id) =>
                {
                    tracing::debug!(id, "Buffering response for a later wait");
                    self.pending.insert(id, message);
                }
                Some(id) if (1..self.next_id).contains(&id) => {
                    tracing::warn!(id, "Dropping repeated response");
                }
                _ => {
                    tracing::warn!(id = ?message.id, "Dropping response to a request never sent");
                }
            },
            MessageKind::Invalid => {
                tracing::warn!(?message, "Dropping message with neither id nor method");
            }
        }
        Ok(())
    }

    /// Number of responses read but not yet claimed by a wait.
    pub fn pending_responses(&self) -> usize {
        self.pending.len()
    }

    /// All stderr output not yet handed to the caller.
    pub fn drain_diagnostics(&mut self) -> Vec<String> {
        self.transport.drain_diagnostics()
    }

    pub fn transport_mut(&mut self) -> &mut Transport<R, W> {
        &mut self.transport
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bridge::RequestId;
    use crate::bridge::protocol::METHOD_NOT_FOUND;
    use crate::testing::duplex_session;
    use serde_json::json;

    fn soon(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    fn response(id: i64, result: Value) -> Message {
        Message::response(RequestId::Number(id), result)
    }

    #[tokio::test]
    async fn request_ids_start_at_one_and_increase() {
        let (mut session, mut server) = duplex_session();

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(session.send_request("workspace/symbol", None).await.unwrap());
        }
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        for expected in 1..=5 {
            let msg = server.recv().await;
            assert_eq!(msg.id, Some(RequestId::Number(expected)));
        }
    }

    #[tokio::test]
    async fn notifications_carry_no_id() {
        let (mut session, mut server) = duplex_session();

        session
            .send_notification("initialized", Some(json!({})))
            .await
            .unwrap();

        let msg = server.recv().await;
        assert_eq!(msg.kind(), MessageKind::Notification);
        assert_eq!(msg.id, None);
        // Notifications do not consume ids.
        assert_eq!(session.send_request("shutdown", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn skips_interleaved_notifications() {
        let (mut session, mut server) = duplex_session();
        let id = session.send_request("initialize", None).await.unwrap();

        server
            .send(Message::notification(
                "window/logMessage",
                Some(json!({"type": 3, "message": "starting"})),
            ))
            .await;
        server
            .send(Message::notification("$/progress", Some(json!({"token": 1}))))
            .await;
        server
            .send(response(
                id,
                json!({"capabilities": {"codeActionProvider": true}}),
            ))
            .await;

        let msg = session.wait_for_response(id, soon(2_000)).await.unwrap();
        assert!(msg.is_response_to(id));
        let result = msg.into_result().unwrap();
        assert_eq!(result["capabilities"]["codeActionProvider"], json!(true));
        assert_eq!(session.pending_responses(), 0);
    }

    #[tokio::test]
    async fn out_of_order_responses_are_buffered_not_lost() {
        let (mut session, mut server) = duplex_session();
        let first = session.send_request("a", None).await.unwrap();
        let second = session.send_request("b", None).await.unwrap();

        server.send(response(second, json!("second"))).await;
        server.send(response(first, json!("first"))).await;

        let msg = session.wait_for_response(first, soon(2_000)).await.unwrap();
        assert_eq!(msg.into_result().unwrap(), json!("first"));
        assert_eq!(session.pending_responses(), 1);

        // Nothing more will ever arrive on the stream.
        server.close();
        let msg = session.wait_for_response(second, soon(2_000)).await.unwrap();
        assert_eq!(msg.into_result().unwrap(), json!("second"));
        assert_eq!(session.pending_responses(), 0);
    }

    #[tokio::test]
    async fn responses_to_unknown_ids_are_dropped() {
        let (mut session, mut server) = duplex_session();
        let id = session.send_request("a", None).await.unwrap();

        server.send(response(99, json!("stray"))).await;
        server.send(response(id, json!("mine"))).await;

        session.wait_for_response(id, soon(2_000)).await.unwrap();
        assert_eq!(session.pending_responses(), 0);
    }

    #[tokio::test]
    async fn responses_to_unsent_or_answered_ids_are_not_buffered() {
        let (mut session, mut server) = duplex_session();
        let first = session.send_request("a", None).await.unwrap();
        server.send(response(first, json!("first"))).await;
        session.wait_for_response(first, soon(2_000)).await.unwrap();

        let next = session.send_request("b", None).await.unwrap();
        server.send(response(0, json!("zero"))).await;
        server.send(response(-7, json!("negative"))).await;
        server.send(response(first, json!("again"))).await;
        server.send(response(next, json!("next"))).await;

        let msg = session.wait_for_response(next, soon(2_000)).await.unwrap();
        assert_eq!(msg.into_result().unwrap(), json!("next"));
        assert_eq!(session.pending_responses(), 0);
    }

    #[tokio::test]
    async fn duplicate_of_a_buffered_response_keeps_the_first() {
        let (mut session, mut server) = duplex_session();
        let first = session.send_request("a", None).await.unwrap();
        let second = session.send_request("b", None).await.unwrap();

        server.send(response(second, json!("original"))).await;
        server.send(response(second, json!("duplicate"))).await;
        server.send(response(first, json!("first"))).await;

        session.wait_for_response(first, soon(2_000)).await.unwrap();
        assert_eq!(session.pending_responses(), 1);
        let msg = session.wait_for_response(second, soon(2_000)).await.unwrap();
        assert_eq!(msg.into_result().unwrap(), json!("original"));
        assert_eq!(session.pending_responses(), 0);
    }

    #[tokio::test]
    async fn times_out_when_no_matching_response() {
        let (mut session, mut server) = duplex_session();
        let id = session.send_request("textDocument/codeAction", None).await.unwrap();
        server.send(Message::notification("window/logMessage", None)).await;

        let started = std::time::Instant::now();
        let err = session.wait_for_response(id, soon(150)).await.unwrap_err();

        assert!(err.is_timeout(), "{err}");
        assert!(err.to_string().contains("response to request 1"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn notification_flood_does_not_defeat_deadline() {
        let (mut session, mut server) = duplex_session();
        let id = session.send_request("initialize", None).await.unwrap();

        let flood = tokio::spawn(async move {
            loop {
                server
                    .send(Message::notification("$/progress", Some(json!({"token": "x"}))))
                    .await;
                tokio::task::yield_now().await;
            }
        });

        let started = std::time::Instant::now();
        let err = session.wait_for_response(id, soon(150)).await.unwrap_err();
        flood.abort();

        assert!(err.is_timeout(), "{err}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn eof_while_waiting_is_unexpected_eof() {
        let (mut session, mut server) = duplex_session();
        let id = session.send_request("initialize", None).await.unwrap();
        server.log("fatal: could not start runtime").await;
        server.close();

        let err = session.wait_for_response(id, soon(2_000)).await.unwrap_err();
        assert!(matches!(err, ClientError::UnexpectedEof), "{err}");
        assert_eq!(
            session.drain_diagnostics(),
            vec!["fatal: could not start runtime"]
        );
    }

    #[tokio::test]
    async fn server_requests_are_declined_and_not_mistaken_for_responses() {
        let (mut session, mut server) = duplex_session();
        let id = session.send_request("initialize", None).await.unwrap();

        // Same numeric id as our request, but it is a request from the server.
        server
            .send(Message::request(id, "workspace/configuration", Some(json!({"items": []}))))
            .await;
        server.send(response(id, json!({"capabilities": {}}))).await;

        let msg = session.wait_for_response(id, soon(2_000)).await.unwrap();
        assert!(msg.method.is_none());

        // Our initialize request went out first, then the decline.
        server.recv().await;
        let reply = server.recv().await;
        assert_eq!(reply.id, Some(RequestId::Number(id)));
        assert_eq!(reply.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn protocol_error_leaves_session_usable() {
        let (mut session, mut server) = duplex_session();

        let failing = session.send_request("textDocument/hover", None).await.unwrap();
        server
            .send(Message::error_response(
                RequestId::Number(failing),
                ResponseError {
                    code: -32602,
                    message: "invalid params".to_string(),
                    data: None,
                },
            ))
            .await;
        let err = session
            .wait_for_response(failing, soon(2_000))
            .await
            .unwrap()
            .into_result()
            .unwrap_err();
        assert_eq!(err.code, -32602);

        let next = session.send_request("shutdown", None).await.unwrap();
        server.send(response(next, Value::Null)).await;
        let msg = session.wait_for_response(next, soon(2_000)).await.unwrap();
        assert_eq!(msg.into_result().unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn wait_for_notification_buffers_responses() {
        let (mut session, mut server) = duplex_session();
        let id = session.send_request("initialize", None).await.unwrap();

        server.send(response(id, json!({"capabilities": {}}))).await;
        server
            .send(Message::notification("language/ready", Some(json!({}))))
            .await;

        let ready = session
            .wait_for_notification("language/ready", soon(2_000))
            .await
            .unwrap();
        assert_eq!(ready.method.as_deref(), Some("language/ready"));
        assert_eq!(session.pending_responses(), 1);
        assert!(session.wait_for_response(id, soon(100)).await.is_ok());
    }

    #[tokio::test]
    async fn wait_for_notification_times_out() {
        let (mut session, _server) = duplex_session();
        let err = session
            .wait_for_notification("language/ready", soon(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("language/ready notification"), "{err}");
    }
}
