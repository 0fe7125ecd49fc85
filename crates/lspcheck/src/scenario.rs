//! Code-action conformance scenario.
//!
//! Negotiates capabilities, opens one document, waits for the server to be
//! ready and asks for code actions over a range, then checks that an action
//! with the expected title comes back.

use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::bridge::ResponseError;
use crate::error::ClientError;
use crate::session::Session;

/// `CodeActionTriggerKind.Invoked`
const TRIGGER_KIND_INVOKED: u8 = 1;

/// How the scenario decides the server is ready to answer code actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Immediate,
    Delay(Duration),
    /// Wait for a notification with this method. If none arrives within
    /// `timeout`, log a warning and carry on.
    Notification { method: String, timeout: Duration },
}

impl Default for Readiness {
    fn default() -> Self {
        Self::Delay(Duration::from_secs(15))
    }
}

/// Zero-based range the code actions are requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionRange {
    pub line: u32,
    pub start_character: u32,
    pub end_character: u32,
}

impl Default for ActionRange {
    fn default() -> Self {
        Self {
            line: 6,
            start_character: 0,
            end_character: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    pub document_uri: String,
    pub document_text: String,
    pub language_id: String,
    pub root_uri: Option<String>,
    pub process_id: Option<u32>,
    pub range: ActionRange,
    /// Substring an action title must contain to count as a match.
    pub expected_title: String,
    /// Bounds each individual response wait.
    pub timeout: Duration,
    pub readiness: Readiness,
}

impl ScenarioConfig {
    pub fn new(document_uri: impl Into<String>, document_text: impl Into<String>) -> Self {
        Self {
            document_uri: document_uri.into(),
            document_text: document_text.into(),
            language_id: "supercollider".to_string(),
            root_uri: None,
            process_id: Some(std::process::id()),
            range: ActionRange::default(),
            expected_title: "Evaluate".to_string(),
            timeout: Duration::from_secs(60),
            readiness: Readiness::default(),
        }
    }

    pub fn with_language_id(mut self, language_id: impl Into<String>) -> Self {
        self.language_id = language_id.into();
        self
    }

    pub fn with_root_uri(mut self, root_uri: impl Into<String>) -> Self {
        self.root_uri = Some(root_uri.into());
        self
    }

    pub fn with_range(mut self, range: ActionRange) -> Self {
        self.range = range;
        self
    }

    pub fn with_expected_title(mut self, title: impl Into<String>) -> Self {
        self.expected_title = title.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("{method} failed: {error}")]
    Rpc {
        method: &'static str,
        #[source]
        error: ResponseError,
    },

    #[error("server does not advertise {0}")]
    MissingCapability(&'static str),

    #[error("unexpected result: {0}")]
    UnexpectedResult(String),

    #[error("no code actions returned")]
    NoActions,

    #[error("no action with a title containing {0:?}")]
    ActionNotFound(String),

    #[error("matching action has no {0:?} field")]
    MissingField(&'static str),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl ScenarioError {
    /// True if the server connection itself failed, as opposed to the server
    /// answering with something non-conformant.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Client(_))
    }
}

#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub capabilities: Value,
    pub execute_commands: Vec<String>,
    pub actions: Vec<Value>,
    pub matched: Value,
    pub initialize_elapsed: Duration,
    pub code_action_elapsed: Duration,
}

pub struct CodeActionScenario {
    config: ScenarioConfig,
}

impl CodeActionScenario {
    pub fn new(config: ScenarioConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    pub async fn run<R, W>(
        &self,
        session: &mut Session<R, W>,
    ) -> Result<ScenarioReport, ScenarioError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let started = Instant::now();
        let capabilities = self.initialize(session).await?;
        let initialize_elapsed = started.elapsed();

        let execute_commands = check_capabilities(&capabilities)?;

        session.send_notification("initialized", Some(json!({}))).await?;
        tracing::info!("Sent initialized notification");

        session
            .send_notification("textDocument/didOpen", Some(self.did_open_params()))
            .await?;
        tracing::info!(uri = %self.config.document_uri, "Opened document");

        self.await_readiness(session).await?;

        let started = Instant::now();
        let actions = self.request_code_actions(session).await?;
        let code_action_elapsed = started.elapsed();
        tracing::info!(
            count = actions.len(),
            elapsed = ?code_action_elapsed,
            "Code actions received"
        );

        let matched = find_action(&actions, &self.config.expected_title)?.clone();
        tracing::info!(
            title = %matched["title"],
            kind = %matched["kind"],
            "Found expected action"
        );

        Ok(ScenarioReport {
            capabilities,
            execute_commands,
            actions,
            matched,
            initialize_elapsed,
            code_action_elapsed,
        })
    }

    async fn initialize<R, W>(&self, session: &mut Session<R, W>) -> Result<Value, ScenarioError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        tracing::info!("Sending initialize request");
        let response = session
            .request(
                "initialize",
                Some(self.initialize_params()),
                self.deadline(),
            )
            .await?;

        let mut result = response
            .into_result()
            .map_err(|error| ScenarioError::Rpc {
                method: "initialize",
                error,
            })?;
        tracing::info!("Initialize succeeded");

        Ok(result
            .get_mut("capabilities")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    async fn await_readiness<R, W>(
        &self,
        session: &mut Session<R, W>,
    ) -> Result<(), ScenarioError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match &self.config.readiness {
            Readiness::Immediate => {}
            Readiness::Delay(delay) => {
                tracing::info!(?delay, "Waiting for server to become ready");
                tokio::time::sleep(*delay).await;
            }
            Readiness::Notification { method, timeout } => {
                tracing::info!(%method, ?timeout, "Waiting for readiness notification");
                match session
                    .wait_for_notification(method, Instant::now() + *timeout)
                    .await
                {
                    Ok(_) => tracing::info!(%method, "Server reported ready"),
                    Err(e) if e.is_timeout() => {
                        tracing::warn!(
                            %method,
                            ?timeout,
                            "No readiness notification; proceeding"
                        );
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    async fn request_code_actions<R, W>(
        &self,
        session: &mut Session<R, W>,
    ) -> Result<Vec<Value>, ScenarioError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let range = self.config.range;
        tracing::info!(line = range.line, "Requesting code actions");

        let response = session
            .request(
                "textDocument/codeAction",
                Some(self.code_action_params()),
                self.deadline(),
            )
            .await?;

        let result = response
            .into_result()
            .map_err(|error| ScenarioError::Rpc {
                method: "textDocument/codeAction",
                error,
            })?;

        match result {
            Value::Array(actions) if actions.is_empty() => Err(ScenarioError::NoActions),
            Value::Array(actions) => Ok(actions),
            other => Err(ScenarioError::UnexpectedResult(format!(
                "expected an array of code actions, got {}",
                json_type(&other)
            ))),
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.timeout
    }

    fn initialize_params(&self) -> Value {
        json!({
            "processId": self.config.process_id,
            "rootUri": self.config.root_uri,
            "capabilities": {
                "textDocument": {
                    "codeAction": {
                        "codeActionLiteralSupport": {
                            "codeActionKind": {
                                "valueSet": ["source", "quickfix", "refactor"]
                            }
                        }
                    }
                }
            }
        })
    }

    fn did_open_params(&self) -> Value {
        json!({
            "textDocument": {
                "uri": self.config.document_uri,
                "languageId": self.config.language_id,
                "version": 1,
                "text": self.config.document_text,
            }
        })
    }

    fn code_action_params(&self) -> Value {
        let range = self.config.range;
        json!({
            "textDocument": {"uri": self.config.document_uri},
            "range": {
                "start": {"line": range.line, "character": range.start_character},
                "end": {"line": range.line, "character": range.end_character},
            },
            "context": {
                "diagnostics": [],
                "triggerKind": TRIGGER_KIND_INVOKED,
            }
        })
    }
}

/// Require a code action provider; report execute commands if any.
fn check_capabilities(capabilities: &Value) -> Result<Vec<String>, ScenarioError> {
    let provider = &capabilities["codeActionProvider"];
    if !is_truthy(provider) {
        return Err(ScenarioError::MissingCapability("codeActionProvider"));
    }
    tracing::info!(code_action_provider = %provider, "Server has codeActionProvider");

    let execute = &capabilities["executeCommandProvider"];
    if !is_truthy(execute) {
        tracing::warn!("Server does not advertise executeCommandProvider");
        return Ok(Vec::new());
    }

    let commands: Vec<String> = execute["commands"]
        .as_array()
        .map(|commands| {
            commands
                .iter()
                .filter_map(|c| c.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    tracing::info!(count = commands.len(), "Server has executeCommandProvider");
    for command in &commands {
        tracing::debug!(%command, "Advertised command");
    }
    Ok(commands)
}

/// The last action whose title contains `expected`, checked for the fields a
/// client needs to present it.
fn find_action<'a>(actions: &'a [Value], expected: &str) -> Result<&'a Value, ScenarioError> {
    let mut matched = None;
    for action in actions {
        let title = action["title"].as_str().unwrap_or_default();
        tracing::info!(title, kind = %action["kind"], "Action");
        tracing::debug!(%action, "Full action");
        if title.contains(expected) {
            matched = Some(action);
        }
    }

    let action = matched.ok_or_else(|| ScenarioError::ActionNotFound(expected.to_string()))?;
    for field in ["title", "kind"] {
        if action.get(field).is_none() {
            return Err(ScenarioError::MissingField(field));
        }
    }
    Ok(action)
}

/// JSON truthiness: `null`, `false`, zero, and empty strings, arrays and
/// objects are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
