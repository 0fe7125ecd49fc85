//! lspcheck: a conformance test client for language servers speaking
//! JSON-RPC over stdio.
//!
//! Layers, bottom up:
//! - [`bridge`]: `Content-Length` framing and JSON-RPC message types
//! - [`transport`]: one framed reader and writer over a server's stdio
//! - [`side_channel`]: background drain of the server's stderr
//! - [`session`]: request ids and response correlation
//! - [`supervisor`]: spawning and stopping the server process
//! - [`client`]: all of the above for one server
//! - [`scenario`]: the code-action conformance run

pub mod bridge;
pub mod client;
mod error;
pub mod logging;
pub mod scenario;
pub mod session;
pub mod side_channel;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod testing;

pub use bridge::{CodecError, Message, MessageKind, RequestId, ResponseError};
pub use client::{Client, Shutdown};
pub use error::ClientError;
pub use scenario::{
    ActionRange, CodeActionScenario, Readiness, ScenarioConfig, ScenarioError, ScenarioReport,
};
pub use session::Session;
pub use supervisor::{LaunchConfig, ProcessState, ProcessSupervisor, StopOutcome};
