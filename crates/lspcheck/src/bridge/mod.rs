//! Wire layer between the client and a language server's stdio.
//!
//! - **protocol**: JSON-RPC message types
//! - **codec**: `Content-Length` framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;

pub use codec::{CodecError, LspCodec};
pub use protocol::{Message, MessageKind, RequestId, ResponseError};
