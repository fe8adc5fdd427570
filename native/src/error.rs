// Error taxonomy shared by the transport, the RPC engine and the overlay session.

use std::io;
use thiserror::Error;

use crate::ipc::protocol::{codes, RpcError};

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Transport closed")]
    TransportClosed,
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Handle lifecycle violation: {0}")]
    HandleLifecycleViolation(String),
    #[error("Call '{method}' timed out after {timeout_ms}ms")]
    RpcTimeout { method: String, timeout_ms: u64 },
    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("Collaborator error: {0}")]
    Collaborator(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    /// Map an I/O failure on a pipe to the transport taxonomy.
    ///
    /// End-of-stream and broken pipes mean the peer went away; everything
    /// else stays an I/O error.
    pub fn from_pipe_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => BridgeError::TransportClosed,
            _ => BridgeError::Io(err),
        }
    }

    pub fn is_transport_closed(&self) -> bool {
        matches!(self, BridgeError::TransportClosed)
    }
}

impl From<&BridgeError> for RpcError {
    fn from(err: &BridgeError) -> Self {
        let code = match err {
            BridgeError::InvalidParams(_) | BridgeError::Json(_) => codes::INVALID_PARAMS,
            BridgeError::ProtocolViolation(_) => codes::INVALID_REQUEST,
            BridgeError::HandleLifecycleViolation(_) => codes::LIFECYCLE_VIOLATION,
            BridgeError::RpcTimeout { .. } => codes::TIMEOUT,
            BridgeError::Remote { code, .. } => *code,
            _ => codes::INTERNAL_ERROR,
        };
        RpcError::new(code, err.to_string())
    }
}

impl From<RpcError> for BridgeError {
    fn from(err: RpcError) -> Self {
        BridgeError::Remote {
            code: err.code,
            message: err.message,
        }
    }
}
