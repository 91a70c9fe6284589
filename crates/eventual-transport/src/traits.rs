//! The peer RPC surface and its error types.

use async_trait::async_trait;
use eventual_protocol::frames::{codes, FrameType};
use eventual_protocol::CloudEvent;
use thiserror::Error;

/// Failures reported by a peer service, carried over the wire as `Frame::Error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RpcError {
    /// Wire code of this error.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            RpcError::Unauthenticated(_) => codes::UNAUTHENTICATED,
            RpcError::InvalidArgument(_) => codes::INVALID_ARGUMENT,
            RpcError::Internal(_) => codes::INTERNAL,
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            RpcError::Unauthenticated(m)
            | RpcError::InvalidArgument(m)
            | RpcError::Internal(m) => m,
        }
    }

    /// Rebuild an error received over the wire.
    #[must_use]
    pub fn from_code(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            codes::UNAUTHENTICATED => RpcError::Unauthenticated(message),
            codes::INVALID_ARGUMENT => RpcError::InvalidArgument(message),
            _ => RpcError::Internal(message),
        }
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// The remote answered with an error.
    #[error("Remote error: {0}")]
    Rpc(#[from] RpcError),

    /// The remote answered with a frame that does not fit the call.
    #[error("Unexpected frame: {0:?}")]
    UnexpectedFrame(FrameType),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] eventual_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Calls a broker accepts from its peers.
#[async_trait]
pub trait PeerService: Send + Sync + 'static {
    /// Register `peer_server` as interested in `channel`.
    ///
    /// Returns a subscription id, which may be empty.
    async fn subscribe(
        &self,
        token: &str,
        channel: &str,
        peer_server: &str,
    ) -> Result<String, RpcError>;

    /// Deliver `event` into `channel`. Echoes `subscription_id` on success.
    async fn publish(
        &self,
        token: &str,
        subscription_id: &str,
        channel: &str,
        event: CloudEvent,
    ) -> Result<String, RpcError>;
}
