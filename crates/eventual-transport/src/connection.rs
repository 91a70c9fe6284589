//! A TCP stream carrying length-prefixed frames.

use bytes::BytesMut;
use eventual_protocol::{codec, Frame};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::traits::TransportError;

/// Framed connection to a peer broker.
pub struct RpcConnection {
    stream: TcpStream,
    remote_addr: Option<SocketAddr>,
    read_buffer: BytesMut,
}

impl RpcConnection {
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        let remote_addr = stream.peer_addr().ok();
        let _ = stream.set_nodelay(true);
        Self {
            stream,
            remote_addr,
            read_buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Connect to `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP connection cannot be established.
    pub async fn connect(addr: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }

    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Receive the next frame. `None` on a clean close between frames.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, on a malformed frame, or if the peer
    /// closes mid-frame.
    pub async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            if let Some(frame) = codec::decode_from(&mut self.read_buffer)? {
                trace!(frame_type = ?frame.frame_type(), id = frame.id(), "Received frame");
                return Ok(Some(frame));
            }

            if self.stream.read_buf(&mut self.read_buffer).await? == 0 {
                return if self.read_buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(TransportError::ConnectionClosed)
                };
            }
        }
    }

    /// Send a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the write fails.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let data = codec::encode(frame)?;
        self.stream.write_all(&data).await?;
        trace!(frame_type = ?frame.frame_type(), id = frame.id(), "Sent frame");
        Ok(())
    }
}
