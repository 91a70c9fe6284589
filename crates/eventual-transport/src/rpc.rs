//! RPC server and client for broker-to-broker calls.
//!
//! Requests on one connection are answered in order. Each call carries an id
//! and the client skips stale responses left over from abandoned calls.

use eventual_protocol::frames::codes;
use eventual_protocol::{CloudEvent, Frame};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{debug, info, trace, warn};

use crate::connection::RpcConnection;
use crate::traits::{PeerService, RpcError, TransportError};

/// Accepts peer connections and dispatches their calls to a [`PeerService`].
pub struct RpcServer {
    listener: TcpListener,
}

impl RpcServer {
    /// Bind the server.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        if let Ok(local) = listener.local_addr() {
            info!("Peer RPC listening on {}", local);
        }
        Ok(Self { listener })
    }

    /// Get the local address this server is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Accept connections forever, serving each on its own task.
    pub async fn serve(self, service: Arc<dyn PeerService>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "Accepted peer connection");
                    let service = Arc::clone(&service);
                    tokio::spawn(serve_connection(RpcConnection::new(stream), service));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept peer connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
}

async fn serve_connection(mut conn: RpcConnection, service: Arc<dyn PeerService>) {
    let peer = conn
        .remote_addr()
        .map_or_else(|| "unknown".to_string(), |a| a.to_string());

    loop {
        let frame = match conn.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(peer = %peer, "Peer connection closed");
                return;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Malformed peer traffic, closing");
                let _ = conn
                    .send(&Frame::error(0, codes::INVALID_ARGUMENT, e.to_string()))
                    .await;
                return;
            }
        };

        let response = dispatch(service.as_ref(), frame).await;
        if let Err(e) = conn.send(&response).await {
            debug!(peer = %peer, error = %e, "Failed to answer peer");
            return;
        }
    }
}

/// Execute one request frame against `service` and build the response frame.
pub async fn dispatch(service: &dyn PeerService, frame: Frame) -> Frame {
    match frame {
        Frame::Subscribe {
            id,
            token,
            channel,
            peer_server,
        } => match service.subscribe(&token, &channel, &peer_server).await {
            Ok(subscription_id) => Frame::subscribed(id, subscription_id),
            Err(e) => error_frame(id, &e),
        },
        Frame::Publish {
            id,
            token,
            subscription_id,
            channel,
            event,
        } => match service
            .publish(&token, &subscription_id, &channel, event)
            .await
        {
            Ok(subscription_id) => Frame::published(id, subscription_id),
            Err(e) => error_frame(id, &e),
        },
        other => {
            trace!(frame_type = ?other.frame_type(), "Response frame sent as request");
            Frame::error(
                other.id(),
                codes::INVALID_ARGUMENT,
                format!("{:?} is not a request", other.frame_type()),
            )
        }
    }
}

fn error_frame(id: u64, error: &RpcError) -> Frame {
    Frame::error(id, error.code(), error.message())
}

/// A connection to one peer broker's RPC server.
pub struct RpcClient {
    address: String,
    conn: RpcConnection,
    next_id: u64,
    call_timeout: Duration,
}

impl RpcClient {
    /// Connect to `address`, giving up after `call_timeout`.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` or the connection error.
    pub async fn connect(address: &str, call_timeout: Duration) -> Result<Self, TransportError> {
        let conn = tokio::time::timeout(call_timeout, RpcConnection::connect(address))
            .await
            .map_err(|_| TransportError::Timeout)??;
        debug!(peer = %address, "Connected to peer");
        Ok(Self {
            address: address.to_string(),
            conn,
            next_id: 1,
            call_timeout,
        })
    }

    /// Address this client is connected to.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Ask the peer to push events on `channel` to `peer_server`.
    ///
    /// # Errors
    ///
    /// Returns the remote's error, a timeout, or a connection failure.
    pub async fn subscribe(
        &mut self,
        token: &str,
        channel: &str,
        peer_server: &str,
    ) -> Result<String, TransportError> {
        let id = self.allocate_id();
        match self
            .call(Frame::subscribe(id, token, channel, peer_server))
            .await?
        {
            Frame::Subscribed {
                subscription_id, ..
            } => Ok(subscription_id),
            other => Err(unexpected(other)),
        }
    }

    /// Deliver `event` into `channel` on the peer.
    ///
    /// # Errors
    ///
    /// Returns the remote's error, a timeout, or a connection failure.
    pub async fn publish(
        &mut self,
        token: &str,
        subscription_id: &str,
        channel: &str,
        event: CloudEvent,
    ) -> Result<String, TransportError> {
        let id = self.allocate_id();
        match self
            .call(Frame::publish(id, token, subscription_id, channel, event))
            .await?
        {
            Frame::Published {
                subscription_id, ..
            } => Ok(subscription_id),
            other => Err(unexpected(other)),
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    async fn call(&mut self, request: Frame) -> Result<Frame, TransportError> {
        let id = request.id();
        let conn = &mut self.conn;
        let exchange = async move {
            conn.send(&request).await?;
            loop {
                match conn.recv().await? {
                    Some(Frame::Error { id: 0, code, message }) => {
                        return Err(RpcError::from_code(code, message).into())
                    }
                    Some(frame) if frame.id() == id => return Ok(frame),
                    Some(stale) => {
                        trace!(expected = id, got = stale.id(), "Skipping stale response");
                    }
                    None => return Err(TransportError::ConnectionClosed),
                }
            }
        };

        let response = tokio::time::timeout(self.call_timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout)??;

        match response {
            Frame::Error { code, message, .. } => Err(RpcError::from_code(code, message).into()),
            frame => Ok(frame),
        }
    }
}

fn unexpected(frame: Frame) -> TransportError {
    TransportError::UnexpectedFrame(frame.frame_type())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        subscriptions: Mutex<Vec<(String, String)>>,
        published: Mutex<Vec<(String, CloudEvent)>>,
    }

    #[async_trait]
    impl PeerService for Recorder {
        async fn subscribe(
            &self,
            token: &str,
            channel: &str,
            peer_server: &str,
        ) -> Result<String, RpcError> {
            if token != "good" {
                return Err(RpcError::Unauthenticated("bad token".into()));
            }
            self.subscriptions
                .lock()
                .unwrap()
                .push((channel.to_string(), peer_server.to_string()));
            Ok(String::new())
        }

        async fn publish(
            &self,
            token: &str,
            subscription_id: &str,
            channel: &str,
            event: CloudEvent,
        ) -> Result<String, RpcError> {
            if token != "good" {
                return Err(RpcError::Unauthenticated("bad token".into()));
            }
            self.published
                .lock()
                .unwrap()
                .push((channel.to_string(), event));
            Ok(subscription_id.to_string())
        }
    }

    async fn start() -> (String, Arc<Recorder>) {
        let server = RpcServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let recorder = Arc::new(Recorder::default());
        tokio::spawn(server.serve(recorder.clone()));
        (addr, recorder)
    }

    #[tokio::test]
    async fn test_subscribe_and_publish() {
        let (addr, recorder) = start().await;
        let mut client = RpcClient::connect(&addr, Duration::from_secs(5))
            .await
            .unwrap();

        let sub = client
            .subscribe("good", "weather", "10.0.0.9:9090")
            .await
            .unwrap();
        assert_eq!(sub, "");

        let echoed = client
            .publish("good", "sub-7", "weather", CloudEvent::new("1", "s", "t"))
            .await
            .unwrap();
        assert_eq!(echoed, "sub-7");

        assert_eq!(
            recorder.subscriptions.lock().unwrap().as_slice(),
            &[("weather".to_string(), "10.0.0.9:9090".to_string())]
        );
        let published = recorder.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].1.id, "1");
    }

    #[tokio::test]
    async fn test_remote_error_is_typed() {
        let (addr, _) = start().await;
        let mut client = RpcClient::connect(&addr, Duration::from_secs(5))
            .await
            .unwrap();

        let err = client
            .subscribe("bad", "weather", "peer")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Rpc(RpcError::Unauthenticated(_))
        ));

        // The connection stays usable after an error response.
        client.subscribe("good", "weather", "peer").await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(RpcClient::connect(&addr, Duration::from_secs(5)).await.is_err());
    }

    #[tokio::test]
    async fn test_dispatch_rejects_response_frames() {
        let recorder = Recorder::default();
        let response = dispatch(&recorder, Frame::published(3, "x")).await;
        assert!(matches!(
            response,
            Frame::Error { id: 3, code: codes::INVALID_ARGUMENT, .. }
        ));
    }
}
