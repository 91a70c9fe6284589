//! # eventual-transport
//!
//! Broker-to-broker RPC for the eventual broker.
//!
//! Peers talk over plain TCP with length-prefixed msgpack frames. Every call
//! is a request frame answered by exactly one response or error frame.
//!
//! ```rust,ignore
//! use eventual_transport::{RpcClient, RpcServer};
//!
//! let server = RpcServer::bind("0.0.0.0:9090").await?;
//! tokio::spawn(server.serve(service));
//!
//! let mut client = RpcClient::connect("10.0.0.2:9090", timeout).await?;
//! client.subscribe(&token, "weather", "10.0.0.1:9090").await?;
//! ```

pub mod connection;
pub mod rpc;
pub mod traits;

pub use connection::RpcConnection;
pub use rpc::{RpcClient, RpcServer};
pub use traits::{PeerService, RpcError, TransportError};
