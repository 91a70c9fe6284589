//! # eventual-server
//!
//! The eventual broker: WebSocket clients publish and subscribe to channels
//! of CloudEvents, and brokers federate events to each other over RPC.

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod peer;
pub mod session;

pub use config::Config;
pub use handlers::{run_server, start, AppState, ServerHandle};
