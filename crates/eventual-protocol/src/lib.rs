//! # eventual-protocol
//!
//! Wire formats for the eventual broker.
//!
//! - [`CloudEvent`] - the envelope every publish carries
//! - [`client`] - JSON text frames spoken by WebSocket clients
//! - [`Frame`] / [`codec`] - length-prefixed MessagePack frames spoken between brokers
//!
//! ## Example
//!
//! ```rust
//! use eventual_protocol::{codec, CloudEvent, Frame};
//!
//! let event = CloudEvent::new("42", "sensor", "reading");
//! let frame = Frame::publish(1, "token", "", "weather", event);
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod client;
pub mod codec;
pub mod event;
pub mod frames;

pub use client::{decode_frame, ClientFrame, ClientRequest, PublishEnvelope};
pub use codec::{decode, encode, ProtocolError};
pub use event::CloudEvent;
pub use frames::{Frame, FrameType};
