//! Frame types for broker-to-broker RPC.
//!
//! Every request carries an `id` that the matching response echoes, so a
//! client can pair answers with calls on a shared connection.

use serde::{Deserialize, Serialize};

use crate::event::CloudEvent;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Subscribe = 0x01,
    Subscribed = 0x02,
    Publish = 0x03,
    Published = 0x04,
    Error = 0x05,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Subscribe),
            0x02 => Ok(FrameType::Subscribed),
            0x03 => Ok(FrameType::Publish),
            0x04 => Ok(FrameType::Published),
            0x05 => Ok(FrameType::Error),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Error codes carried by `Frame::Error`.
pub mod codes {
    pub const INVALID_ARGUMENT: u16 = 400;
    pub const UNAUTHENTICATED: u16 = 401;
    pub const INTERNAL: u16 = 500;
}

/// A peer RPC frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Register `peer_server` as interested in `channel`.
    #[serde(rename = "subscribe")]
    Subscribe {
        id: u64,
        token: String,
        channel: String,
        /// Address at which the subscribing broker accepts publishes.
        peer_server: String,
    },

    #[serde(rename = "subscribed")]
    Subscribed { id: u64, subscription_id: String },

    /// Deliver an event into `channel` on the receiving broker.
    #[serde(rename = "publish")]
    Publish {
        id: u64,
        token: String,
        subscription_id: String,
        channel: String,
        event: CloudEvent,
    },

    #[serde(rename = "published")]
    Published { id: u64, subscription_id: String },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request.
        id: u64,
        code: u16,
        message: String,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Subscribe { .. } => FrameType::Subscribe,
            Frame::Subscribed { .. } => FrameType::Subscribed,
            Frame::Publish { .. } => FrameType::Publish,
            Frame::Published { .. } => FrameType::Published,
            Frame::Error { .. } => FrameType::Error,
        }
    }

    /// Request or correlation id of this frame.
    #[must_use]
    pub fn id(&self) -> u64 {
        match self {
            Frame::Subscribe { id, .. }
            | Frame::Subscribed { id, .. }
            | Frame::Publish { id, .. }
            | Frame::Published { id, .. }
            | Frame::Error { id, .. } => *id,
        }
    }

    #[must_use]
    pub fn subscribe(
        id: u64,
        token: impl Into<String>,
        channel: impl Into<String>,
        peer_server: impl Into<String>,
    ) -> Self {
        Frame::Subscribe {
            id,
            token: token.into(),
            channel: channel.into(),
            peer_server: peer_server.into(),
        }
    }

    #[must_use]
    pub fn subscribed(id: u64, subscription_id: impl Into<String>) -> Self {
        Frame::Subscribed {
            id,
            subscription_id: subscription_id.into(),
        }
    }

    #[must_use]
    pub fn publish(
        id: u64,
        token: impl Into<String>,
        subscription_id: impl Into<String>,
        channel: impl Into<String>,
        event: CloudEvent,
    ) -> Self {
        Frame::Publish {
            id,
            token: token.into(),
            subscription_id: subscription_id.into(),
            channel: channel.into(),
            event,
        }
    }

    #[must_use]
    pub fn published(id: u64, subscription_id: impl Into<String>) -> Self {
        Frame::Published {
            id,
            subscription_id: subscription_id.into(),
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }
}
