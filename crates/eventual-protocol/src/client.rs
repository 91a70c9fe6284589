//! JSON text frames exchanged with WebSocket clients.
//!
//! Inbound frames are objects with a `type` discriminator and a bearer
//! `token`; outbound frames are bare CloudEvents or the `"Invalid Request"`
//! notice.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::CloudEvent;
use crate::ProtocolError;

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Text sent back for a well-formed frame with an unknown `type`.
pub const INVALID_REQUEST: &str = "Invalid Request";

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Channel name contains control characters");
    }
    Ok(())
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Subscribe { channels: Vec<String> },
    Unsubscribe { channels: Vec<String> },
    Publish { channels: Vec<String>, event: CloudEvent },
    History { channel: String, consume: bool },
    /// Parsed envelope with a `type` the broker does not handle.
    Unknown(String),
}

impl ClientRequest {
    /// Wire name of the request type.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            ClientRequest::Subscribe { .. } => "subscribe",
            ClientRequest::Unsubscribe { .. } => "unsubscribe",
            ClientRequest::Publish { .. } => "publish",
            ClientRequest::History { .. } => "history",
            ClientRequest::Unknown(kind) => kind,
        }
    }
}

/// An inbound frame: the credential plus the request it guards.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientFrame {
    pub token: Option<String>,
    pub request: ClientRequest,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Deserialize)]
struct ChannelsBody {
    channels: Vec<String>,
}

#[derive(Deserialize)]
struct PublishBody {
    channels: Vec<String>,
    event: CloudEvent,
}

#[derive(Deserialize)]
struct HistoryBody {
    channel: String,
    #[serde(default)]
    consume: bool,
}

/// Body of `POST /publish`, also usable by tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub channels: Vec<String>,
    pub event: CloudEvent,
}

impl PublishEnvelope {
    /// Validate channel names and normalise the event.
    ///
    /// # Errors
    ///
    /// Returns an error if a channel name or the event is invalid.
    pub fn validate(&mut self) -> Result<(), ProtocolError> {
        check_channels(&self.channels)?;
        self.event.normalize()
    }
}

fn check_channels(channels: &[String]) -> Result<(), ProtocolError> {
    if channels.is_empty() {
        return Err(ProtocolError::Invalid("at least one channel is required".into()));
    }
    for channel in channels {
        validate_channel_name(channel)
            .map_err(|reason| ProtocolError::Invalid(format!("{reason}: {channel:?}")))?;
    }
    Ok(())
}

/// Decode an inbound text frame.
///
/// The envelope (`type`, `token`) is read first so that an unknown `type`
/// still yields a frame the caller can authenticate and answer.
///
/// # Errors
///
/// Returns an error if the text is not a JSON object with a `type`, or if a
/// known request type is missing its fields.
pub fn decode_frame(text: &str) -> Result<ClientFrame, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let envelope = Envelope::deserialize(&value)?;

    let request = match envelope.kind.as_str() {
        "subscribe" => {
            let body = ChannelsBody::deserialize(&value)?;
            check_channels(&body.channels)?;
            ClientRequest::Subscribe {
                channels: body.channels,
            }
        }
        "unsubscribe" => {
            let body = ChannelsBody::deserialize(&value)?;
            check_channels(&body.channels)?;
            ClientRequest::Unsubscribe {
                channels: body.channels,
            }
        }
        "publish" => {
            let mut body = PublishBody::deserialize(&value)?;
            check_channels(&body.channels)?;
            body.event.normalize()?;
            ClientRequest::Publish {
                channels: body.channels,
                event: body.event,
            }
        }
        "history" => {
            let body = HistoryBody::deserialize(&value)?;
            validate_channel_name(&body.channel)
                .map_err(|reason| ProtocolError::Invalid(reason.to_string()))?;
            ClientRequest::History {
                channel: body.channel,
                consume: body.consume,
            }
        }
        _ => ClientRequest::Unknown(envelope.kind),
    };

    Ok(ClientFrame {
        token: envelope.token.filter(|t| !t.is_empty()),
        request,
    })
}

/// Encode an event for delivery to a client.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_event(event: &CloudEvent) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

/// The `"Invalid Request"` notice as a JSON text frame.
#[must_use]
pub fn invalid_request() -> String {
    format!("\"{INVALID_REQUEST}\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_subscribe() {
        let frame =
            decode_frame(r#"{"type":"subscribe","token":"t","channels":["a","b"]}"#).unwrap();
        assert_eq!(frame.token.as_deref(), Some("t"));
        assert_eq!(
            frame.request,
            ClientRequest::Subscribe {
                channels: vec!["a".into(), "b".into()]
            }
        );
    }

    #[test]
    fn test_decode_publish_normalizes_event() {
        let frame = decode_frame(
            r#"{"type":"publish","token":"t","channels":["weather"],
                "event":{"id":"1","source":"s","type":"x","subject":"","datacontenttype":"text/plain","data":{"k":1}}}"#,
        )
        .unwrap();

        match frame.request {
            ClientRequest::Publish { channels, event } => {
                assert_eq!(channels, vec!["weather".to_string()]);
                assert_eq!(event.subject, "*");
                assert_eq!(event.data_content_type, "application/json");
                assert_eq!(event.data["k"], 1);
            }
            other => panic!("expected publish, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_history_defaults() {
        let frame = decode_frame(r#"{"type":"history","token":"t","channel":"a"}"#).unwrap();
        assert_eq!(
            frame.request,
            ClientRequest::History {
                channel: "a".into(),
                consume: false
            }
        );
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let frame = decode_frame(r#"{"type":"presence","token":"t"}"#).unwrap();
        assert_eq!(frame.request, ClientRequest::Unknown("presence".into()));
        assert_eq!(frame.request.kind(), "presence");
    }

    #[test]
    fn test_malformed_frames() {
        assert!(decode_frame("not json").is_err());
        assert!(decode_frame(r#"{"token":"t"}"#).is_err());
        assert!(decode_frame(r#"{"type":"subscribe","token":"t"}"#).is_err());
        assert!(decode_frame(r#"{"type":"subscribe","token":"t","channels":[]}"#).is_err());
        assert!(decode_frame(r#"{"type":"publish","token":"t","channels":["a"]}"#).is_err());
    }

    #[test]
    fn test_missing_or_empty_token() {
        let frame = decode_frame(r#"{"type":"subscribe","channels":["a"]}"#).unwrap();
        assert!(frame.token.is_none());

        let frame = decode_frame(r#"{"type":"subscribe","token":"","channels":["a"]}"#).unwrap();
        assert!(frame.token.is_none());
    }

    #[test]
    fn test_invalid_request_is_json_string() {
        let text = invalid_request();
        let parsed: String = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, INVALID_REQUEST);
    }

    #[test]
    fn test_channel_name_validation() {
        assert!(validate_channel_name("valid:channel").is_ok());
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name("bad\nname").is_err());

        let long_name = "a".repeat(MAX_CHANNEL_NAME_LENGTH + 1);
        assert!(validate_channel_name(&long_name).is_err());
    }
}
