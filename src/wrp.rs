//! The WRP message family routed by the hub.
//!
//! Two wire formats carry the same logical message: JSON (text frames) and a
//! msgpack encoding (binary frames). Routing only ever needs the small
//! [`Routable`] surface — message type, addressing, and the transaction key
//! that correlates a response with its request.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message kinds understood by the hub.
///
/// Kinds in the request/response family carry a transaction key; events are
/// fire-and-forget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Auth,
    SimpleRequestResponse,
    SimpleEvent,
    Create,
    Retrieve,
    Update,
    Delete,
    ServiceRegistration,
    ServiceAlive,
    Unknown,
}

impl MessageType {
    /// Whether a message of this kind participates in request/response
    /// correlation (i.e. a reply is expected to echo the transaction key).
    #[must_use]
    pub fn expects_response(self) -> bool {
        matches!(
            self,
            Self::SimpleRequestResponse | Self::Create | Self::Retrieve | Self::Update | Self::Delete
        )
    }
}

/// The routing contract every WRP message satisfies.
pub trait Routable {
    fn message_type(&self) -> MessageType;
    /// Destination locator (e.g. a canonical device identifier).
    fn to(&self) -> Option<&str>;
    /// Source locator.
    fn from(&self) -> Option<&str>;
    /// Correlation key; non-empty on request/response traffic.
    fn transaction_key(&self) -> Option<&str>;
}

/// A WRP message.
///
/// Fields absent on the wire stay `None`; both codecs skip them on encode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
}

impl Message {
    /// A fire-and-forget event addressed to `destination`.
    #[must_use]
    pub fn event(destination: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::SimpleEvent,
            source: None,
            destination: Some(destination.into()),
            transaction_uuid: None,
            content_type: None,
            payload: None,
        }
    }

    /// A request addressed to `destination`, correlated by `transaction_uuid`.
    #[must_use]
    pub fn request(destination: impl Into<String>, transaction_uuid: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::SimpleRequestResponse,
            source: None,
            destination: Some(destination.into()),
            transaction_uuid: Some(transaction_uuid.into()),
            content_type: None,
            payload: None,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, content_type: impl Into<String>, payload: Vec<u8>) -> Self {
        self.content_type = Some(content_type.into());
        self.payload = Some(payload);
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Routable for Message {
    fn message_type(&self) -> MessageType {
        self.msg_type
    }

    fn to(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    fn from(&self) -> Option<&str> {
        self.source.as_deref()
    }

    fn transaction_key(&self) -> Option<&str> {
        self.transaction_uuid.as_deref().filter(|k| !k.is_empty())
    }
}

/// Frame encoding for a connection or an individual request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    Json,
    Msgpack,
}

/// Codec failure on a single frame. Never fatal to the connection by itself.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON codec: {0}")]
    Json(#[from] serde_json::Error),
    #[error("msgpack encode: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decode: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),
}

impl WireFormat {
    /// Parse the configuration name (`json` or `msgpack`).
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "json" => Some(Self::Json),
            "msgpack" => Some(Self::Msgpack),
            _ => None,
        }
    }

    pub fn encode(self, message: &Message) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Json => Ok(serde_json::to_vec(message)?),
            Self::Msgpack => Ok(rmp_serde::to_vec_named(message)?),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<Message, CodecError> {
        match self {
            Self::Json => Ok(serde_json::from_slice(bytes)?),
            Self::Msgpack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Message {
        Message::request("mac:112233445566/config/", "txn-1")
            .with_source("dns:router.example.net")
            .with_payload("application/json", br#"{"names":["Device.X"]}"#.to_vec())
    }

    #[test]
    fn test_json_round_trip() {
        let msg = sample_request();
        let bytes = WireFormat::Json.encode(&msg).unwrap();
        assert_eq!(WireFormat::Json.decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_msgpack_round_trip() {
        let msg = sample_request();
        let bytes = WireFormat::Msgpack.encode(&msg).unwrap();
        assert_eq!(WireFormat::Msgpack.decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_json_skips_absent_fields() {
        let bytes = WireFormat::Json.encode(&Message::event("event:status")).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains("transaction_uuid"));
        assert!(!text.contains("payload"));
    }

    #[test]
    fn test_routable_surface() {
        let msg = sample_request();
        assert_eq!(msg.message_type(), MessageType::SimpleRequestResponse);
        assert_eq!(msg.to(), Some("mac:112233445566/config/"));
        assert_eq!(msg.from(), Some("dns:router.example.net"));
        assert_eq!(msg.transaction_key(), Some("txn-1"));
    }

    #[test]
    fn test_empty_transaction_key_is_none() {
        let mut msg = sample_request();
        msg.transaction_uuid = Some(String::new());
        assert_eq!(msg.transaction_key(), None);
    }

    #[test]
    fn test_expects_response() {
        assert!(MessageType::SimpleRequestResponse.expects_response());
        assert!(MessageType::Retrieve.expects_response());
        assert!(!MessageType::SimpleEvent.expects_response());
        assert!(!MessageType::ServiceAlive.expects_response());
    }

    #[test]
    fn test_decode_failure_is_reported() {
        assert!(WireFormat::Json.decode(b"{not json").is_err());
        assert!(WireFormat::Msgpack.decode(&[0xc1]).is_err());
    }
}
