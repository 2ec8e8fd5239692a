//! JSON frame protocol for the agent websocket.
//!
//! One frame per websocket text message:
//! ```text
//! { "id": "<uuid>", "type": "request", "headers": {..}, "data": {..} }
//! ```
//! The transport preserves message boundaries, so no length prefix is
//! needed. Both endpoints speak the same envelope.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Frame kinds understood by the gateway.
///
/// Unrecognized strings decode to [`FrameType::Unknown`]; the read loop
/// drops them with a warning instead of failing the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Handshake,
    Request,
    Response,
    Heartbeat,
    Error,
    Disconnect,
    #[serde(other)]
    Unknown,
}

/// A single frame exchanged over the agent socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Correlation id pairing a `request` with its `response`.
    pub id: String,
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Frame {
    pub fn new(id: impl Into<String>, frame_type: FrameType, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            frame_type,
            headers: HashMap::new(),
            data,
        }
    }

    /// Frame with a fresh correlation id.
    pub fn control(frame_type: FrameType, data: serde_json::Value) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), frame_type, data)
    }

    /// Encode into the wire text. Never produces partial output.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Malformed)
    }

    /// Decode one frame, enforcing the frame size bound.
    pub fn decode(text: &str, max_len: usize) -> Result<Self, ProtocolError> {
        if text.len() > max_len {
            return Err(ProtocolError::Oversize {
                len: text.len(),
                max: max_len,
            });
        }
        let frame: Frame = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        if frame.id.is_empty() {
            return Err(ProtocolError::MissingId);
        }
        Ok(frame)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame exceeds maximum size: {len} > {max} bytes")]
    Oversize { len: usize, max: usize },
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("frame is missing a correlation id")]
    MissingId,
}

/// Payload of the server→agent `handshake` frame sent on connect.
#[derive(Debug, Serialize, Deserialize)]
pub struct HandshakeData {
    pub tunnel_id: uuid::Uuid,
    pub subdomain: String,
    pub public_url: String,
    pub status: String,
}

/// Payload of a server→agent `request` frame. Headers travel in the frame
/// envelope; the body is fully buffered.
#[derive(Debug, Serialize, Deserialize)]
pub struct RequestData {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub body: String,
}

/// Payload of an agent→server `response` frame.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseData {
    pub status_code: u16,
    #[serde(default)]
    pub body: String,
}

/// Payload of a `heartbeat` frame in either direction.
#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatData {
    pub timestamp: i64,
}

impl HeartbeatData {
    pub fn now() -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1 << 20;

    #[test]
    fn round_trips_defined_frame_types() {
        for frame_type in [
            FrameType::Handshake,
            FrameType::Request,
            FrameType::Response,
            FrameType::Heartbeat,
            FrameType::Error,
            FrameType::Disconnect,
        ] {
            let mut frame = Frame::control(frame_type, serde_json::json!({"k": "v"}));
            frame
                .headers
                .insert("Content-Type".to_string(), "text/plain".to_string());
            let text = frame.encode().unwrap();
            let decoded = Frame::decode(&text, MAX).unwrap();
            assert_eq!(decoded.id, frame.id);
            assert_eq!(decoded.frame_type, frame_type);
            assert_eq!(decoded.headers, frame.headers);
            assert_eq!(decoded.data, frame.data);
        }
    }

    #[test]
    fn unknown_type_is_passed_through() {
        let text = r#"{"id":"abc","type":"gossip","data":{}}"#;
        let frame = Frame::decode(text, MAX).unwrap();
        assert_eq!(frame.frame_type, FrameType::Unknown);
    }

    #[test]
    fn malformed_envelope_is_rejected() {
        assert!(matches!(
            Frame::decode("not json", MAX),
            Err(ProtocolError::Malformed(_))
        ));
        // id must be a string
        assert!(matches!(
            Frame::decode(r#"{"id":7,"type":"request","data":{}}"#, MAX),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Frame::decode(r#"{"id":"","type":"request","data":{}}"#, MAX),
            Err(ProtocolError::MissingId)
        ));
    }

    #[test]
    fn oversize_frame_is_rejected() {
        let frame = Frame::control(
            FrameType::Request,
            serde_json::json!({"body": "x".repeat(64)}),
        );
        let text = frame.encode().unwrap();
        let err = Frame::decode(&text, 16).unwrap_err();
        assert!(matches!(err, ProtocolError::Oversize { max: 16, .. }));
    }

    #[test]
    fn missing_headers_defaults_to_empty() {
        let text = r#"{"id":"abc","type":"heartbeat","data":{"timestamp":1}}"#;
        let frame = Frame::decode(text, MAX).unwrap();
        assert!(frame.headers.is_empty());
        let hb: HeartbeatData = serde_json::from_value(frame.data).unwrap();
        assert_eq!(hb.timestamp, 1);
    }
}
