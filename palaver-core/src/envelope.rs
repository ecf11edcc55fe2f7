//! Chat message envelope: the only wire payload shape, one JSON record
//! per protocol message.

use serde::{Deserialize, Serialize};

/// Handshake action: announce the sender's own listen address so the
/// recipient can maintain a reverse path.
pub const ACTION_WHO: &str = "/who";
/// Free-text chat message action.
pub const ACTION_TEXT: &str = "text_msg";

/// One protocol message. `content` is set for chat text, `ip`/`port` for
/// the handshake; absent fields are omitted on the wire.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl Envelope {
    pub fn who(ip: impl Into<String>, port: u16) -> Self {
        Self {
            action: ACTION_WHO.to_string(),
            content: None,
            ip: Some(ip.into()),
            port: Some(port),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self {
            action: ACTION_TEXT.to_string(),
            content: Some(content.into()),
            ip: None,
            port: None,
        }
    }
}

/// Encode one envelope as a single self-contained record.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, EnvelopeError> {
    serde_json::to_vec(envelope).map_err(EnvelopeError::Encode)
}

/// Decode one received unit back into an envelope.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
    serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed message: {0}")]
    Decode(#[source] serde_json::Error),
}
