//! Wire types shared by the signaling transport and the data channels.
//!
//! Envelopes are the only unit of information crossing the signaling
//! WebSocket; `DataChannelMessage` is the only frame shape crossing the
//! `chat` and `media` data channels. Both are plain JSON.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Label of the data channel carrying chat text.
pub const CHAT_CHANNEL: &str = "chat";
/// Label of the data channel carrying frame snapshots and control messages.
pub const MEDIA_CHANNEL: &str = "media";

// Inbound signaling events.
pub const SIGNALING_CONNECTED: &str = "signaling:connected";
pub const SIGNALING_ANSWER: &str = "signaling:answer";
pub const SIGNALING_CANDIDATE: &str = "signaling:candidate";

// Outbound signaling events.
pub const CLIENT_HEARTBEAT: &str = "client:heartbeat";
pub const CLIENT_OFFER: &str = "client:offer";
pub const CLIENT_CANDIDATE: &str = "client:candidate";
pub const CLIENT_TRACK_ADDED: &str = "client:track:added";

// Data-channel event namespaces.
pub const CHAT_MESSAGE_INPUT: &str = "chat:message:input";
pub const CAMERA_IMAGE_DATA: &str = "camera:image:data";
pub const CAMERA_IMAGE_CLEAR: &str = "camera:image:clear";
pub const SCREENSHARE_IMAGE_DATA: &str = "screenshare:image:data";
pub const SCREENSHARE_IMAGE_CLEAR: &str = "screenshare:image:clear";
pub const DRAW_IMAGE_DATA: &str = "draw:image:data";
pub const DRAW_IMAGE_CLEAR: &str = "draw:image:clear";

/// Addressing block of a [`SignalingEnvelope`]. `content` is itself a
/// serialized payload: an SDP blob, an ICE candidate, or a JSON status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeData {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub content: String,
}

/// One JSON frame on the signaling WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: EnvelopeData,
    #[serde(default)]
    pub time: u64,
}

impl SignalingEnvelope {
    pub fn new(event: impl Into<String>, data: EnvelopeData) -> Self {
        Self {
            event: event.into(),
            data,
            time: unix_seconds(),
        }
    }

    /// Envelope for a `client:*` event addressed to the signaling service.
    pub fn client(
        event: impl Into<String>,
        channel: impl Into<String>,
        from: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(
            event,
            EnvelopeData {
                channel: channel.into(),
                from: from.into(),
                target: "signaling".into(),
                content: content.into(),
            },
        )
    }

    pub fn heartbeat() -> Self {
        Self::new(CLIENT_HEARTBEAT, EnvelopeData::default())
    }
}

/// One JSON frame on a data channel. `data` is user text or a
/// base64-encoded still frame depending on `event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChannelMessage {
    pub event: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub time: u64,
}

impl DataChannelMessage {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
            time: unix_seconds(),
        }
    }
}

/// ICE server list delivered inside the `signaling:connected` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServersPayload {
    pub urls: Vec<String>,
}

/// Content of a `client:track:added` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackAddedPayload {
    pub track_id: String,
    pub track_type: String,
}

/// Result of a fire-and-forget send. Control-plane traffic is lossy by
/// design: a send on a not-yet-open transport is dropped, but the drop is
/// reported so callers can observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    NotReady,
}

impl SendOutcome {
    pub fn is_sent(self) -> bool {
        matches!(self, SendOutcome::Sent)
    }
}

pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
