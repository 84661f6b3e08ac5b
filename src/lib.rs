pub mod auth;
pub mod config;
pub mod connection;
pub mod media;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod telemetry;

pub use auth::{AccessToken, AuthError, AuthorizationClient};
pub use config::{ConfigError, RealtimeConfig};
pub use connection::{
    ConnectionEvent, ConnectionOrchestrator, ConnectionPhase, NegotiationError, TrackPurpose,
};
pub use media::{
    CapturedDisplay, CapturedMedia, DeviceInfo, FrameSource, LocalTrack, MediaError, MediaProvider,
};
pub use protocol::{DataChannelMessage, SendOutcome, SignalingEnvelope};
pub use session::{InboundMessage, SessionController, SessionError, SessionState, Surface};
pub use signaling::{SignalingChannel, SignalingError, SignalingEvent};
