//! Collaborator contracts for media capture.
//!
//! The core never produces media itself: capture hands it opaque track
//! handles to attach to the peer connection, and frame sources hand it
//! base64 stills to ship over the `media` data channel.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use webrtc::track::track_local::TrackLocal;

/// Opaque local track handle supplied by a capture collaborator.
pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media permission denied")]
    PermissionDenied,
    #[error("media capture failed: {0}")]
    Capture(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
}

/// Microphone plus camera capture, with the device listings the
/// presentation layer shows in its pickers.
pub struct CapturedMedia {
    pub audio_track: LocalTrack,
    pub video_track: LocalTrack,
    pub audio_devices: Vec<DeviceInfo>,
    pub active_audio: Option<DeviceInfo>,
    pub video_devices: Vec<DeviceInfo>,
    pub active_video: Option<DeviceInfo>,
}

pub struct CapturedDisplay {
    pub video_track: LocalTrack,
}

/// Device/display capture collaborator. Declining the OS share picker
/// must surface as [`MediaError::PermissionDenied`] so the session can
/// treat it as an expected user action.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn acquire_media(&self) -> Result<CapturedMedia, MediaError>;
    async fn acquire_display(&self) -> Result<CapturedDisplay, MediaError>;
    async fn release(&self);
}

/// Supplies the periodic emitters with still frames. Returning `None`
/// skips the tick; frames are inherently ephemeral and may be dropped.
pub trait FrameSource: Send + Sync {
    /// Base64-encoded still frame for the current tick.
    fn capture_frame(&self) -> Option<String>;
}
