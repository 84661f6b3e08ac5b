#![allow(dead_code)]

use assistant_realtime::media::{
    CapturedDisplay, CapturedMedia, FrameSource, LocalTrack, MediaError, MediaProvider,
};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub fn opus_track(id: &str) -> LocalTrack {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            ..Default::default()
        },
        id.to_owned(),
        "microphone".to_owned(),
    ))
}

pub fn vp8_track(id: &str) -> LocalTrack {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            ..Default::default()
        },
        id.to_owned(),
        "camera".to_owned(),
    ))
}

/// Capture collaborator backed by static local tracks.
pub struct StubMedia;

#[async_trait]
impl MediaProvider for StubMedia {
    async fn acquire_media(&self) -> Result<CapturedMedia, MediaError> {
        Ok(CapturedMedia {
            audio_track: opus_track("stub-audio"),
            video_track: vp8_track("stub-camera"),
            audio_devices: vec![],
            active_audio: None,
            video_devices: vec![],
            active_video: None,
        })
    }

    async fn acquire_display(&self) -> Result<CapturedDisplay, MediaError> {
        Ok(CapturedDisplay {
            video_track: vp8_track("stub-display"),
        })
    }

    async fn release(&self) {}
}

/// Capture collaborator whose display acquisition is always declined.
pub struct DecliningMedia;

#[async_trait]
impl MediaProvider for DecliningMedia {
    async fn acquire_media(&self) -> Result<CapturedMedia, MediaError> {
        StubMedia.acquire_media().await
    }

    async fn acquire_display(&self) -> Result<CapturedDisplay, MediaError> {
        Err(MediaError::PermissionDenied)
    }

    async fn release(&self) {}
}

/// Frame source returning the same encoded still on every tick.
pub struct StaticFrame;

impl FrameSource for StaticFrame {
    fn capture_frame(&self) -> Option<String> {
        Some(BASE64.encode(b"still frame"))
    }
}
