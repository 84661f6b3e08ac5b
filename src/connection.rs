//! Peer-connection state machine.
//!
//! Owns exactly one underlying RTC peer connection at a time, the track
//! senders attached to it (tagged by purpose, not just media kind), and
//! the two named data channels. Renegotiation is offer-only from this
//! side and strictly serialized: while an offer is unanswered, further
//! track changes coalesce into a single pending renegotiation instead of
//! producing overlapping offers.
//!
//! The orchestrator never talks to the signaling transport. Everything it
//! wants the remote peer to know is emitted as a [`ConnectionEvent`] for
//! the session controller to marshal.

use crate::media::LocalTrack;
use crate::protocol::{CHAT_CHANNEL, DataChannelMessage, MEDIA_CHANNEL, SendOutcome};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, RwLock as AsyncRwLock, mpsc};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("no active peer connection")]
    NotCreated,
    #[error("malformed session description: {0}")]
    MalformedSdp(String),
    #[error("malformed ice candidate: {0}")]
    MalformedCandidate(String),
    #[error("rtc error: {0}")]
    Rtc(#[from] webrtc::Error),
}

/// Why a local track was attached. Screenshare video is tagged distinctly
/// from camera video even though both are video-kind; this is the single
/// place that owns the distinction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackPurpose {
    Audio,
    Camera,
    Screenshare,
}

impl TrackPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackPurpose::Audio => "audio",
            TrackPurpose::Camera => "camera",
            TrackPurpose::Screenshare => "screenshare",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Created,
    Negotiating,
    Open,
    Closed,
}

/// Everything the orchestrator reports, one case per kind.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Created,
    TrackAdded {
        track_id: String,
        track_type: TrackPurpose,
    },
    /// JSON-serialized local session description.
    Offer { sdp: String },
    /// JSON-serialized local ICE candidate.
    Candidate { candidate: String },
    ChannelOpen { label: String },
    ChannelMessage {
        label: String,
        message: DataChannelMessage,
    },
    ChannelClosed { label: String },
}

#[derive(Debug, Default)]
struct NegotiationState {
    offer_outstanding: bool,
    renegotiate_pending: bool,
}

struct TaggedSender {
    purpose: TrackPurpose,
    sender: Arc<RTCRtpSender>,
}

#[derive(Default)]
struct ChannelReadiness {
    chat: AtomicBool,
    media: AtomicBool,
}

impl ChannelReadiness {
    fn set(&self, label: &str, ready: bool) {
        match label {
            CHAT_CHANNEL => self.chat.store(ready, Ordering::SeqCst),
            MEDIA_CHANNEL => self.media.store(ready, Ordering::SeqCst),
            _ => {}
        }
    }

    fn all_open(&self) -> bool {
        self.chat.load(Ordering::SeqCst) && self.media.load(Ordering::SeqCst)
    }
}

pub struct ConnectionOrchestrator {
    phase: Arc<AsyncRwLock<ConnectionPhase>>,
    pc: AsyncRwLock<Option<Arc<RTCPeerConnection>>>,
    chat_channel: AsyncRwLock<Option<Arc<RTCDataChannel>>>,
    media_channel: AsyncRwLock<Option<Arc<RTCDataChannel>>>,
    senders: AsyncMutex<Vec<TaggedSender>>,
    negotiation: AsyncMutex<NegotiationState>,
    pending_candidates: AsyncMutex<Vec<RTCIceCandidateInit>>,
    remote_description_set: AtomicBool,
    readiness: Arc<ChannelReadiness>,
    remote_audio: Arc<AsyncRwLock<Option<Arc<TrackRemote>>>>,
    events: Arc<AsyncRwLock<Option<mpsc::UnboundedSender<ConnectionEvent>>>>,
}

impl Default for ConnectionOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionOrchestrator {
    pub fn new() -> Self {
        Self {
            phase: Arc::new(AsyncRwLock::new(ConnectionPhase::Idle)),
            pc: AsyncRwLock::new(None),
            chat_channel: AsyncRwLock::new(None),
            media_channel: AsyncRwLock::new(None),
            senders: AsyncMutex::new(Vec::new()),
            negotiation: AsyncMutex::new(NegotiationState::default()),
            pending_candidates: AsyncMutex::new(Vec::new()),
            remote_description_set: AtomicBool::new(false),
            readiness: Arc::new(ChannelReadiness::default()),
            remote_audio: Arc::new(AsyncRwLock::new(None)),
            events: Arc::new(AsyncRwLock::new(None)),
        }
    }

    pub async fn phase(&self) -> ConnectionPhase {
        *self.phase.read().await
    }

    /// Remote voice track, once the peer delivers one.
    pub async fn remote_audio_track(&self) -> Option<Arc<TrackRemote>> {
        self.remote_audio.read().await.clone()
    }

    /// Instantiates the underlying transport, registers the callbacks,
    /// opens the `chat` and `media` data channels and emits `Created`.
    /// Safe to call after [`Self::close`]: the new connection starts with
    /// empty track and channel sets.
    pub async fn create_connection(
        &self,
        ice_urls: Vec<String>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<(), NegotiationError> {
        self.close().await;

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_urls,
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        // The remote side answers with its voice track on this m-line.
        pc.add_transceiver_from_kind(
            RTPCodecType::Audio,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await?;

        *self.events.write().await = Some(events.clone());

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => match serde_json::to_string(&init) {
                        Ok(json) => {
                            let _ = events.send(ConnectionEvent::Candidate { candidate: json });
                        }
                        Err(err) => {
                            tracing::warn!(target: "connection", error = %err, "candidate serialization failed");
                        }
                    },
                    Err(err) => {
                        tracing::warn!(target: "connection", error = %err, "candidate json conversion failed");
                    }
                }
            })
        }));

        let remote_audio = Arc::clone(&self.remote_audio);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let remote_audio = Arc::clone(&remote_audio);
            Box::pin(async move {
                tracing::debug!(
                    target: "connection",
                    kind = %track.kind(),
                    id = %track.id(),
                    "remote track received"
                );
                if track.kind() == RTPCodecType::Audio {
                    *remote_audio.write().await = Some(track);
                }
            })
        }));

        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            Box::pin(async move {
                tracing::debug!(
                    target: "connection",
                    label = %channel.label(),
                    "remote data channel announced"
                );
            })
        }));

        let chat = self.open_data_channel(&pc, CHAT_CHANNEL, &events).await?;
        let media = self.open_data_channel(&pc, MEDIA_CHANNEL, &events).await?;

        *self.pc.write().await = Some(pc);
        *self.chat_channel.write().await = Some(chat);
        *self.media_channel.write().await = Some(media);
        *self.phase.write().await = ConnectionPhase::Created;
        let _ = events.send(ConnectionEvent::Created);
        Ok(())
    }

    async fn open_data_channel(
        &self,
        pc: &Arc<RTCPeerConnection>,
        label: &'static str,
        events: &mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<RTCDataChannel>, NegotiationError> {
        let channel = pc.create_data_channel(label, None).await?;

        let open_events = events.clone();
        let open_phase = Arc::clone(&self.phase);
        let open_readiness = Arc::clone(&self.readiness);
        channel.on_open(Box::new(move || {
            let events = open_events.clone();
            let phase = Arc::clone(&open_phase);
            let readiness = Arc::clone(&open_readiness);
            Box::pin(async move {
                readiness.set(label, true);
                if readiness.all_open() {
                    let mut phase = phase.write().await;
                    // Channel readiness is the completion signal; never
                    // resurrect a connection that was closed meanwhile.
                    if matches!(
                        *phase,
                        ConnectionPhase::Created | ConnectionPhase::Negotiating
                    ) {
                        *phase = ConnectionPhase::Open;
                    }
                }
                let _ = events.send(ConnectionEvent::ChannelOpen {
                    label: label.to_string(),
                });
            })
        }));

        let message_events = events.clone();
        channel.on_message(Box::new(move |frame| {
            let events = message_events.clone();
            Box::pin(async move {
                match serde_json::from_slice::<DataChannelMessage>(&frame.data) {
                    Ok(message) => {
                        let _ = events.send(ConnectionEvent::ChannelMessage {
                            label: label.to_string(),
                            message,
                        });
                    }
                    Err(err) => {
                        tracing::debug!(
                            target: "connection",
                            label = %label,
                            error = %err,
                            "dropping malformed data channel frame"
                        );
                    }
                }
            })
        }));

        let close_events = events.clone();
        let close_readiness = Arc::clone(&self.readiness);
        channel.on_close(Box::new(move || {
            let events = close_events.clone();
            let readiness = Arc::clone(&close_readiness);
            Box::pin(async move {
                readiness.set(label, false);
                let _ = events.send(ConnectionEvent::ChannelClosed {
                    label: label.to_string(),
                });
            })
        }));

        channel.on_error(Box::new(move |err| {
            Box::pin(async move {
                tracing::warn!(target: "connection", label = %label, error = %err, "data channel error");
            })
        }));

        Ok(channel)
    }

    /// Attaches senders for `tracks`, tagged with `purpose`, then
    /// renegotiates. One `TrackAdded` event is emitted per track.
    pub async fn add_tracks(
        &self,
        purpose: TrackPurpose,
        tracks: Vec<LocalTrack>,
    ) -> Result<(), NegotiationError> {
        let pc = self.require_pc().await?;
        for track in tracks {
            let track_id = track.id().to_string();
            let sender = pc.add_track(track).await?;
            self.senders
                .lock()
                .await
                .push(TaggedSender { purpose, sender });
            self.emit(ConnectionEvent::TrackAdded {
                track_id,
                track_type: purpose,
            })
            .await;
        }
        self.negotiate().await
    }

    /// Detaches every sender tagged with `purpose`, then renegotiates.
    /// A no-op when nothing carries the tag.
    pub async fn remove_tracks(&self, purpose: TrackPurpose) -> Result<(), NegotiationError> {
        let pc = self.require_pc().await?;
        let removed = {
            let mut senders = self.senders.lock().await;
            let mut kept = Vec::new();
            let mut removed = Vec::new();
            for tagged in senders.drain(..) {
                if tagged.purpose == purpose {
                    removed.push(tagged.sender);
                } else {
                    kept.push(tagged);
                }
            }
            *senders = kept;
            removed
        };
        if removed.is_empty() {
            return Ok(());
        }
        for sender in removed {
            pc.remove_track(&sender).await?;
        }
        self.negotiate().await
    }

    /// Offer-only renegotiation. While an offer is unanswered the request
    /// is coalesced; the follow-up offer runs after the answer lands.
    async fn negotiate(&self) -> Result<(), NegotiationError> {
        {
            let mut negotiation = self.negotiation.lock().await;
            if negotiation.offer_outstanding {
                negotiation.renegotiate_pending = true;
                tracing::debug!(target: "connection", "offer outstanding; renegotiation queued");
                return Ok(());
            }
            negotiation.offer_outstanding = true;
        }
        if let Err(err) = self.send_offer().await {
            self.negotiation.lock().await.offer_outstanding = false;
            return Err(err);
        }
        Ok(())
    }

    async fn send_offer(&self) -> Result<(), NegotiationError> {
        let pc = self.require_pc().await?;
        let offer = pc.create_offer(None).await?;
        let sdp = serde_json::to_string(&offer)
            .map_err(|err| NegotiationError::MalformedSdp(err.to_string()))?;
        pc.set_local_description(offer).await?;
        *self.phase.write().await = ConnectionPhase::Negotiating;
        tracing::debug!(target: "connection", "local offer set");
        self.emit(ConnectionEvent::Offer { sdp }).await;
        Ok(())
    }

    /// Applies a remote answer, flushes candidates buffered while no
    /// remote description was set, and runs any coalesced renegotiation.
    pub async fn set_remote_answer(&self, content: &str) -> Result<(), NegotiationError> {
        let pc = self.require_pc().await?;
        let answer: RTCSessionDescription = serde_json::from_str(content)
            .map_err(|err| NegotiationError::MalformedSdp(err.to_string()))?;
        pc.set_remote_description(answer).await?;
        self.remote_description_set.store(true, Ordering::SeqCst);

        let buffered = {
            let mut pending = self.pending_candidates.lock().await;
            std::mem::take(&mut *pending)
        };
        for candidate in buffered {
            if let Err(err) = pc.add_ice_candidate(candidate).await {
                tracing::warn!(target: "connection", error = %err, "buffered candidate rejected");
            }
        }

        let renegotiate = {
            let mut negotiation = self.negotiation.lock().await;
            negotiation.offer_outstanding = false;
            std::mem::take(&mut negotiation.renegotiate_pending)
        };
        if renegotiate {
            self.negotiate().await?;
        }
        Ok(())
    }

    /// Candidates arriving before the remote description are buffered and
    /// added once [`Self::set_remote_answer`] runs.
    pub async fn add_remote_candidate(&self, content: &str) -> Result<(), NegotiationError> {
        let init: RTCIceCandidateInit = serde_json::from_str(content)
            .map_err(|err| NegotiationError::MalformedCandidate(err.to_string()))?;
        if !self.remote_description_set.load(Ordering::SeqCst) {
            self.pending_candidates.lock().await.push(init);
            return Ok(());
        }
        let pc = self.require_pc().await?;
        pc.add_ice_candidate(init).await?;
        Ok(())
    }

    /// Fire-and-forget, mirroring the signaling channel's discipline:
    /// no buffering, and a not-open channel reports `NotReady`.
    pub async fn send_data_channel_message(
        &self,
        label: &str,
        message: &DataChannelMessage,
    ) -> SendOutcome {
        let channel = match label {
            CHAT_CHANNEL => self.chat_channel.read().await.clone(),
            MEDIA_CHANNEL => self.media_channel.read().await.clone(),
            _ => None,
        };
        let Some(channel) = channel else {
            return SendOutcome::NotReady;
        };
        if channel.ready_state() != RTCDataChannelState::Open {
            return SendOutcome::NotReady;
        }
        let Ok(text) = serde_json::to_string(message) else {
            return SendOutcome::NotReady;
        };
        match channel.send_text(text).await {
            Ok(_) => SendOutcome::Sent,
            Err(err) => {
                tracing::debug!(target: "connection", label = %label, error = %err, "data channel send failed");
                SendOutcome::NotReady
            }
        }
    }

    /// Removes all senders, closes both data channels and the transport,
    /// and clears every reference. Idempotent, callable from any state.
    pub async fn close(&self) {
        let pc = self.pc.write().await.take();
        let chat = self.chat_channel.write().await.take();
        let media = self.media_channel.write().await.take();
        self.events.write().await.take();
        *self.remote_audio.write().await = None;
        self.readiness.set(CHAT_CHANNEL, false);
        self.readiness.set(MEDIA_CHANNEL, false);
        self.remote_description_set.store(false, Ordering::SeqCst);
        self.pending_candidates.lock().await.clear();
        *self.negotiation.lock().await = NegotiationState::default();

        let senders: Vec<TaggedSender> = self.senders.lock().await.drain(..).collect();
        if let Some(pc) = pc {
            for tagged in senders {
                if let Err(err) = pc.remove_track(&tagged.sender).await {
                    tracing::trace!(target: "connection", error = %err, "sender removal during close");
                }
            }
            if let Some(chat) = chat {
                let _ = chat.close().await;
            }
            if let Some(media) = media {
                let _ = media.close().await;
            }
            if let Err(err) = pc.close().await {
                tracing::debug!(target: "connection", error = %err, "peer connection close");
            }
        }
        *self.phase.write().await = ConnectionPhase::Closed;
    }

    async fn require_pc(&self) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        self.pc
            .read()
            .await
            .clone()
            .ok_or(NegotiationError::NotCreated)
    }

    async fn emit(&self, event: ConnectionEvent) {
        let guard = self.events.read().await;
        if let Some(events) = guard.as_ref() {
            let _ = events.send(event);
        }
    }
}
