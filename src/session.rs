//! Top-level session coordinator.
//!
//! Sequences authorization, signaling and the peer connection into one
//! connect/disconnect lifecycle, routes inbound envelopes, and runs the
//! periodic frame emitters. All session state lives here and changes only
//! through named transitions; observers get immutable snapshots.

use crate::auth::{AccessToken, AuthError, AuthorizationClient};
use crate::config::{ConfigError, RealtimeConfig};
use crate::connection::{ConnectionEvent, ConnectionOrchestrator, NegotiationError, TrackPurpose};
use crate::media::{FrameSource, MediaError, MediaProvider};
use crate::protocol::{
    CAMERA_IMAGE_CLEAR, CAMERA_IMAGE_DATA, CHAT_CHANNEL, CHAT_MESSAGE_INPUT, CLIENT_CANDIDATE,
    CLIENT_OFFER, CLIENT_TRACK_ADDED, DRAW_IMAGE_CLEAR, DRAW_IMAGE_DATA, DataChannelMessage,
    IceServersPayload, MEDIA_CHANNEL, SCREENSHARE_IMAGE_CLEAR, SCREENSHARE_IMAGE_DATA,
    SIGNALING_ANSWER, SIGNALING_CANDIDATE, SIGNALING_CONNECTED, SendOutcome, SignalingEnvelope,
    TrackAddedPayload,
};
use crate::signaling::{SignalingChannel, SignalingError, SignalingEvent};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}

/// A surface whose frames are shipped over the `media` data channel while
/// it is active. Each active surface owns exactly one timer; the timers
/// are mutually independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Surface {
    Camera,
    Screenshare,
    Draw,
}

impl Surface {
    pub fn as_str(self) -> &'static str {
        match self {
            Surface::Camera => "camera",
            Surface::Screenshare => "screenshare",
            Surface::Draw => "draw",
        }
    }

    fn data_event(self) -> &'static str {
        match self {
            Surface::Camera => CAMERA_IMAGE_DATA,
            Surface::Screenshare => SCREENSHARE_IMAGE_DATA,
            Surface::Draw => DRAW_IMAGE_DATA,
        }
    }

    fn clear_event(self) -> &'static str {
        match self {
            Surface::Camera => CAMERA_IMAGE_CLEAR,
            Surface::Screenshare => SCREENSHARE_IMAGE_CLEAR,
            Surface::Draw => DRAW_IMAGE_CLEAR,
        }
    }
}

/// Session state snapshot. Constructed with everything false/empty and
/// both panels hidden; every transition keeps the invariants that
/// `connecting` and `connected` are never both true and that at most one
/// of the draw/message panels is visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub connected: bool,
    pub connecting: bool,
    pub error: String,
    pub draw_hidden: bool,
    pub message_hidden: bool,
    pub camera_active: bool,
    pub screenshare_active: bool,
    pub message_input: String,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            connected: false,
            connecting: false,
            error: String::new(),
            draw_hidden: true,
            message_hidden: true,
            camera_active: false,
            screenshare_active: false,
            message_input: String::new(),
        }
    }
}

impl SessionState {
    pub fn begin_connecting(&mut self) {
        self.connecting = true;
        self.connected = false;
        self.error.clear();
    }

    pub fn mark_connected(&mut self) {
        self.connected = true;
        self.connecting = false;
        self.error.clear();
    }

    pub fn fail(&mut self, error: String) {
        self.connecting = false;
        self.connected = false;
        self.error = error;
    }

    pub fn surface_error(&mut self, error: String) {
        self.error = error;
    }

    pub fn reset(&mut self) {
        *self = SessionState::default();
    }

    /// Opening the draw panel forces the message panel closed in the same
    /// transition, and vice versa.
    pub fn toggle_draw_panel(&mut self) {
        if self.draw_hidden {
            self.message_hidden = true;
        }
        self.draw_hidden = !self.draw_hidden;
    }

    pub fn toggle_message_panel(&mut self) {
        if self.message_hidden {
            self.draw_hidden = true;
        }
        self.message_hidden = !self.message_hidden;
    }
}

/// A message received on one of the data channels.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub label: String,
    pub message: DataChannelMessage,
}

pub struct SessionController {
    config: RealtimeConfig,
    auth: AuthorizationClient,
    media: Arc<dyn MediaProvider>,
    orchestrator: ConnectionOrchestrator,
    state: Mutex<SessionState>,
    state_tx: watch::Sender<SessionState>,
    signaling: Mutex<Option<Arc<SignalingChannel>>>,
    token: Mutex<Option<AccessToken>>,
    frame_sources: Mutex<HashMap<Surface, Arc<dyn FrameSource>>>,
    emitters: Mutex<HashMap<Surface, JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    open_channels: Mutex<HashSet<String>>,
    inbound_tx: broadcast::Sender<InboundMessage>,
    generation: AtomicU64,
}

impl SessionController {
    pub fn new(
        config: RealtimeConfig,
        media: Arc<dyn MediaProvider>,
    ) -> Result<Arc<Self>, SessionError> {
        let auth = AuthorizationClient::new(&config)?;
        let (state_tx, _) = watch::channel(SessionState::default());
        let (inbound_tx, _) = broadcast::channel(64);
        Ok(Arc::new(Self {
            config,
            auth,
            media,
            orchestrator: ConnectionOrchestrator::new(),
            state: Mutex::new(SessionState::default()),
            state_tx,
            signaling: Mutex::new(None),
            token: Mutex::new(None),
            frame_sources: Mutex::new(HashMap::new()),
            emitters: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            open_channels: Mutex::new(HashSet::new()),
            inbound_tx,
            generation: AtomicU64::new(0),
        }))
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound_tx.subscribe()
    }

    pub fn orchestrator(&self) -> &ConnectionOrchestrator {
        &self.orchestrator
    }

    /// Registers the frame supplier for a surface. The emitter for that
    /// surface reads it on every tick while the surface is active.
    pub fn set_frame_source(&self, surface: Surface, source: Arc<dyn FrameSource>) {
        self.frame_sources.lock().insert(surface, source);
    }

    /// Connect/disconnect toggle: there is exactly one user-facing
    /// affordance, so a call while connecting or connected disconnects
    /// instead. No stage of the sequence carries a timeout; a hung
    /// authorization or signaling open leaves the session `connecting`
    /// until this is called again.
    pub async fn connect(self: &Arc<Self>) {
        let generation = self.generation.load(Ordering::SeqCst);
        // Guard and transition under one lock so concurrent calls cannot
        // both start the sequence.
        let started = {
            let mut state = self.state.lock();
            if state.connecting || state.connected {
                false
            } else {
                state.begin_connecting();
                true
            }
        };
        if !started {
            self.disconnect().await;
            return;
        }
        self.state_tx.send_replace(self.state.lock().clone());

        if let Err(err) = self.run_connect(generation).await {
            tracing::warn!(target: "session", error = %err, "connect failed");
            self.abort_connect(err.to_string()).await;
        }
    }

    /// Tears everything down: emitters (each sends its `*:clear`),
    /// media, peer connection, signaling, token, tasks. Safe to call at
    /// any point in the connect sequence; also invoked on transport-level
    /// close from either the signaling channel or the peer connection.
    pub async fn disconnect(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        tracing::info!(target: "session", "disconnecting");
        self.close_transports().await;
        self.update(|state| state.reset());
    }

    async fn abort_connect(&self, reason: String) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.close_transports().await;
        self.update(|state| state.fail(reason));
    }

    async fn run_connect(self: &Arc<Self>, generation: u64) -> Result<(), SessionError> {
        let token = self.auth.fetch_token(self.config.role()).await?;
        if self.stale(generation) {
            return Ok(());
        }

        let url = self.config.signaling_endpoint(&token.token)?;
        let (channel, mut events) =
            SignalingChannel::open(url, self.config.heartbeat_interval()).await?;
        if self.stale(generation) {
            channel.close();
            return Ok(());
        }
        *self.signaling.lock() = Some(Arc::new(channel));
        *self.token.lock() = Some(token);

        let controller = Arc::clone(self);
        let router = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if controller.stale(generation) {
                    break;
                }
                match event {
                    SignalingEvent::Open => {
                        tracing::debug!(
                            target: "session",
                            "signaling open; awaiting signaling:connected"
                        );
                    }
                    SignalingEvent::Envelope(envelope) => {
                        controller.handle_envelope(generation, envelope).await;
                    }
                    SignalingEvent::Closed { reason } => {
                        tracing::info!(
                            target: "session",
                            reason = reason.as_deref().unwrap_or("remote close"),
                            "signaling channel closed"
                        );
                        if !controller.stale(generation) {
                            controller.disconnect().await;
                        }
                        break;
                    }
                }
            }
        });
        self.tasks.lock().push(router);
        Ok(())
    }

    async fn handle_envelope(self: &Arc<Self>, generation: u64, envelope: SignalingEnvelope) {
        match envelope.event.as_str() {
            SIGNALING_CONNECTED => self.on_signaling_connected(generation, &envelope).await,
            // Malformed or late negotiation input is dropped, never fatal.
            SIGNALING_ANSWER => {
                if let Err(err) = self
                    .orchestrator
                    .set_remote_answer(&envelope.data.content)
                    .await
                {
                    tracing::warn!(target: "session", error = %err, "remote answer dropped");
                }
            }
            SIGNALING_CANDIDATE => {
                if let Err(err) = self
                    .orchestrator
                    .add_remote_candidate(&envelope.data.content)
                    .await
                {
                    tracing::warn!(target: "session", error = %err, "remote candidate dropped");
                }
            }
            other => {
                tracing::trace!(target: "session", event = other, "unhandled signaling event");
            }
        }
    }

    /// Authorization success does not imply the signaling service is
    /// ready; negotiation starts only on its `signaling:connected`
    /// envelope, which carries the ICE server urls.
    async fn on_signaling_connected(self: &Arc<Self>, generation: u64, envelope: &SignalingEnvelope) {
        let payload: IceServersPayload = match serde_json::from_str(&envelope.data.content) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(target: "session", error = %err, "bad signaling:connected payload");
                return;
            }
        };

        let captured = match self.media.acquire_media().await {
            Ok(captured) => captured,
            Err(err) => {
                tracing::warn!(target: "session", error = %err, "media acquisition failed");
                self.abort_connect(err.to_string()).await;
                return;
            }
        };
        if self.stale(generation) {
            return;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if let Err(err) = self
            .orchestrator
            .create_connection(payload.urls, events_tx)
            .await
        {
            self.abort_connect(err.to_string()).await;
            return;
        }
        self.spawn_connection_router(generation, events_rx);

        let audio = self
            .orchestrator
            .add_tracks(TrackPurpose::Audio, vec![captured.audio_track.clone()])
            .await;
        let camera = self
            .orchestrator
            .add_tracks(TrackPurpose::Camera, vec![captured.video_track.clone()])
            .await;
        if let Err(err) = audio.and(camera) {
            self.abort_connect(err.to_string()).await;
        }
    }

    fn spawn_connection_router(
        self: &Arc<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let controller = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if controller.stale(generation) {
                    break;
                }
                match event {
                    ConnectionEvent::Created => {
                        tracing::debug!(target: "session", "peer connection created");
                    }
                    ConnectionEvent::TrackAdded {
                        track_id,
                        track_type,
                    } => {
                        let payload = TrackAddedPayload {
                            track_id,
                            track_type: track_type.as_str().to_string(),
                        };
                        let content = serde_json::to_string(&payload).unwrap_or_default();
                        controller.send_signal(CLIENT_TRACK_ADDED, content);
                    }
                    ConnectionEvent::Offer { sdp } => {
                        controller.send_signal(CLIENT_OFFER, sdp);
                    }
                    ConnectionEvent::Candidate { candidate } => {
                        controller.send_signal(CLIENT_CANDIDATE, candidate);
                    }
                    ConnectionEvent::ChannelOpen { label } => {
                        controller.on_channel_open(&label);
                    }
                    ConnectionEvent::ChannelMessage { label, message } => {
                        let _ = controller.inbound_tx.send(InboundMessage { label, message });
                    }
                    ConnectionEvent::ChannelClosed { label } => {
                        tracing::debug!(target: "session", label = %label, "data channel closed");
                        let connected = controller.state.lock().connected;
                        if connected && !controller.stale(generation) {
                            controller.disconnect().await;
                            break;
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    /// Marshals an orchestrator event onto the signaling channel.
    /// Fire-and-forget, like every send on this transport.
    fn send_signal(&self, event: &str, content: String) -> SendOutcome {
        let Some((channel_id, from)) = ({
            let token = self.token.lock();
            token
                .as_ref()
                .map(|token| (token.channel.clone(), token.role.clone()))
        }) else {
            return SendOutcome::NotReady;
        };
        let envelope = SignalingEnvelope::client(event, channel_id, from, content);
        let channel = self.signaling.lock().clone();
        match channel {
            Some(channel) => channel.send(&envelope),
            None => SendOutcome::NotReady,
        }
    }

    fn on_channel_open(&self, label: &str) {
        let ready = {
            let mut open = self.open_channels.lock();
            open.insert(label.to_string());
            open.contains(CHAT_CHANNEL) && open.contains(MEDIA_CHANNEL)
        };
        tracing::debug!(target: "session", label = %label, ready, "data channel open");
        if ready {
            self.update(|state| state.mark_connected());
        }
    }

    /// Sends one chat line over the `chat` data channel.
    pub async fn send_chat(&self, text: impl Into<String>) -> SendOutcome {
        if !self.state.lock().connected {
            return SendOutcome::NotReady;
        }
        let message = DataChannelMessage::new(CHAT_MESSAGE_INPUT, text);
        self.orchestrator
            .send_data_channel_message(CHAT_CHANNEL, &message)
            .await
    }

    pub fn set_message_input(&self, input: impl Into<String>) {
        self.update(|state| state.message_input = input.into());
    }

    pub async fn toggle_draw_panel(self: &Arc<Self>) {
        if !self.state.lock().connected {
            return;
        }
        let mut visible = false;
        self.update(|state| {
            state.toggle_draw_panel();
            visible = !state.draw_hidden;
        });
        if visible {
            self.start_emitter(Surface::Draw);
        } else {
            self.stop_emitter(Surface::Draw, true).await;
        }
    }

    pub async fn toggle_message_panel(self: &Arc<Self>) {
        if !self.state.lock().connected {
            return;
        }
        let mut draw_was_visible = false;
        self.update(|state| {
            draw_was_visible = !state.draw_hidden;
            state.toggle_message_panel();
        });
        // Opening the message panel hides a visible draw panel; the draw
        // emitter stops with it.
        if draw_was_visible {
            self.stop_emitter(Surface::Draw, true).await;
        }
    }

    /// Gates the camera frame emitter; deactivation blanks the remote
    /// view with `camera:image:clear`. Activation requires a registered
    /// camera frame source.
    pub async fn set_camera_active(self: &Arc<Self>, active: bool) {
        if active && !self.frame_sources.lock().contains_key(&Surface::Camera) {
            tracing::debug!(
                target: "session",
                "camera activation without a frame source ignored"
            );
            return;
        }
        let changed = {
            let state = self.state.lock();
            state.connected && state.camera_active != active
        };
        if !changed {
            return;
        }
        self.update(|state| state.camera_active = active);
        if active {
            self.start_emitter(Surface::Camera);
        } else {
            self.stop_emitter(Surface::Camera, true).await;
        }
    }

    /// Starts screensharing: display capture, a distinctly-tagged video
    /// sender (renegotiation), and the screenshare frame emitter.
    /// Declining the OS share picker is an expected user action and a
    /// silent no-op; every other media error surfaces.
    pub async fn start_screenshare(self: &Arc<Self>) {
        {
            let state = self.state.lock();
            if !state.connected {
                return;
            }
            if state.screenshare_active {
                drop(state);
                self.stop_screenshare().await;
                return;
            }
        }

        let display = match self.media.acquire_display().await {
            Ok(display) => display,
            Err(MediaError::PermissionDenied) => {
                tracing::debug!(target: "session", "screenshare declined by user");
                return;
            }
            Err(err) => {
                self.update(|state| state.surface_error(err.to_string()));
                return;
            }
        };

        if let Err(err) = self
            .orchestrator
            .add_tracks(TrackPurpose::Screenshare, vec![display.video_track])
            .await
        {
            tracing::warn!(target: "session", error = %err, "screenshare track attach failed");
            self.update(|state| state.surface_error(err.to_string()));
            return;
        }
        self.update(|state| state.screenshare_active = true);
        self.start_emitter(Surface::Screenshare);
    }

    pub async fn stop_screenshare(&self) {
        if !self.state.lock().screenshare_active {
            return;
        }
        self.stop_emitter(Surface::Screenshare, true).await;
        if let Err(err) = self
            .orchestrator
            .remove_tracks(TrackPurpose::Screenshare)
            .await
        {
            tracing::warn!(target: "session", error = %err, "screenshare track detach failed");
        }
        self.update(|state| state.screenshare_active = false);
    }

    /// One timer per active surface. Each tick captures the current frame
    /// and ships it over the `media` channel; frames are dropped when the
    /// channel is not ready. The fixed period is a deliberate frame
    /// budget; there is no buffered-amount backpressure.
    fn start_emitter(self: &Arc<Self>, surface: Surface) {
        let Some(source) = self.frame_sources.lock().get(&surface).cloned() else {
            tracing::debug!(target: "session", surface = surface.as_str(), "no frame source registered");
            return;
        };
        let mut emitters = self.emitters.lock();
        if emitters.contains_key(&surface) {
            return;
        }
        let controller = Arc::clone(self);
        let period = self.config.frame_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(frame) = source.capture_frame() else {
                    continue;
                };
                let message = DataChannelMessage::new(surface.data_event(), frame);
                let outcome = controller
                    .orchestrator
                    .send_data_channel_message(MEDIA_CHANNEL, &message)
                    .await;
                if outcome == SendOutcome::NotReady {
                    tracing::trace!(
                        target: "session",
                        surface = surface.as_str(),
                        "media channel not ready; frame dropped"
                    );
                }
            }
        });
        emitters.insert(surface, task);
    }

    async fn stop_emitter(&self, surface: Surface, send_clear: bool) {
        let task = self.emitters.lock().remove(&surface);
        let Some(task) = task else {
            return;
        };
        task.abort();
        if send_clear {
            let message = DataChannelMessage::new(surface.clear_event(), String::new());
            let _ = self
                .orchestrator
                .send_data_channel_message(MEDIA_CHANNEL, &message)
                .await;
        }
    }

    async fn stop_all_emitters(&self, send_clear: bool) {
        let surfaces: Vec<Surface> = self.emitters.lock().keys().copied().collect();
        for surface in surfaces {
            self.stop_emitter(surface, send_clear).await;
        }
    }

    async fn close_transports(&self) {
        self.stop_all_emitters(true).await;
        self.media.release().await;
        self.orchestrator.close().await;
        let signaling = self.signaling.lock().take();
        if let Some(channel) = signaling {
            channel.close();
        }
        self.token.lock().take();
        self.open_channels.lock().clear();
        // Abort routers last: when a router triggered this teardown, the
        // remaining cleanup after its own abort must be synchronous.
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }

    fn stale(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    fn update(&self, apply: impl FnOnce(&mut SessionState)) {
        let snapshot = {
            let mut state = self.state.lock();
            apply(&mut state);
            state.clone()
        };
        self.state_tx.send_replace(snapshot);
    }
}
