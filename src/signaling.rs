//! Persistent duplex connection to the signaling service.
//!
//! One WebSocket per session, scoped by the access token. Outbound
//! envelopes are fire-and-forget: a send while the transport is not open
//! is dropped and reported as [`SendOutcome::NotReady`]. The channel never
//! reconnects on its own; reconnection is a fresh connect cycle with a
//! fresh token.

use crate::protocol::{SendOutcome, SignalingEnvelope};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("websocket connect failed: {0}")]
    Connect(String),
}

/// Lifecycle of one signaling connection, delivered in transport order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// Emitted exactly once, before any envelope.
    Open,
    Envelope(SignalingEnvelope),
    /// Transport error and remote close both converge here, once.
    Closed { reason: Option<String> },
}

pub struct SignalingChannel {
    outbound: mpsc::UnboundedSender<SignalingEnvelope>,
    open: Arc<AtomicBool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Establishes the transport and spawns the writer, reader and
    /// heartbeat tasks. The returned receiver yields [`SignalingEvent`]s
    /// until the channel closes.
    pub async fn open(
        url: Url,
        heartbeat_interval: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>), SignalingError> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SignalingError::Connect(err.to_string()))?;
        tracing::debug!(target: "signaling", url = %url, "websocket connected");

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<SignalingEnvelope>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<SignalingEvent>();
        let open = Arc::new(AtomicBool::new(true));

        let _ = events_tx.send(SignalingEvent::Open);

        let writer = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                match serde_json::to_string(&envelope) {
                    Ok(text) => {
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target: "signaling", error = %err, "envelope serialization failed");
                    }
                }
            }
        });

        let reader_open = Arc::clone(&open);
        let reader_events = events_tx.clone();
        let reader = tokio::spawn(async move {
            let mut reason = None;
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => forward_envelope(&reader_events, text.as_bytes()),
                    Ok(Message::Binary(data)) => forward_envelope(&reader_events, &data),
                    Ok(Message::Close(close)) => {
                        reason = close.map(|frame| frame.reason.to_string());
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(target: "signaling", error = %err, "websocket error");
                        reason = Some(err.to_string());
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            let _ = reader_events.send(SignalingEvent::Closed { reason });
        });

        let heartbeat_outbound = outbound.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            // interval fires immediately; the first beat goes one period in.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_outbound
                    .send(SignalingEnvelope::heartbeat())
                    .is_err()
                {
                    break;
                }
            }
        });

        let channel = Self {
            outbound,
            open,
            tasks: Mutex::new(vec![writer, reader, heartbeat]),
        };
        Ok((channel, events_rx))
    }

    /// Fire-and-forget. Dropped (with `NotReady`) when the transport is
    /// not open; callers needing reliability check [`Self::is_open`] first.
    pub fn send(&self, envelope: &SignalingEnvelope) -> SendOutcome {
        if !self.is_open() {
            return SendOutcome::NotReady;
        }
        match self.outbound.send(envelope.clone()) {
            Ok(()) => SendOutcome::Sent,
            Err(_) => SendOutcome::NotReady,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Idempotent; stops the heartbeat and releases the transport.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn forward_envelope(events: &mpsc::UnboundedSender<SignalingEvent>, raw: &[u8]) {
    match serde_json::from_slice::<SignalingEnvelope>(raw) {
        Ok(envelope) => {
            let _ = events.send(SignalingEvent::Envelope(envelope));
        }
        Err(err) => {
            tracing::debug!(target: "signaling", error = %err, "dropping malformed envelope");
        }
    }
}
