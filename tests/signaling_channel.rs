use assistant_realtime::protocol::{
    CLIENT_HEARTBEAT, CLIENT_OFFER, SIGNALING_ANSWER, SIGNALING_CONNECTED, SignalingEnvelope,
};
use assistant_realtime::signaling::{SignalingChannel, SignalingError, SignalingEvent};
use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::routing::get;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use url::Url;

struct WsScript {
    send_on_connect: Vec<String>,
    close_after_send: bool,
}

async fn serve_ws(script: WsScript) -> (Url, mpsc::UnboundedReceiver<String>) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let shared = Arc::new((script, inbound_tx));
    let app = Router::new().route(
        "/handler/signaling/connection",
        get(move |ws: WebSocketUpgrade| {
            let shared = Arc::clone(&shared);
            async move { ws.on_upgrade(move |socket| run_socket(socket, shared)) }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server");
    });
    let url = Url::parse(&format!(
        "ws://{addr}/handler/signaling/connection?token=test-token"
    ))
    .expect("url");
    (url, inbound_rx)
}

async fn run_socket(mut socket: WebSocket, shared: Arc<(WsScript, mpsc::UnboundedSender<String>)>) {
    for frame in &shared.0.send_on_connect {
        if socket.send(WsMessage::Text(frame.clone())).await.is_err() {
            return;
        }
    }
    if shared.0.close_after_send {
        let _ = socket.send(WsMessage::Close(None)).await;
        return;
    }
    while let Some(Ok(message)) = socket.recv().await {
        if let WsMessage::Text(text) = message {
            let _ = shared.1.send(text);
        }
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event wait timed out")
        .expect("event stream ended")
}

async fn next_frame(frames: &mut mpsc::UnboundedReceiver<String>) -> SignalingEnvelope {
    let text = timeout(Duration::from_secs(5), frames.recv())
        .await
        .expect("frame wait timed out")
        .expect("socket gone");
    serde_json::from_str(&text).expect("envelope json")
}

// Heartbeats are unwanted noise in most assertions.
async fn next_non_heartbeat(frames: &mut mpsc::UnboundedReceiver<String>) -> SignalingEnvelope {
    loop {
        let envelope = next_frame(frames).await;
        if envelope.event != CLIENT_HEARTBEAT {
            return envelope;
        }
    }
}

#[tokio::test]
async fn open_precedes_envelopes_and_order_is_preserved() {
    let connected = SignalingEnvelope::client(SIGNALING_CONNECTED, "ch", "signaling", "{}");
    let answer = SignalingEnvelope::client(SIGNALING_ANSWER, "ch", "signaling", "{}");
    let (url, _frames) = serve_ws(WsScript {
        send_on_connect: vec![
            serde_json::to_string(&connected).unwrap(),
            serde_json::to_string(&answer).unwrap(),
        ],
        close_after_send: false,
    })
    .await;

    let (channel, mut events) = SignalingChannel::open(url, Duration::from_secs(60))
        .await
        .expect("open");
    assert_eq!(next_event(&mut events).await, SignalingEvent::Open);
    assert_eq!(next_event(&mut events).await, SignalingEvent::Envelope(connected));
    assert_eq!(next_event(&mut events).await, SignalingEvent::Envelope(answer));
    channel.close();
}

#[tokio::test]
async fn malformed_inbound_frames_are_dropped() {
    let valid = SignalingEnvelope::client(SIGNALING_ANSWER, "ch", "signaling", "{}");
    let (url, _frames) = serve_ws(WsScript {
        send_on_connect: vec![
            "not json at all".to_string(),
            serde_json::to_string(&valid).unwrap(),
        ],
        close_after_send: false,
    })
    .await;

    let (channel, mut events) = SignalingChannel::open(url, Duration::from_secs(60))
        .await
        .expect("open");
    assert_eq!(next_event(&mut events).await, SignalingEvent::Open);
    // The garbage frame produces no event; the next one is the valid envelope.
    assert_eq!(next_event(&mut events).await, SignalingEvent::Envelope(valid));
    channel.close();
}

#[tokio::test]
async fn heartbeat_flows_on_the_configured_interval() {
    let (url, mut frames) = serve_ws(WsScript {
        send_on_connect: vec![],
        close_after_send: false,
    })
    .await;

    let (channel, _events) = SignalingChannel::open(url, Duration::from_millis(50))
        .await
        .expect("open");
    let beat = next_frame(&mut frames).await;
    assert_eq!(beat.event, CLIENT_HEARTBEAT);
    let beat = next_frame(&mut frames).await;
    assert_eq!(beat.event, CLIENT_HEARTBEAT);
    channel.close();
}

#[tokio::test]
async fn send_delivers_while_open_and_reports_not_ready_after_close() {
    let (url, mut frames) = serve_ws(WsScript {
        send_on_connect: vec![],
        close_after_send: false,
    })
    .await;

    let (channel, _events) = SignalingChannel::open(url, Duration::from_secs(60))
        .await
        .expect("open");
    let envelope = SignalingEnvelope::client(CLIENT_OFFER, "ch", "browser", "{\"sdp\":\"x\"}");
    assert!(channel.send(&envelope).is_sent());
    let received = next_non_heartbeat(&mut frames).await;
    assert_eq!(received.event, CLIENT_OFFER);
    assert_eq!(received.data.content, "{\"sdp\":\"x\"}");

    channel.close();
    assert!(!channel.send(&envelope).is_sent());
    // Idempotent.
    channel.close();
    assert!(!channel.is_open());
}

#[tokio::test]
async fn remote_close_emits_closed_once() {
    let (url, _frames) = serve_ws(WsScript {
        send_on_connect: vec![],
        close_after_send: true,
    })
    .await;

    let (channel, mut events) = SignalingChannel::open(url, Duration::from_secs(60))
        .await
        .expect("open");
    assert_eq!(next_event(&mut events).await, SignalingEvent::Open);
    assert!(matches!(
        next_event(&mut events).await,
        SignalingEvent::Closed { .. }
    ));
    assert!(!channel.is_open());
    assert!(!channel
        .send(&SignalingEnvelope::heartbeat())
        .is_sent());
}

#[tokio::test]
async fn connect_refusal_surfaces_as_error() {
    let url = Url::parse("ws://127.0.0.1:1/handler/signaling/connection?token=t").unwrap();
    let err = SignalingChannel::open(url, Duration::from_secs(60))
        .await
        .err()
        .expect("refused");
    assert!(matches!(err, SignalingError::Connect(_)));
}
