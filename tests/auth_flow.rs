use assistant_realtime::auth::{AuthError, AuthorizationClient};
use assistant_realtime::config::RealtimeConfig;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server");
    });
    addr
}

fn client_for(addr: SocketAddr) -> AuthorizationClient {
    // A loopback origin routes authorization through the origin itself.
    let config = RealtimeConfig::new(
        format!("http://{addr}"),
        "https://auth.example.com",
        "browser",
    )
    .expect("config");
    AuthorizationClient::new(&config).expect("client")
}

#[tokio::test]
async fn token_issued_on_code_zero() {
    let app = Router::new().route(
        "/handler/oauth/access_token",
        get(|Query(params): Query<HashMap<String, String>>| async move {
            assert_eq!(params.get("role").map(String::as_str), Some("browser"));
            Json(json!({
                "code": 0,
                "data": {
                    "access_token": "tok-123",
                    "role": "browser",
                    "channel": "ch-9"
                }
            }))
        }),
    );
    let addr = serve(app).await;

    let token = client_for(addr).fetch_token("browser").await.expect("token");
    assert_eq!(token.token, "tok-123");
    assert_eq!(token.role, "browser");
    assert_eq!(token.channel, "ch-9");
}

#[tokio::test]
async fn nonzero_code_is_a_rejection_even_on_http_200() {
    let app = Router::new().route(
        "/handler/oauth/access_token",
        get(|| async { Json(json!({"code": 7, "message": "channel full"})) }),
    );
    let addr = serve(app).await;

    let err = client_for(addr)
        .fetch_token("browser")
        .await
        .expect_err("rejection");
    match err {
        AuthError::Rejected(detail) => assert!(detail.contains("channel full"), "{detail}"),
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn http_error_status_is_a_rejection() {
    let app = Router::new().route(
        "/handler/oauth/access_token",
        get(|| async { StatusCode::FORBIDDEN.into_response() }),
    );
    let addr = serve(app).await;

    let err = client_for(addr)
        .fetch_token("browser")
        .await
        .expect_err("rejection");
    assert!(matches!(err, AuthError::Rejected(_)), "{err:?}");
}

#[tokio::test]
async fn missing_token_payload_is_a_rejection() {
    let app = Router::new().route(
        "/handler/oauth/access_token",
        get(|| async { Json::<Value>(json!({"code": 0})) }),
    );
    let addr = serve(app).await;

    let err = client_for(addr)
        .fetch_token("browser")
        .await
        .expect_err("rejection");
    match err {
        AuthError::Rejected(detail) => assert!(detail.contains("payload"), "{detail}"),
        other => panic!("expected Rejected, got {other:?}"),
    }
}
