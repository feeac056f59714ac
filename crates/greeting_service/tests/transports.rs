//! End-to-end tests of the three bindings against a loopback server.

use common::rpc::{ErrorCode, ServerFrame};
use common::{Credentials, GreetingEvent, GreetingRequest, GreetingResponse};
use futures::{SinkExt, StreamExt};
use greeting_service::{create_router, serve, AppState, ServiceConfig};
use rpc_client::{Error as RpcError, RpcClient, RpcClientConfig};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type RawSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn_service(greeting_interval: Duration) -> (SocketAddr, Arc<AppState>) {
    let config = ServiceConfig {
        greeting_interval,
        ..ServiceConfig::default()
    };
    let state = Arc::new(AppState::from_config(&config).unwrap());
    let app = create_router(Arc::clone(&state));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

/// Poll until `condition` holds, panicking after `limit`.
async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached within {:?}", limit);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn rpc_config(addr: SocketAddr) -> RpcClientConfig {
    RpcClientConfig::new(format!("ws://{}/rpc", addr))
}

async fn raw_rpc(addr: SocketAddr) -> RawSocket {
    let (ws, _) = connect_async(format!("ws://{}/rpc", addr)).await.unwrap();
    ws
}

/// Next decoded server frame, skipping control messages.
async fn next_frame(ws: &mut RawSocket) -> ServerFrame {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("frame within timeout")
            .expect("socket open")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

// ============================================================================
// Push stream
// ============================================================================

#[tokio::test]
async fn test_sse_first_event_and_spacing() {
    let (addr, _state) = spawn_service(Duration::from_secs(1)).await;

    let start = Instant::now();
    let response = reqwest::get(format!("http://{}/greetings/Ada", addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let mut body = response.bytes_stream();
    let mut buffer = String::new();
    let mut arrivals = Vec::new();
    let mut events = Vec::new();

    while events.len() < 3 {
        let chunk = timeout(Duration::from_secs(3), body.next())
            .await
            .expect("event within timeout")
            .expect("stream open")
            .unwrap();
        buffer.push_str(std::str::from_utf8(&chunk).unwrap());

        while let Some(end) = buffer.find("\n\n") {
            let block: String = buffer.drain(..end + 2).collect();
            for line in block.lines() {
                if let Some(data) = line.strip_prefix("data:") {
                    let event: GreetingEvent = serde_json::from_str(data.trim()).unwrap();
                    arrivals.push(start.elapsed());
                    events.push(event);
                }
            }
        }
    }

    assert!(arrivals[0] <= Duration::from_millis(1100), "first event at {:?}", arrivals[0]);
    for pair in arrivals.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= Duration::from_millis(900) && gap <= Duration::from_millis(1100),
            "gap {:?}",
            gap
        );
    }
    assert!(events.iter().all(|e| e.message.starts_with("Hello Ada @ ")));
}

#[tokio::test]
async fn test_sse_disconnect_releases_subscription() {
    let (addr, state) = spawn_service(Duration::from_millis(50)).await;

    let response = reqwest::get(format!("http://{}/greetings/Ada", addr))
        .await
        .unwrap();
    let mut body = response.bytes_stream();
    body.next().await.unwrap().unwrap();
    assert_eq!(state.registry.subscription_count(), 1);

    drop(body);

    let registry = Arc::clone(&state.registry);
    wait_until(Duration::from_secs(2), || registry.subscription_count() == 0).await;
    assert_eq!(registry.connection_count(), 0);
}

#[tokio::test]
async fn test_shutdown_completes_with_open_push_stream() {
    let config = ServiceConfig {
        greeting_interval: Duration::from_millis(50),
        ..ServiceConfig::default()
    };
    let state = Arc::new(AppState::from_config(&config).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(serve(listener, Arc::clone(&state), async move {
        let _ = shutdown_rx.await;
    }));

    let response = reqwest::get(format!("http://{}/greetings/Ada", addr))
        .await
        .unwrap();
    let mut body = response.bytes_stream();
    body.next().await.unwrap().unwrap();
    assert_eq!(state.registry.subscription_count(), 1);

    shutdown_tx.send(()).unwrap();

    timeout(Duration::from_secs(5), server)
        .await
        .expect("server stops while a push stream is open")
        .unwrap()
        .unwrap();
    assert_eq!(state.registry.connection_count(), 0);
}

// ============================================================================
// Duplex socket
// ============================================================================

#[tokio::test]
async fn test_socket_fans_out_and_stops_on_close() {
    let (addr, state) = spawn_service(Duration::from_millis(100)).await;
    let (mut ws, _) = connect_async(format!("ws://{}/ws/greetings", addr))
        .await
        .unwrap();

    ws.send(Message::text(r#"{"name":"Bob"}"#)).await.unwrap();
    ws.send(Message::text(r#"{"name":"Bob"}"#)).await.unwrap();

    let mut received = 0;
    while received < 6 {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("frame within timeout")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            let response: GreetingResponse = serde_json::from_str(&text).unwrap();
            assert!(response.message.starts_with("Hello Bob @ "));
            received += 1;
        }
    }
    assert_eq!(state.registry.subscription_count(), 2);

    ws.close(None).await.unwrap();

    let registry = Arc::clone(&state.registry);
    wait_until(Duration::from_secs(2), || registry.subscription_count() == 0).await;
    assert_eq!(registry.connection_count(), 0);
}

#[tokio::test]
async fn test_socket_bad_frame_keeps_connection() {
    let (addr, _state) = spawn_service(Duration::from_millis(50)).await;
    let (mut ws, _) = connect_async(format!("ws://{}/ws/greetings", addr))
        .await
        .unwrap();

    ws.send(Message::text("not json")).await.unwrap();
    let msg = timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let error: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
    assert_eq!(error["code"], "INVALID_REQUEST");
    assert!(error["error"].is_string());

    ws.send(Message::text(r#"{"name":"Eve"}"#)).await.unwrap();
    let msg = timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let response: GreetingResponse = serde_json::from_str(msg.to_text().unwrap()).unwrap();
    assert!(response.message.contains("Eve"));
}

// ============================================================================
// Multiplexed RPC
// ============================================================================

#[tokio::test]
async fn test_rpc_error_signal_recovers_and_connection_survives() {
    let (addr, _state) = spawn_service(Duration::from_millis(50)).await;
    let client = RpcClient::connect(
        rpc_config(addr).with_credentials(Credentials::new("user", "user")),
    )
    .await
    .unwrap();

    let fallback: String = client
        .request_response("error-signal", &json!({}))
        .await
        .unwrap();
    assert_eq!(fallback, "OoOps!");

    let greeting: GreetingEvent = client
        .request_response("greeting", &GreetingRequest::new("Ada"))
        .await
        .unwrap();
    assert!(greeting.message.starts_with("Hello Ada @ "));

    client.close().await;
}

#[tokio::test]
async fn test_rpc_secured_route_requires_principal() {
    let (addr, _state) = spawn_service(Duration::from_millis(50)).await;
    let client = RpcClient::connect(rpc_config(addr)).await.unwrap();

    let err = client
        .request_response::<GreetingEvent, _>("greeting", &GreetingRequest::new("Ada"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Remote {
            code: ErrorCode::Unauthorized,
            ..
        }
    ));

    // Only that exchange failed.
    let fallback: String = client
        .request_response("error-signal", &json!({}))
        .await
        .unwrap();
    assert_eq!(fallback, "OoOps!");

    // Per-exchange credentials are enough.
    let greeting: GreetingEvent = client
        .request_response_with(
            "greeting",
            &GreetingRequest::new("Ada"),
            Some(Credentials::new("user", "user")),
        )
        .await
        .unwrap();
    assert!(greeting.message.contains("Ada"));
}

#[tokio::test]
async fn test_rpc_rejected_setup_closes_connection() {
    let (addr, _state) = spawn_service(Duration::from_millis(50)).await;
    let client = RpcClient::connect(
        rpc_config(addr).with_credentials(Credentials::new("user", "wrong")),
    )
    .await
    .unwrap();

    let err = client
        .request_response::<Value, _>("error-signal", &json!({}))
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            RpcError::Remote {
                code: ErrorCode::RejectedSetup,
                ..
            } | RpcError::ConnectionClosed
        ),
        "unexpected error: {:?}",
        err
    );
}

#[tokio::test]
async fn test_rpc_unknown_route_and_wrong_interaction() {
    let (addr, _state) = spawn_service(Duration::from_millis(50)).await;
    let client = RpcClient::connect(rpc_config(addr)).await.unwrap();

    let err = client
        .request_response::<Value, _>("nope", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Remote {
            code: ErrorCode::Invalid,
            ..
        }
    ));

    let mut stream = client
        .request_stream::<Value, _>("error-signal", &json!({}))
        .await
        .unwrap();
    let err = stream.next().await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        RpcError::Remote {
            code: ErrorCode::Invalid,
            ..
        }
    ));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_rpc_cancel_one_stream_leaves_others_running() {
    let (addr, state) = spawn_service(Duration::from_millis(50)).await;
    let client = RpcClient::connect(rpc_config(addr)).await.unwrap();

    let mut first = client
        .request_stream::<GreetingEvent, _>("greetings", &GreetingRequest::new("Ada"))
        .await
        .unwrap();
    let mut second = client
        .request_stream::<GreetingEvent, _>("greetings", &GreetingRequest::new("Bob"))
        .await
        .unwrap();

    assert!(first.next().await.unwrap().unwrap().message.contains("Ada"));
    assert!(second.next().await.unwrap().unwrap().message.contains("Bob"));
    assert_eq!(state.registry.subscription_count(), 2);

    drop(first);

    let registry = Arc::clone(&state.registry);
    wait_until(Duration::from_secs(2), || registry.subscription_count() == 1).await;

    for _ in 0..3 {
        let event = timeout(Duration::from_secs(1), second.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(event.message.contains("Bob"));
    }

    drop(second);
    client.close().await;
    wait_until(Duration::from_secs(2), || registry.subscription_count() == 0).await;
}

#[tokio::test]
async fn test_rpc_unread_stream_does_not_stall_connection() {
    let (addr, state) = spawn_service(Duration::from_millis(5)).await;
    let client = RpcClient::connect(rpc_config(addr)).await.unwrap();

    let mut unread = client
        .request_stream::<GreetingEvent, _>("greetings", &GreetingRequest::new("Ada"))
        .await
        .unwrap();
    // Far more than the per-exchange buffer arrives meanwhile.
    tokio::time::sleep(Duration::from_millis(800)).await;

    let fallback: String = timeout(
        Duration::from_secs(3),
        client.request_response("error-signal", &json!({})),
    )
    .await
    .expect("request/response not held up by the unread stream")
    .unwrap();
    assert_eq!(fallback, "OoOps!");

    // The laggard was cancelled on both ends and reports why.
    let registry = Arc::clone(&state.registry);
    wait_until(Duration::from_secs(2), || registry.subscription_count() == 0).await;
    let mut lagged = false;
    while let Some(item) = timeout(Duration::from_secs(2), unread.next()).await.unwrap() {
        if let Err(err) = item {
            lagged = matches!(err, RpcError::Lagged(id) if id == unread.stream_id());
            break;
        }
    }
    assert!(lagged);
    assert!(unread.next().await.is_none());
}

#[tokio::test]
async fn test_rpc_second_setup_is_invalid() {
    let (addr, _state) = spawn_service(Duration::from_millis(50)).await;
    let mut ws = raw_rpc(addr).await;

    ws.send(Message::text(r#"{"type":"setup"}"#)).await.unwrap();
    ws.send(Message::text(r#"{"type":"setup"}"#)).await.unwrap();
    match next_frame(&mut ws).await {
        ServerFrame::Error {
            stream_id, code, ..
        } => {
            assert_eq!(stream_id, 0);
            assert_eq!(code, ErrorCode::InvalidSetup);
        }
        other => panic!("expected error frame, got {:?}", other),
    }

    // The connection is still usable.
    ws.send(Message::text(
        r#"{"type":"request_response","stream_id":1,"route":"error-signal","data":{}}"#,
    ))
    .await
    .unwrap();
    assert_eq!(
        next_frame(&mut ws).await,
        ServerFrame::Next {
            stream_id: 1,
            data: json!("OoOps!")
        }
    );
    assert_eq!(next_frame(&mut ws).await, ServerFrame::Complete { stream_id: 1 });

    // Setup after a request is out of place too.
    ws.send(Message::text(r#"{"type":"setup"}"#)).await.unwrap();
    assert!(matches!(
        next_frame(&mut ws).await,
        ServerFrame::Error {
            stream_id: 0,
            code: ErrorCode::InvalidSetup,
            ..
        }
    ));
}

#[tokio::test]
async fn test_rpc_duplicate_stream_id_is_invalid() {
    let (addr, state) = spawn_service(Duration::from_millis(50)).await;
    let mut ws = raw_rpc(addr).await;
    let request = r#"{"type":"request_stream","stream_id":1,"route":"greetings","data":{"name":"Ada"}}"#;

    ws.send(Message::text(request)).await.unwrap();
    assert!(matches!(
        next_frame(&mut ws).await,
        ServerFrame::Next { stream_id: 1, .. }
    ));

    ws.send(Message::text(request)).await.unwrap();
    let code = loop {
        match next_frame(&mut ws).await {
            ServerFrame::Next { .. } => continue,
            ServerFrame::Error {
                stream_id: 1, code, ..
            } => break code,
            other => panic!("unexpected frame {:?}", other),
        }
    };
    assert_eq!(code, ErrorCode::Invalid);

    // The original exchange keeps running.
    assert_eq!(state.registry.subscription_count(), 1);
    assert!(matches!(
        next_frame(&mut ws).await,
        ServerFrame::Next { stream_id: 1, .. }
    ));
}

#[tokio::test]
async fn test_health_reports_counts() {
    let (addr, _state) = spawn_service(Duration::from_millis(50)).await;
    let health: Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["subscriptions"], 0);
}
