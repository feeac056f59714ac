//! Duplex WebSocket binding.
//!
//! Every decodable inbound frame starts another independent greeting stream
//! on the same socket. Each stream is a subscription of the connection, so
//! closing the socket stops all of them.

use crate::error::Result;
use crate::subscription::{ConnectionState, Subscription, TransportKind};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use common::{GreetingEvent, GreetingRequest, GreetingResponse};
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Keep-alive ping period.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Error frame sent for frames that cannot be decoded.
#[derive(Debug, Serialize)]
struct SocketError {
    error: String,
    code: &'static str,
}

/// WebSocket upgrade handler for `/ws/greetings`.
pub async fn ws_greetings_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(state.outbound_buffer);

    let guard = state.registry.connect(TransportKind::DuplexSocket);
    let connection = Arc::clone(guard.connection());
    let connection_id = connection.id;

    info!("Socket client {} connected", connection_id);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut ping_interval = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(msg)) => {
                        if let Err(e) = handle_message(&state, &connection, &tx, msg) {
                            warn!("Rejected frame from {}: {}", connection_id, e);
                            counter!("greeting_socket_rejected_frames_total").increment(1);
                            if !send_error(&tx, e.to_string()) {
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", connection_id, e);
                        break;
                    }
                }
            }

            _ = ping_interval.tick() => {
                if let Err(TrySendError::Closed(_)) = tx.try_send(Message::Ping(Default::default())) {
                    break;
                }
            }
        }
    }

    // Cancels every stream started on this socket.
    drop(guard);
    send_task.abort();

    info!("Socket client {} disconnected", connection_id);
}

/// Handle one inbound frame. Only data frames start streams.
fn handle_message(
    state: &Arc<AppState>,
    connection: &Arc<ConnectionState>,
    tx: &mpsc::Sender<Message>,
    msg: Message,
) -> Result<()> {
    let request: GreetingRequest = match msg {
        Message::Text(text) => serde_json::from_str(&text)?,
        Message::Binary(data) => serde_json::from_slice(&data)?,
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => return Ok(()),
    };

    let subscription = connection.open();
    debug!(
        "Socket client {} started stream {} for {}",
        connection.id,
        subscription.id(),
        request.name
    );
    let events = state.source.greetings(request);
    tokio::spawn(pump(subscription, events, tx.clone()));
    Ok(())
}

/// Forward one greeting stream to the socket until cancelled.
async fn pump(
    subscription: Subscription,
    mut events: BoxStream<'static, GreetingEvent>,
    tx: mpsc::Sender<Message>,
) {
    loop {
        let event = tokio::select! {
            biased;

            _ = subscription.cancelled() => break,
            event = events.next() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let text = match serde_json::to_string(&GreetingResponse::from(event)) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode greeting: {}", e);
                break;
            }
        };

        // Awaiting capacity applies backpressure; cancellation still wins.
        tokio::select! {
            biased;

            _ = subscription.cancelled() => break,
            sent = tx.send(Message::Text(text.into())) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    debug!(
        "Socket stream {} of {} stopped",
        subscription.id(),
        subscription.connection_id()
    );
}

/// Queue an error frame. Returns false once the socket writer is gone.
fn send_error(tx: &mpsc::Sender<Message>, error: String) -> bool {
    let frame = SocketError {
        error,
        code: "INVALID_REQUEST",
    };
    let text = match serde_json::to_string(&frame) {
        Ok(text) => text,
        Err(_) => return true,
    };
    !matches!(
        tx.try_send(Message::Text(text.into())),
        Err(TrySendError::Closed(_))
    )
}
