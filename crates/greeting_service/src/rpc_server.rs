//! Multiplexed RPC binding.
//!
//! JSON frames over a WebSocket. Exchanges are dispatched through an explicit
//! route table; each runs in its own task as a subscription of the connection,
//! keyed by the client's stream id.

use crate::error::{Error, Result};
use crate::source::StreamSource;
use crate::subscription::{ConnectionState, Subscription, TransportKind};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use common::rpc::{ClientFrame, ErrorCode, ServerFrame, StreamId, CONNECTION_STREAM_ID};
use common::{Credentials, GreetingRequest, Principal};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, Stream};
use futures::{Future, SinkExt, StreamExt};
use metrics::counter;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const ROUTE_GREETINGS: &str = "greetings";
pub const ROUTE_GREETING: &str = "greeting";
pub const ROUTE_ERROR_SIGNAL: &str = "error-signal";

/// Keep-alive ping period.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long queued frames may take to flush after the read loop ends.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub type ResponseFuture = BoxFuture<'static, Result<Value>>;
pub type ResponseStream = BoxStream<'static, Result<Value>>;

/// Handler registered for one route.
#[derive(Clone)]
pub enum RpcHandler {
    RequestResponse(Arc<dyn Fn(Value) -> ResponseFuture + Send + Sync>),
    RequestStream(Arc<dyn Fn(Value) -> ResponseStream + Send + Sync>),
}

impl RpcHandler {
    fn interaction(&self) -> &'static str {
        match self {
            RpcHandler::RequestResponse(_) => "request_response",
            RpcHandler::RequestStream(_) => "request_stream",
        }
    }
}

/// Route name to handler dispatch table.
#[derive(Clone, Default)]
pub struct RpcRoutes {
    handlers: HashMap<String, RpcHandler>,
}

impl RpcRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route answering with exactly one payload.
    pub fn request_response<F, Fut>(mut self, route: &str, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.handlers.insert(
            route.to_string(),
            RpcHandler::RequestResponse(Arc::new(move |data| handler(data).boxed())),
        );
        self
    }

    /// Register a route answering with a stream of payloads.
    pub fn request_stream<F, S>(mut self, route: &str, handler: F) -> Self
    where
        F: Fn(Value) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Value>> + Send + 'static,
    {
        self.handlers.insert(
            route.to_string(),
            RpcHandler::RequestStream(Arc::new(move |data| handler(data).boxed())),
        );
        self
    }

    pub fn get(&self, route: &str) -> Option<&RpcHandler> {
        self.handlers.get(route)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// The greeting routes: `greetings`, `greeting` and `error-signal`.
    pub fn greetings(source: StreamSource) -> Self {
        let stream_source = source.clone();
        Self::new()
            .request_stream(ROUTE_GREETINGS, move |data| {
                match serde_json::from_value::<GreetingRequest>(data) {
                    Ok(request) => stream_source
                        .greetings(request)
                        .map(|event| serde_json::to_value(event).map_err(Error::from))
                        .boxed(),
                    Err(e) => stream::once(async move { Err(Error::from(e)) }).boxed(),
                }
            })
            .request_response(ROUTE_GREETING, move |data| {
                let source = source.clone();
                async move {
                    let request: GreetingRequest = serde_json::from_value(data)?;
                    Ok(serde_json::to_value(source.greet(&request.name))?)
                }
            })
            .request_response(ROUTE_ERROR_SIGNAL, |_data| async {
                Err(Error::Validation("Invalid input error".to_string()))
            })
    }
}

/// Per-connection protocol state.
#[derive(Default)]
struct Session {
    principal: Option<Principal>,
    setup_seen: bool,
    exchanges_seen: bool,
}

enum Flow {
    Continue,
    Close,
}

/// WebSocket upgrade handler for `/rpc`.
pub async fn rpc_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(state.outbound_buffer);

    let guard = state.registry.connect(TransportKind::MultiplexedRpc);
    let connection = Arc::clone(guard.connection());
    let connection_id = connection.id;

    info!("RPC client {} connected", connection_id);

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut ping_interval = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut session = Session::default();
    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                let decoded = match msg {
                    Some(Ok(Message::Text(text))) => serde_json::from_str::<ClientFrame>(&text),
                    Some(Ok(Message::Binary(data))) => serde_json::from_slice::<ClientFrame>(&data),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", connection_id, e);
                        break;
                    }
                };

                let flow = match decoded {
                    Ok(frame) => handle_frame(&state, &connection, &mut session, &tx, frame).await,
                    Err(e) => {
                        warn!("Undecodable frame from {}: {}", connection_id, e);
                        reject(&tx, CONNECTION_STREAM_ID, ErrorCode::Invalid, e.to_string()).await
                    }
                };
                if let Flow::Close = flow {
                    break;
                }
            }

            _ = ping_interval.tick() => {
                if let Err(TrySendError::Closed(_)) = tx.try_send(Message::Ping(Default::default())) {
                    break;
                }
            }
        }
    }

    // Cancel every exchange, then let already queued frames flush.
    drop(guard);
    drop(tx);
    if tokio::time::timeout(DRAIN_TIMEOUT, &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }

    info!("RPC client {} disconnected", connection_id);
}

async fn handle_frame(
    state: &Arc<AppState>,
    connection: &Arc<ConnectionState>,
    session: &mut Session,
    tx: &mpsc::Sender<Message>,
    frame: ClientFrame,
) -> Flow {
    match frame {
        ClientFrame::Setup { metadata } => {
            if session.setup_seen || session.exchanges_seen {
                return reject(
                    tx,
                    CONNECTION_STREAM_ID,
                    ErrorCode::InvalidSetup,
                    "setup must be the first frame and sent once",
                )
                .await;
            }
            session.setup_seen = true;

            if let Some(credentials) = metadata {
                match state.credentials.authenticate(&credentials) {
                    Some(principal) => {
                        info!("RPC client {} authenticated as {}", connection.id, principal);
                        session.principal = Some(principal);
                    }
                    None => {
                        warn!(
                            "RPC client {} rejected setup for {}",
                            connection.id, credentials.username
                        );
                        reject(
                            tx,
                            CONNECTION_STREAM_ID,
                            ErrorCode::RejectedSetup,
                            "Invalid credentials",
                        )
                        .await;
                        return Flow::Close;
                    }
                }
            }
            Flow::Continue
        }
        ClientFrame::RequestResponse {
            stream_id,
            route,
            data,
            metadata,
        } => {
            session.exchanges_seen = true;
            let exchange = Exchange {
                stream_id,
                route,
                data,
                metadata,
                interaction: "request_response",
            };
            start_exchange(state, connection, session, tx, exchange).await
        }
        ClientFrame::RequestStream {
            stream_id,
            route,
            data,
            metadata,
        } => {
            session.exchanges_seen = true;
            let exchange = Exchange {
                stream_id,
                route,
                data,
                metadata,
                interaction: "request_stream",
            };
            start_exchange(state, connection, session, tx, exchange).await
        }
        ClientFrame::Cancel { stream_id } => {
            if connection.cancel(stream_id as u64) {
                debug!("RPC client {} cancelled stream {}", connection.id, stream_id);
            } else {
                debug!(
                    "RPC client {} cancelled unknown stream {}",
                    connection.id, stream_id
                );
            }
            Flow::Continue
        }
    }
}

/// One inbound request awaiting dispatch.
struct Exchange {
    stream_id: StreamId,
    route: String,
    data: Value,
    metadata: Option<Credentials>,
    interaction: &'static str,
}

async fn start_exchange(
    state: &Arc<AppState>,
    connection: &Arc<ConnectionState>,
    session: &Session,
    tx: &mpsc::Sender<Message>,
    exchange: Exchange,
) -> Flow {
    let stream_id = exchange.stream_id;
    if stream_id == CONNECTION_STREAM_ID {
        return reject(tx, stream_id, ErrorCode::Invalid, "stream id 0 is reserved").await;
    }

    let Some(subscription) = connection.open_with_id(stream_id as u64) else {
        let err = Error::DuplicateStream(stream_id);
        return reject(tx, stream_id, err.code(), err.to_string()).await;
    };

    let principal = match &exchange.metadata {
        Some(credentials) => match state.credentials.authenticate(credentials) {
            Some(principal) => Some(principal),
            None => {
                let err = Error::Unauthorized("Invalid credentials".to_string());
                return reject(tx, stream_id, err.code(), err.to_string()).await;
            }
        },
        None => session.principal.clone(),
    };

    if state.secured_routes.contains(&exchange.route) && principal.is_none() {
        counter!("greeting_rpc_unauthorized_total", "route" => exchange.route.clone())
            .increment(1);
        let err = Error::Unauthorized(format!("route '{}' requires a principal", exchange.route));
        return reject(tx, stream_id, err.code(), err.to_string()).await;
    }

    let handler = match state.routes.get(&exchange.route) {
        Some(handler) if handler.interaction() == exchange.interaction => handler.clone(),
        Some(_) => {
            let err = Error::UnsupportedInteraction {
                route: exchange.route,
                interaction: exchange.interaction,
            };
            return reject(tx, stream_id, err.code(), err.to_string()).await;
        }
        None => {
            let err = Error::UnknownRoute(exchange.route);
            return reject(tx, stream_id, err.code(), err.to_string()).await;
        }
    };

    counter!("greeting_rpc_exchanges_total", "route" => exchange.route.clone()).increment(1);
    debug!(
        "RPC client {} stream {} -> {} ({})",
        connection.id,
        stream_id,
        exchange.route,
        principal.as_ref().map(Principal::name).unwrap_or("anonymous")
    );

    tokio::spawn(run_exchange(
        Arc::clone(state),
        subscription,
        exchange.route,
        handler,
        exchange.data,
        tx.clone(),
    ));
    Flow::Continue
}

/// Drive one exchange to its terminal frame, or stop silently on cancel.
async fn run_exchange(
    state: Arc<AppState>,
    subscription: Subscription,
    route: String,
    handler: RpcHandler,
    data: Value,
    tx: mpsc::Sender<Message>,
) {
    let stream_id = subscription.id() as StreamId;

    let terminal = match handler {
        RpcHandler::RequestResponse(handler) => {
            let result = tokio::select! {
                biased;

                _ = subscription.cancelled() => return,
                result = handler(data) => result,
            };
            match result {
                Ok(value) => vec![
                    ServerFrame::Next {
                        stream_id,
                        data: value,
                    },
                    ServerFrame::Complete { stream_id },
                ],
                Err(err) => failure_frames(&state, &route, stream_id, err),
            }
        }
        RpcHandler::RequestStream(handler) => {
            let mut items = handler(data);
            loop {
                let item = tokio::select! {
                    biased;

                    _ = subscription.cancelled() => return,
                    item = items.next() => item,
                };
                match item {
                    Some(Ok(value)) => {
                        let next = ServerFrame::Next {
                            stream_id,
                            data: value,
                        };
                        if !emit(&subscription, &tx, &next).await {
                            return;
                        }
                    }
                    Some(Err(err)) => break failure_frames(&state, &route, stream_id, err),
                    None => break vec![ServerFrame::Complete { stream_id }],
                }
            }
        }
    };

    for frame in &terminal {
        if !emit(&subscription, &tx, frame).await {
            return;
        }
    }
    debug!(
        "RPC client {} stream {} finished",
        subscription.connection_id(),
        stream_id
    );
}

/// Frames ending a failed exchange: the recovered fallback followed by
/// completion, or an error frame when nothing recovers it.
fn failure_frames(
    state: &AppState,
    route: &str,
    stream_id: StreamId,
    err: Error,
) -> Vec<ServerFrame> {
    match state.interceptor.recover(route, &err) {
        Some(fallback) => vec![
            ServerFrame::Next {
                stream_id,
                data: fallback,
            },
            ServerFrame::Complete { stream_id },
        ],
        None => {
            warn!(route = %route, error = %err, "RPC exchange {} failed", stream_id);
            counter!("greeting_rpc_errors_total", "route" => route.to_string()).increment(1);
            vec![ServerFrame::error(stream_id, err.code(), err.to_string())]
        }
    }
}

/// Queue a frame for the exchange. Returns false if the exchange was
/// cancelled or the connection writer is gone.
async fn emit(subscription: &Subscription, tx: &mpsc::Sender<Message>, frame: &ServerFrame) -> bool {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode frame: {}", e);
            return false;
        }
    };

    tokio::select! {
        biased;

        _ = subscription.cancelled() => false,
        sent = tx.send(Message::Text(text.into())) => sent.is_ok(),
    }
}

/// Send an error frame from the read loop.
async fn reject(
    tx: &mpsc::Sender<Message>,
    stream_id: StreamId,
    code: ErrorCode,
    message: impl Into<String>,
) -> Flow {
    let frame = ServerFrame::error(stream_id, code, message);
    let text = match serde_json::to_string(&frame) {
        Ok(text) => text,
        Err(_) => return Flow::Continue,
    };
    match tx.send(Message::Text(text.into())).await {
        Ok(()) => Flow::Continue,
        Err(_) => Flow::Close,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::ErrorInterceptor;
    use serde_json::json;

    #[tokio::test]
    async fn test_greeting_route_answers_once() {
        let routes = RpcRoutes::greetings(StreamSource::default());
        let Some(RpcHandler::RequestResponse(handler)) = routes.get(ROUTE_GREETING) else {
            panic!("greeting should be request/response");
        };

        let value = handler(json!({"name": "Ada"})).await.unwrap();
        assert!(value["message"].as_str().unwrap().starts_with("Hello Ada @ "));
    }

    #[tokio::test]
    async fn test_error_signal_raises_validation_error() {
        let routes = RpcRoutes::greetings(StreamSource::default());
        let Some(RpcHandler::RequestResponse(handler)) = routes.get(ROUTE_ERROR_SIGNAL) else {
            panic!("error-signal should be request/response");
        };

        let err = handler(Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(
            ErrorInterceptor::with_default_fallback().recover(ROUTE_ERROR_SIGNAL, &err),
            Some(json!("OoOps!"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_greetings_route_streams() {
        let routes = RpcRoutes::greetings(StreamSource::new(Duration::from_millis(100)));
        let Some(RpcHandler::RequestStream(handler)) = routes.get(ROUTE_GREETINGS) else {
            panic!("greetings should be request/stream");
        };

        let items: Vec<_> = handler(json!({"name": "Bob"})).take(3).collect().await;
        assert_eq!(items.len(), 3);
        for item in items {
            assert!(item.unwrap()["message"].as_str().unwrap().contains("Bob"));
        }
    }

    #[tokio::test]
    async fn test_greetings_route_rejects_bad_payload() {
        let routes = RpcRoutes::greetings(StreamSource::default());
        let Some(RpcHandler::RequestStream(handler)) = routes.get(ROUTE_GREETINGS) else {
            panic!("greetings should be request/stream");
        };

        let items: Vec<_> = handler(json!({"nom": 1})).collect().await;
        assert_eq!(items.len(), 1);
        let err = items.into_iter().next().unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::Invalid);
    }

    #[test]
    fn test_route_table() {
        let routes = RpcRoutes::greetings(StreamSource::default());
        assert_eq!(routes.len(), 3);
        assert_eq!(
            routes.get(ROUTE_GREETINGS).map(RpcHandler::interaction),
            Some("request_stream")
        );
        assert!(routes.get("missing").is_none());
    }
}
