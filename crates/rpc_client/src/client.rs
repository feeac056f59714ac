//! RPC connection, exchange multiplexing and typed request helpers.

use crate::error::{Error, Result};
use common::rpc::{ClientFrame, ErrorCode, ServerFrame, StreamId, CONNECTION_STREAM_ID};
use common::Credentials;
use dashmap::DashMap;
use futures::stream::{SplitStream, Stream};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::env;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Streams = Arc<DashMap<StreamId, Exchange>>;
type ConnectionError = Arc<Mutex<Option<(ErrorCode, String)>>>;

/// Reader-side handle of one in-flight exchange.
struct Exchange {
    tx: mpsc::Sender<ServerFrame>,
    /// Set when the reader dropped the exchange because `tx` was full.
    lagged: Arc<AtomicBool>,
}

/// Configuration for the RPC client.
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:8080/rpc`.
    pub url: String,
    /// Connection-wide credentials sent with setup.
    pub credentials: Option<Credentials>,
    pub connect_timeout: Duration,
    /// Frames buffered per exchange and for the outbound socket. A stream
    /// that falls this far behind is cancelled so it cannot stall the others.
    pub buffer: usize,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/rpc".to_string(),
            credentials: None,
            connect_timeout: Duration::from_secs(5),
            buffer: 64,
        }
    }
}

impl RpcClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Read `RPC_URL`, `RPC_USERNAME` and `RPC_PASSWORD`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = env::var("RPC_URL") {
            config.url = url;
        }
        if let (Ok(username), Ok(password)) = (env::var("RPC_USERNAME"), env::var("RPC_PASSWORD")) {
            config.credentials = Some(Credentials::new(username, password));
        }
        config
    }
}

/// Client side of one multiplexed RPC connection.
pub struct RpcClient {
    outbound: mpsc::Sender<Message>,
    streams: Streams,
    connection_error: ConnectionError,
    next_stream_id: AtomicU32,
    buffer: usize,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RpcClient {
    /// Connect and send the setup frame.
    pub async fn connect(config: RpcClientConfig) -> Result<Self> {
        let url = Url::parse(&config.url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::UnsupportedScheme(url.scheme().to_string()));
        }

        info!("Connecting to RPC endpoint: {}", url);
        let (ws_stream, response) =
            tokio::time::timeout(config.connect_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| Error::ConnectTimeout(url.to_string()))??;
        debug!("RPC handshake complete, status: {:?}", response.status());

        let (mut write, read) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(config.buffer);

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let streams: Streams = Arc::new(DashMap::new());
        let connection_error: ConnectionError = Arc::new(Mutex::new(None));
        let reader = tokio::spawn(read_loop(
            read,
            Arc::clone(&streams),
            Arc::clone(&connection_error),
            outbound.clone(),
        ));

        let client = Self {
            outbound,
            streams,
            connection_error,
            next_stream_id: AtomicU32::new(1),
            // A request/response exchange needs room for next + complete.
            buffer: config.buffer.max(2),
            reader,
            writer,
        };
        client
            .send(&ClientFrame::Setup {
                metadata: config.credentials,
            })
            .await?;
        Ok(client)
    }

    /// Request exactly one typed response.
    pub async fn request_response<T, D>(&self, route: &str, data: &D) -> Result<T>
    where
        T: DeserializeOwned,
        D: Serialize + ?Sized,
    {
        self.request_response_with(route, data, None).await
    }

    /// Request exactly one typed response, with per-exchange credentials.
    pub async fn request_response_with<T, D>(
        &self,
        route: &str,
        data: &D,
        metadata: Option<Credentials>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        D: Serialize + ?Sized,
    {
        let data = serde_json::to_value(data)?;
        let (stream_id, mut rx, _) = self.allocate_stream();
        let frame = ClientFrame::RequestResponse {
            stream_id,
            route: route.to_string(),
            data,
            metadata,
        };
        if let Err(e) = self.send(&frame).await {
            self.streams.remove(&stream_id);
            return Err(e);
        }

        let mut payload = None;
        while let Some(frame) = rx.recv().await {
            match frame {
                ServerFrame::Next { data, .. } => payload = Some(data),
                ServerFrame::Complete { .. } => {
                    return match payload {
                        Some(value) => Ok(serde_json::from_value(value)?),
                        None => Err(Error::EmptyResponse),
                    };
                }
                ServerFrame::Error { code, message, .. } => {
                    return Err(Error::Remote { code, message });
                }
            }
        }
        Err(closed_error(&self.connection_error))
    }

    /// Request a stream of typed items.
    ///
    /// Dropping the returned stream before it terminates cancels the exchange.
    pub async fn request_stream<T, D>(&self, route: &str, data: &D) -> Result<RpcStream<T>>
    where
        T: DeserializeOwned,
        D: Serialize + ?Sized,
    {
        self.request_stream_with(route, data, None).await
    }

    pub async fn request_stream_with<T, D>(
        &self,
        route: &str,
        data: &D,
        metadata: Option<Credentials>,
    ) -> Result<RpcStream<T>>
    where
        T: DeserializeOwned,
        D: Serialize + ?Sized,
    {
        let data = serde_json::to_value(data)?;
        let (stream_id, rx, lagged) = self.allocate_stream();
        let frame = ClientFrame::RequestStream {
            stream_id,
            route: route.to_string(),
            data,
            metadata,
        };
        if let Err(e) = self.send(&frame).await {
            self.streams.remove(&stream_id);
            return Err(e);
        }

        Ok(RpcStream {
            stream_id,
            rx,
            outbound: self.outbound.clone(),
            streams: Arc::clone(&self.streams),
            connection_error: Arc::clone(&self.connection_error),
            lagged,
            done: false,
            _item: PhantomData,
        })
    }

    /// Number of exchanges still waiting for a terminal frame.
    pub fn in_flight(&self) -> usize {
        self.streams.len()
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_finished()
    }

    /// Close the socket and wait briefly for the server to acknowledge.
    pub async fn close(mut self) {
        let _ = self.outbound.send(Message::Close(None)).await;
        let _ = tokio::time::timeout(Duration::from_secs(1), &mut self.reader).await;
    }

    fn allocate_stream(&self) -> (StreamId, mpsc::Receiver<ServerFrame>, Arc<AtomicBool>) {
        // Client-initiated streams use odd ids.
        let stream_id = self.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        let lagged = Arc::new(AtomicBool::new(false));
        self.streams.insert(
            stream_id,
            Exchange {
                tx,
                lagged: Arc::clone(&lagged),
            },
        );
        (stream_id, rx, lagged)
    }

    async fn send(&self, frame: &ClientFrame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        self.outbound
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| closed_error(&self.connection_error))
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
        // Wake exchanges still waiting on this connection.
        self.streams.clear();
    }
}

/// Route server frames to their exchanges until the socket ends.
///
/// Never waits on an exchange: one unread stream must not hold up the rest
/// of the connection.
async fn read_loop(
    mut read: SplitStream<Socket>,
    streams: Streams,
    connection_error: ConnectionError,
    outbound: mpsc::Sender<Message>,
) {
    while let Some(msg) = read.next().await {
        let decoded = match msg {
            Ok(Message::Text(text)) => serde_json::from_str::<ServerFrame>(&text),
            Ok(Message::Binary(data)) => serde_json::from_slice::<ServerFrame>(&data),
            Ok(Message::Close(frame)) => {
                info!("RPC connection closed by server: {:?}", frame);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("RPC connection error: {:?}", e);
                break;
            }
        };

        let frame = match decoded {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Undecodable frame from server: {}", e);
                continue;
            }
        };

        let stream_id = frame.stream_id();
        if stream_id == CONNECTION_STREAM_ID {
            if let ServerFrame::Error { code, message, .. } = frame {
                warn!("Connection error {:?}: {}", code, message);
                let mut slot = connection_error
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                *slot = Some((code, message));
            }
            continue;
        }

        let terminal = frame.is_terminal();
        let delivered = match streams.get(&stream_id) {
            Some(exchange) => match exchange.tx.try_send(frame) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    exchange.lagged.store(true, Ordering::Release);
                    Err(true)
                }
                Err(TrySendError::Closed(_)) => Err(false),
            },
            None => {
                debug!("Frame for unknown stream {}", stream_id);
                continue;
            }
        };

        match delivered {
            Ok(()) if terminal => {
                streams.remove(&stream_id);
            }
            Ok(()) => {}
            Err(lagged) => {
                streams.remove(&stream_id);
                if lagged && !terminal {
                    warn!("Stream {} fell behind, cancelling", stream_id);
                    queue_cancel(&outbound, stream_id);
                }
            }
        }
    }

    streams.clear();
}

fn queue_cancel(outbound: &mpsc::Sender<Message>, stream_id: StreamId) {
    let frame = ClientFrame::Cancel { stream_id };
    if let Ok(text) = serde_json::to_string(&frame) {
        if outbound.try_send(Message::Text(text.into())).is_err() {
            debug!("Could not queue cancel for stream {}", stream_id);
        }
    }
}

fn closed_error(connection_error: &Mutex<Option<(ErrorCode, String)>>) -> Error {
    let slot = connection_error
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    match slot.as_ref() {
        Some((code, message)) => Error::Remote {
            code: *code,
            message: message.clone(),
        },
        None => Error::ConnectionClosed,
    }
}

/// Typed items of one request/stream exchange.
pub struct RpcStream<T> {
    stream_id: StreamId,
    rx: mpsc::Receiver<ServerFrame>,
    outbound: mpsc::Sender<Message>,
    streams: Streams,
    connection_error: ConnectionError,
    lagged: Arc<AtomicBool>,
    done: bool,
    _item: PhantomData<fn() -> T>,
}

impl<T> RpcStream<T> {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Cancel the exchange now instead of on drop.
    pub fn cancel(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if self.streams.remove(&self.stream_id).is_some() {
            queue_cancel(&self.outbound, self.stream_id);
        }
    }
}

impl<T: DeserializeOwned> Stream for RpcStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match ready!(this.rx.poll_recv(cx)) {
            Some(ServerFrame::Next { data, .. }) => {
                Poll::Ready(Some(serde_json::from_value(data).map_err(Error::from)))
            }
            Some(ServerFrame::Complete { .. }) => {
                this.done = true;
                Poll::Ready(None)
            }
            Some(ServerFrame::Error { code, message, .. }) => {
                this.done = true;
                Poll::Ready(Some(Err(Error::Remote { code, message })))
            }
            None => {
                this.done = true;
                let err = if this.lagged.load(Ordering::Acquire) {
                    Error::Lagged(this.stream_id)
                } else {
                    closed_error(&this.connection_error)
                };
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

impl<T> Drop for RpcStream<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = RpcClientConfig::new("ws://127.0.0.1:9000/rpc")
            .with_credentials(Credentials::new("user", "user"));
        assert_eq!(config.url, "ws://127.0.0.1:9000/rpc");
        assert_eq!(config.credentials.unwrap().username, "user");
        assert_eq!(config.buffer, 64);
    }

    #[tokio::test]
    async fn test_connect_rejects_http_scheme() {
        let result = RpcClient::connect(RpcClientConfig::new("http://localhost:8080/rpc")).await;
        assert!(matches!(result, Err(Error::UnsupportedScheme(scheme)) if scheme == "http"));
    }

    #[test]
    fn test_closed_error_prefers_connection_error() {
        let slot: ConnectionError = Arc::new(Mutex::new(None));
        assert!(matches!(closed_error(&slot), Error::ConnectionClosed));

        *slot.lock().unwrap() = Some((ErrorCode::RejectedSetup, "Invalid credentials".into()));
        assert!(matches!(
            closed_error(&slot),
            Error::Remote { code: ErrorCode::RejectedSetup, .. }
        ));
    }
}
