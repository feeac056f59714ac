//! RPC client error types.

use common::rpc::ErrorCode;
use thiserror::Error;

/// RPC client error type.
#[derive(Debug, Error)]
pub enum Error {
    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Endpoint URL could not be parsed.
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    /// The connection ended before the exchange terminated.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The server ended the exchange (or the connection) with an error frame.
    #[error("Remote error {code:?}: {message}")]
    Remote { code: ErrorCode, message: String },

    /// The stream was not read fast enough and its exchange was cancelled.
    #[error("Stream {0} fell behind and was cancelled")]
    Lagged(common::rpc::StreamId),

    /// A request/response exchange completed without a payload.
    #[error("Exchange completed without a response")]
    EmptyResponse,
}

/// Result type for RPC client operations.
pub type Result<T> = std::result::Result<T, Error>;
