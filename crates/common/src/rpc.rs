//! Multiplexed RPC frame protocol.
//!
//! Frames are JSON text messages carried over a WebSocket. Every exchange is
//! identified by a client-allocated stream id; stream id 0 addresses the
//! connection itself.

use crate::auth::Credentials;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Exchange identifier, unique among in-flight exchanges of one connection.
pub type StreamId = u32;

/// Stream id reserved for connection-level frames.
pub const CONNECTION_STREAM_ID: StreamId = 0;

// ============================================================================
// Client → Server Frames
// ============================================================================

/// Frame sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Connection setup, optionally carrying connection-wide credentials.
    Setup {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Credentials>,
    },
    /// Request expecting exactly one response.
    RequestResponse {
        stream_id: StreamId,
        route: String,
        #[serde(default)]
        data: Value,
        /// Per-exchange credentials, overriding the setup credentials.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Credentials>,
    },
    /// Request expecting a stream of responses.
    RequestStream {
        stream_id: StreamId,
        route: String,
        #[serde(default)]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Credentials>,
    },
    /// Cancel an in-flight exchange.
    Cancel { stream_id: StreamId },
}

impl ClientFrame {
    pub fn stream_id(&self) -> StreamId {
        match self {
            ClientFrame::Setup { .. } => CONNECTION_STREAM_ID,
            ClientFrame::RequestResponse { stream_id, .. }
            | ClientFrame::RequestStream { stream_id, .. }
            | ClientFrame::Cancel { stream_id } => *stream_id,
        }
    }
}

// ============================================================================
// Server → Client Frames
// ============================================================================

/// Frame sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// One payload of an exchange.
    Next { stream_id: StreamId, data: Value },
    /// Successful end of an exchange.
    Complete { stream_id: StreamId },
    /// Failed end of an exchange, or of the connection when `stream_id` is 0.
    Error {
        stream_id: StreamId,
        code: ErrorCode,
        message: String,
    },
}

impl ServerFrame {
    pub fn stream_id(&self) -> StreamId {
        match self {
            ServerFrame::Next { stream_id, .. }
            | ServerFrame::Complete { stream_id }
            | ServerFrame::Error { stream_id, .. } => *stream_id,
        }
    }

    /// Whether this frame ends its exchange.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ServerFrame::Next { .. })
    }

    pub fn error(stream_id: StreamId, code: ErrorCode, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            stream_id,
            code,
            message: message.into(),
        }
    }
}

/// Error codes carried by [`ServerFrame::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Setup frame out of place.
    InvalidSetup,
    /// Setup credentials were rejected; the connection is closed.
    RejectedSetup,
    /// Secured route invoked without a resolved principal.
    Unauthorized,
    /// Malformed or unroutable request.
    Invalid,
    /// Handler failed and no recovery was registered.
    ApplicationError,
}
