//! Greeting service error types.

use common::rpc::ErrorCode;
use thiserror::Error;

/// Greeting service error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Domain validation failure raised by a handler.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Secured route invoked without a principal.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// No handler registered for the route.
    #[error("Unknown route: {0}")]
    UnknownRoute(String),

    /// Route exists but does not serve this interaction model.
    #[error("Route {route} does not support {interaction}")]
    UnsupportedInteraction {
        route: String,
        interaction: &'static str,
    },

    /// Stream id already in flight on this connection.
    #[error("Stream {0} is already in flight")]
    DuplicateStream(u32),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential table could not be parsed.
    #[error("Credential error: {0}")]
    Credentials(#[from] common::Error),
}

/// Discriminant used to key error recovery handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Json,
    Unauthorized,
    Routing,
    Config,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Json(_) => ErrorKind::Json,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::UnknownRoute(_)
            | Error::UnsupportedInteraction { .. }
            | Error::DuplicateStream(_) => ErrorKind::Routing,
            Error::Config(_) | Error::Credentials(_) => ErrorKind::Config,
        }
    }

    /// Wire code reported when the error ends an RPC exchange.
    pub fn code(&self) -> ErrorCode {
        match self.kind() {
            ErrorKind::Unauthorized => ErrorCode::Unauthorized,
            ErrorKind::Json | ErrorKind::Routing => ErrorCode::Invalid,
            ErrorKind::Validation | ErrorKind::Config => ErrorCode::ApplicationError,
        }
    }
}

/// Result type for greeting service operations.
pub type Result<T> = std::result::Result<T, Error>;
