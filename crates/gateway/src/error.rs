//! Gateway error types.

use crate::rate_limiter::RateLimitDecision;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No route matched the request.
    #[error("No route matches {method} {path}")]
    RouteNotFound { method: String, path: String },

    /// The key's bucket has no whole token left.
    #[error("Rate limit exceeded")]
    RateLimitExceeded(RateLimitDecision),

    /// The key resolver produced no key and the route denies empty keys.
    #[error("Rate limit key could not be resolved")]
    EmptyKey,

    /// Protected path requested without valid credentials.
    #[error("Authentication required: {0}")]
    AuthenticationRequired(String),

    /// Backend could not be reached or failed mid-response.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Backend did not answer within the response timeout.
    #[error("Backend timed out after {0:?}")]
    GatewayTimeout(std::time::Duration),

    /// Invalid path or host pattern.
    #[error("Invalid pattern {0}")]
    InvalidPattern(String),

    /// Invalid route definition.
    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed credentials or user table.
    #[error("Credential error: {0}")]
    Credentials(#[from] common::Error),

    /// Target URI could not be parsed.
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::EmptyKey => StatusCode::FORBIDDEN,
            GatewayError::AuthenticationRequired(_) => StatusCode::UNAUTHORIZED,
            GatewayError::BackendUnavailable(_) | GatewayError::Http(_) => StatusCode::BAD_GATEWAY,
            GatewayError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::InvalidPattern(_)
            | GatewayError::InvalidRoute(_)
            | GatewayError::Config(_)
            | GatewayError::Credentials(_)
            | GatewayError::Url(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorResponse {
            error: self.to_string(),
        });
        let mut response = (status, body).into_response();

        match &self {
            GatewayError::RateLimitExceeded(decision) => {
                decision.apply_headers(response.headers_mut());
            }
            GatewayError::AuthenticationRequired(_) => {
                response.headers_mut().insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static(r#"Basic realm="gateway""#),
                );
            }
            _ => {}
        }
        response
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
