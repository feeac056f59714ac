//! Error types for shared protocol and credential handling.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid authorization header: {0}")]
    InvalidAuthorization(String),

    #[error("Invalid user entry: {0}")]
    InvalidUserEntry(String),
}

pub type Result<T> = std::result::Result<T, Error>;
