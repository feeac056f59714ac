//! Shared types for the greeting services.
//!
//! - [`messages`]: greeting request/event payloads shared by every transport
//! - [`rpc`]: frame protocol of the multiplexed request/stream binding
//! - [`auth`]: credentials, principals and the in-memory credential store

pub mod auth;
pub mod error;
pub mod messages;
pub mod rpc;

pub use auth::{CredentialStore, Credentials, InMemoryCredentialStore, Principal};
pub use error::{Error, Result};
pub use messages::{GreetingEvent, GreetingRequest, GreetingResponse};
pub use rpc::{ClientFrame, ErrorCode, ServerFrame, StreamId};
