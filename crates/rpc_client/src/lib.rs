//! Client for the multiplexed greeting RPC protocol.
//!
//! One WebSocket carries many exchanges. The client allocates odd stream ids,
//! a reader task routes server frames to the waiting exchange, and a writer
//! task owns the socket sink.

pub mod client;
pub mod error;

pub use client::{RpcClient, RpcClientConfig, RpcStream};
pub use error::{Error, Result};
