//! Greeting streaming service.
//!
//! One logical greeting stream exposed over three long-lived bindings:
//!
//! ```text
//! GET /greetings/{name}   server-sent events, one stream per request
//! GET /ws/greetings       duplex socket, one stream per inbound frame
//! GET /rpc                multiplexed request/response and request/stream
//!         ↓
//! SubscriptionRegistry (per-connection cancellation tokens)
//!         ↓
//! StreamSource (tokio interval per subscriber)
//! ```
//!
//! Closing any connection cancels every stream it owns. Errors raised by an
//! RPC exchange go through the [`ErrorInterceptor`] and only affect that
//! exchange.

pub mod config;
pub mod error;
pub mod interceptor;
pub mod rpc_server;
pub mod server;
pub mod source;
pub mod sse;
pub mod subscription;
pub mod ws_server;

pub use config::ServiceConfig;
pub use error::{Error, ErrorKind, Result};
pub use interceptor::{ErrorInterceptor, FALLBACK_RESPONSE};
pub use rpc_server::{RpcHandler, RpcRoutes};
pub use server::{create_router, serve, AppState};
pub use source::StreamSource;
pub use subscription::{ConnectionGuard, Subscription, SubscriptionRegistry, TransportKind};
