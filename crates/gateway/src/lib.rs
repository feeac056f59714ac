//! Rate-limited API gateway.
//!
//! ## Request flow
//!
//! ```text
//! request
//!    ↓
//! SecurityPolicy   basic auth → principal; protected paths need one (401)
//!    ↓
//! RouteTable       ordered predicates, first match wins (404)
//!    ↓
//! RateLimiter      token bucket per principal (429 / 403)
//!    ↓
//! rewrite filters  SetPath, AddRequestHeader
//!    ↓
//! BackendClient    streamed forward (502 / 504)
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod filter_chain;
pub mod forward;
pub mod pattern;
pub mod rate_limiter;
pub mod route;
pub mod security;
pub mod server;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use forward::BackendClient;
pub use pattern::Pattern;
pub use rate_limiter::{
    KeyResolver, PrincipalNameKeyResolver, RateLimitDecision, RateLimiter, RateLimiterConfig,
};
pub use route::{Filter, Predicate, RequestInfo, Route, RouteBuilder, RouteTable};
pub use security::SecurityPolicy;
pub use server::{create_router, GatewayState};
