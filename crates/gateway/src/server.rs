//! Gateway state and HTTP router.

use crate::clock::{Clock, SystemClock};
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::filter_chain::gateway_handler;
use crate::forward::BackendClient;
use crate::rate_limiter::RateLimiter;
use crate::route::RouteTable;
use crate::security::SecurityPolicy;
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use common::InMemoryCredentialStore;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Shared gateway state, built once at startup.
pub struct GatewayState {
    pub routes: RouteTable,
    pub security: SecurityPolicy,
    pub backend: BackendClient,
    /// Limiter shared by the proxy route.
    pub limiter: Arc<RateLimiter>,
}

impl GatewayState {
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(config: &GatewayConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::with_clock(config.rate_limit, clock)?);
        let routes = RouteTable::new(config.default_routes(Arc::clone(&limiter))?)?;
        let credentials = InMemoryCredentialStore::parse(&config.users)?;
        let security =
            SecurityPolicy::new(Arc::new(credentials), config.protected_paths.as_slice())?;
        let backend = BackendClient::new(config.connect_timeout, config.response_timeout)?;

        for route in routes.iter() {
            info!("Route {} -> {}", route.id(), route.target());
        }

        Ok(Self {
            routes,
            security,
            backend,
            limiter,
        })
    }
}

/// Create the gateway router. Everything except `/health` goes through the
/// filter chain.
pub fn create_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .fallback(gateway_handler)
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "routes": state.routes.len(),
        "buckets": state.limiter.bucket_count(),
    }))
}
