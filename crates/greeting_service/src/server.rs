//! HTTP router and shared state for the three bindings.

use crate::config::ServiceConfig;
use crate::error::Result;
use crate::interceptor::ErrorInterceptor;
use crate::rpc_server::{rpc_handler, RpcRoutes};
use crate::source::StreamSource;
use crate::sse::greetings_sse_handler;
use crate::subscription::SubscriptionRegistry;
use crate::ws_server::ws_greetings_handler;
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use common::{CredentialStore, InMemoryCredentialStore};
use serde_json::json;
use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Shared application state.
pub struct AppState {
    pub source: StreamSource,
    pub registry: Arc<SubscriptionRegistry>,
    pub routes: RpcRoutes,
    pub interceptor: ErrorInterceptor,
    pub credentials: Arc<dyn CredentialStore>,
    /// RPC routes that require a principal.
    pub secured_routes: HashSet<String>,
    /// Capacity of each connection's outbound channel.
    pub outbound_buffer: usize,
}

impl AppState {
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let source = StreamSource::new(config.greeting_interval);
        let credentials = InMemoryCredentialStore::parse(&config.users)?;

        Ok(Self {
            routes: RpcRoutes::greetings(source.clone()),
            source,
            registry: Arc::new(SubscriptionRegistry::new()),
            interceptor: ErrorInterceptor::with_default_fallback(),
            credentials: Arc::new(credentials),
            secured_routes: config.secured_routes.iter().cloned().collect(),
            outbound_buffer: config.outbound_buffer,
        })
    }
}

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/greetings/{name}", get(greetings_sse_handler))
        .route("/ws/greetings", get(ws_greetings_handler))
        .route("/rpc", get(rpc_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Serve until `shutdown` resolves.
///
/// Streams never complete on their own, so every connection is cancelled as
/// soon as shutdown begins. Graceful shutdown then only waits for the
/// cancelled responses to wind down.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let registry = Arc::clone(&state.registry);
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!(
                "Shutting down, closing {} connections",
                registry.connection_count()
            );
            registry.close_all();
        })
        .await
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.registry.connection_count(),
        "subscriptions": state.registry.subscription_count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_default_config() {
        let state = AppState::from_config(&ServiceConfig::default()).unwrap();
        assert!(state.secured_routes.contains("greeting"));
        assert_eq!(state.routes.len(), 3);
        assert_eq!(state.outbound_buffer, 256);
        assert!(state
            .credentials
            .authenticate(&common::Credentials::new("user", "user"))
            .is_some());
    }

    #[test]
    fn test_bad_user_table_is_rejected() {
        let config = ServiceConfig {
            users: "broken".to_string(),
            ..ServiceConfig::default()
        };
        assert!(AppState::from_config(&config).is_err());
    }
}
