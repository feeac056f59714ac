//! RPC client demo.
//!
//! Performs a secured `greeting` request, then logs the `greetings` stream
//! until interrupted.

use anyhow::{Context, Result};
use common::{GreetingEvent, GreetingRequest};
use futures::StreamExt;
use rpc_client::{RpcClient, RpcClientConfig};
use std::env;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RpcClientConfig::from_env();
    let name = env::var("GREETING_NAME").unwrap_or_else(|_| "World".to_string());

    info!("Configuration:");
    info!("  RPC_URL: {}", config.url);
    info!(
        "  RPC_USERNAME: {}",
        config
            .credentials
            .as_ref()
            .map(|c| c.username.as_str())
            .unwrap_or("<none>")
    );
    info!("  GREETING_NAME: {}", name);

    let client = RpcClient::connect(config)
        .await
        .context("failed to connect to RPC endpoint")?;
    let request = GreetingRequest::new(name);

    match client
        .request_response::<GreetingEvent, _>("greeting", &request)
        .await
    {
        Ok(greeting) => info!("greeting: {}", greeting.message),
        Err(e) => warn!("greeting failed: {}", e),
    }

    let mut greetings = client
        .request_stream::<GreetingEvent, _>("greetings", &request)
        .await?;

    loop {
        tokio::select! {
            item = greetings.next() => match item {
                Some(Ok(event)) => info!("greetings: {}", event.message),
                Some(Err(e)) => {
                    warn!("greetings stream failed: {}", e);
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C");
                break;
            }
        }
    }

    drop(greetings);
    client.close().await;
    Ok(())
}
