//! Greeting service configuration, read from the environment.

use crate::error::{Error, Result};
use crate::source::DEFAULT_INTERVAL;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default capacity of each connection's outbound frame channel.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// HTTP listen port for all three bindings.
    pub http_port: u16,
    /// Prometheus listener port; disabled when `None`.
    pub metrics_port: Option<u16>,
    /// Interval between greetings on every stream.
    pub greeting_interval: Duration,
    /// Capacity of each connection's outbound channel.
    pub outbound_buffer: usize,
    /// RPC routes that require an authenticated principal.
    pub secured_routes: Vec<String>,
    /// Demo accounts as `user:password` pairs.
    pub users: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            metrics_port: None,
            greeting_interval: DEFAULT_INTERVAL,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            secured_routes: vec!["greeting".to_string()],
            users: "user:user".to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let greeting_interval = match env::var("GREETING_INTERVAL_MS") {
            Ok(value) => Duration::from_millis(parse("GREETING_INTERVAL_MS", &value)?),
            Err(_) => defaults.greeting_interval,
        };
        if greeting_interval.is_zero() {
            return Err(Error::Config("GREETING_INTERVAL_MS must be positive".to_string()));
        }

        let outbound_buffer = match env::var("OUTBOUND_BUFFER") {
            Ok(value) => parse("OUTBOUND_BUFFER", &value)?,
            Err(_) => defaults.outbound_buffer,
        };
        if outbound_buffer == 0 {
            return Err(Error::Config("OUTBOUND_BUFFER must be positive".to_string()));
        }

        Ok(Self {
            http_port: match env::var("HTTP_PORT") {
                Ok(value) => parse("HTTP_PORT", &value)?,
                Err(_) => defaults.http_port,
            },
            metrics_port: match env::var("METRICS_PORT") {
                Ok(value) => Some(parse("METRICS_PORT", &value)?),
                Err(_) => None,
            },
            greeting_interval,
            outbound_buffer,
            secured_routes: match env::var("RPC_SECURED_ROUTES") {
                Ok(value) => value
                    .split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .collect(),
                Err(_) => defaults.secured_routes,
            },
            users: env::var("DEMO_USERS").unwrap_or(defaults.users),
        })
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} has invalid value '{}'", name, value)))
}
