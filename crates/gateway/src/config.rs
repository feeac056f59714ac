//! Gateway configuration, read from the environment.

use crate::error::{GatewayError, Result};
use crate::rate_limiter::{PrincipalNameKeyResolver, RateLimiter, RateLimiterConfig};
use crate::route::Route;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub http_port: u16,
    /// Prometheus listener port; disabled when `None`.
    pub metrics_port: Option<u16>,
    /// Target URI of the proxy route.
    pub backend_url: String,
    /// Path predicate of the proxy route.
    pub route_path: String,
    /// Host predicate of the proxy route; none when empty.
    pub route_host: String,
    /// Literal outbound path set on the proxy route.
    pub backend_path: String,
    pub rate_limit: RateLimiterConfig,
    /// Path patterns that require an authenticated principal.
    pub protected_paths: Vec<String>,
    /// Demo accounts as `user:password` pairs.
    pub users: String,
    pub connect_timeout: Duration,
    /// Bound on the wait for backend response headers.
    pub response_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_port: 9999,
            metrics_port: None,
            backend_url: "http://localhost:8080".to_string(),
            route_path: "/proxy".to_string(),
            route_host: "*.spring.io".to_string(),
            backend_path: "/reservations".to_string(),
            rate_limit: RateLimiterConfig::default(),
            protected_paths: vec!["/proxy".to_string(), "/proxy/**".to_string()],
            users: "jlong:pw".to_string(),
            connect_timeout: Duration::from_millis(2000),
            response_timeout: Duration::from_millis(10000),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let rate_limit = RateLimiterConfig {
            replenish_rate: var_or("RATE_LIMIT_REPLENISH_RATE", defaults.rate_limit.replenish_rate)?,
            burst_capacity: var_or("RATE_LIMIT_BURST_CAPACITY", defaults.rate_limit.burst_capacity)?,
            requested_tokens: defaults.rate_limit.requested_tokens,
        };
        rate_limit.validate()?;

        Ok(Self {
            http_port: var_or("HTTP_PORT", defaults.http_port)?,
            metrics_port: match env::var("METRICS_PORT") {
                Ok(value) => Some(parse("METRICS_PORT", &value)?),
                Err(_) => None,
            },
            backend_url: env::var("BACKEND_URL").unwrap_or(defaults.backend_url),
            route_path: env::var("ROUTE_PATH").unwrap_or(defaults.route_path),
            route_host: env::var("ROUTE_HOST").unwrap_or(defaults.route_host),
            backend_path: env::var("BACKEND_PATH").unwrap_or(defaults.backend_path),
            rate_limit,
            protected_paths: match env::var("PROTECTED_PATHS") {
                Ok(value) => value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect(),
                Err(_) => defaults.protected_paths,
            },
            users: env::var("DEMO_USERS").unwrap_or(defaults.users),
            connect_timeout: Duration::from_millis(var_or(
                "BACKEND_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout.as_millis() as u64,
            )?),
            response_timeout: Duration::from_millis(var_or(
                "BACKEND_RESPONSE_TIMEOUT_MS",
                defaults.response_timeout.as_millis() as u64,
            )?),
        })
    }

    /// The proxy route: path (and host) predicates, rate limiting keyed by
    /// principal name, then the literal path rewrite.
    pub fn default_routes(&self, limiter: Arc<RateLimiter>) -> Result<Vec<Route>> {
        let mut builder = Route::builder("proxy").path(&self.route_path);
        if !self.route_host.is_empty() {
            builder = builder.host(&self.route_host);
        }
        let route = builder
            .request_rate_limiter(limiter, Arc::new(PrincipalNameKeyResolver::new()), true)
            .set_path(self.backend_path.clone())
            .uri(self.backend_url.clone())
            .build()?;
        Ok(vec![route])
    }
}

fn var_or<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(value) => parse(name, &value),
        Err(_) => Ok(default),
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| GatewayError::Config(format!("{} has invalid value '{}'", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::RequestInfo;
    use axum::http::Method;

    #[test]
    fn test_default_route() {
        let config = GatewayConfig::default();
        let limiter = Arc::new(RateLimiter::new(config.rate_limit).unwrap());
        let routes = config.default_routes(limiter).unwrap();
        assert_eq!(routes.len(), 1);

        let route = &routes[0];
        assert_eq!(route.target().as_str(), "http://localhost:8080/");
        assert_eq!(route.rate_limiters().count(), 1);

        let get = Method::GET;
        let request = RequestInfo {
            method: &get,
            path: "/proxy",
            host: Some("start.spring.io"),
        };
        assert!(route.matches(&request));
    }

    #[test]
    fn test_empty_host_drops_predicate() {
        let config = GatewayConfig {
            route_host: String::new(),
            ..GatewayConfig::default()
        };
        let limiter = Arc::new(RateLimiter::new(config.rate_limit).unwrap());
        let routes = config.default_routes(limiter).unwrap();
        assert_eq!(routes[0].predicates().len(), 1);
    }

    #[test]
    fn test_parse_error() {
        assert!(parse::<u16>("HTTP_PORT", "not-a-port").is_err());
        assert_eq!(parse::<f64>("RATE", " 5 ").unwrap(), 5.0);
    }
}
