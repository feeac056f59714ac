//! Route definitions and the ordered route table.
//!
//! A route matches when every predicate matches. The table is evaluated in
//! registration order and the first match wins.

use crate::error::{GatewayError, Result};
use crate::pattern::Pattern;
use crate::rate_limiter::{KeyResolver, RateLimiter};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use std::fmt;
use std::sync::Arc;
use url::Url;

/// The parts of an inbound request that predicates look at.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    /// `Host` header or URI authority, possibly with a port.
    pub host: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub enum Predicate {
    Path(Pattern),
    Host(Pattern),
    Method(Method),
}

impl Predicate {
    pub fn matches(&self, request: &RequestInfo<'_>) -> bool {
        match self {
            Predicate::Path(pattern) => pattern.matches(request.path),
            Predicate::Host(pattern) => request.host.is_some_and(|host| pattern.matches(host)),
            Predicate::Method(method) => request.method == method,
        }
    }
}

/// Token-bucket admission attached to a route.
#[derive(Clone)]
pub struct RateLimitFilter {
    pub limiter: Arc<RateLimiter>,
    pub key_resolver: Arc<dyn KeyResolver>,
    /// Reject with 403 when the resolver yields no key.
    pub deny_empty_key: bool,
}

impl fmt::Debug for RateLimitFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitFilter")
            .field("config", self.limiter.config())
            .field("key_resolver", &self.key_resolver)
            .field("deny_empty_key", &self.deny_empty_key)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum Filter {
    /// Replace the outbound path with a literal.
    SetPath(String),
    AddRequestHeader(HeaderName, HeaderValue),
    RequestRateLimiter(RateLimitFilter),
}

/// Outbound request state the rewrite filters operate on.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub path: String,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone)]
pub struct Route {
    id: String,
    predicates: Vec<Predicate>,
    target: Url,
    filters: Vec<Filter>,
}

impl Route {
    pub fn builder(id: impl Into<String>) -> RouteBuilder {
        RouteBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn matches(&self, request: &RequestInfo<'_>) -> bool {
        self.predicates.iter().all(|p| p.matches(request))
    }

    /// Rate limiters in declared order.
    pub fn rate_limiters(&self) -> impl Iterator<Item = &RateLimitFilter> {
        self.filters.iter().filter_map(|f| match f {
            Filter::RequestRateLimiter(limit) => Some(limit),
            _ => None,
        })
    }

    /// Apply the rewrite filters in declared order.
    pub fn apply_rewrites(&self, outbound: &mut OutboundRequest) {
        for filter in &self.filters {
            match filter {
                Filter::SetPath(path) => outbound.path.clone_from(path),
                Filter::AddRequestHeader(name, value) => {
                    outbound.headers.append(name.clone(), value.clone());
                }
                Filter::RequestRateLimiter(_) => {}
            }
        }
    }
}

/// Validating builder for [`Route`].
#[derive(Debug)]
pub struct RouteBuilder {
    id: String,
    predicates: Vec<Predicate>,
    target: Option<String>,
    filters: Vec<Filter>,
    error: Option<GatewayError>,
}

impl RouteBuilder {
    fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            predicates: Vec::new(),
            target: None,
            filters: Vec::new(),
            error: None,
        }
    }

    fn record<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.error.get_or_insert(e);
                None
            }
        }
    }

    pub fn path(mut self, pattern: &str) -> Self {
        if let Some(pattern) = self.record(Pattern::path(pattern)) {
            self.predicates.push(Predicate::Path(pattern));
        }
        self
    }

    pub fn host(mut self, pattern: &str) -> Self {
        if let Some(pattern) = self.record(Pattern::host(pattern)) {
            self.predicates.push(Predicate::Host(pattern));
        }
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.predicates.push(Predicate::Method(method));
        self
    }

    pub fn uri(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn set_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        if !path.starts_with('/') {
            self.error.get_or_insert(GatewayError::InvalidRoute(format!(
                "SetPath '{}' must start with '/'",
                path
            )));
            return self;
        }
        self.filters.push(Filter::SetPath(path));
        self
    }

    pub fn add_request_header(mut self, name: &str, value: &str) -> Self {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| GatewayError::InvalidRoute(format!("header name '{}': {}", name, e)))
            .and_then(|name| {
                HeaderValue::from_str(value)
                    .map(|value| (name, value))
                    .map_err(|e| GatewayError::InvalidRoute(format!("header value: {}", e)))
            });
        if let Some((name, value)) = self.record(header) {
            self.filters.push(Filter::AddRequestHeader(name, value));
        }
        self
    }

    pub fn request_rate_limiter(
        mut self,
        limiter: Arc<RateLimiter>,
        key_resolver: Arc<dyn KeyResolver>,
        deny_empty_key: bool,
    ) -> Self {
        self.filters.push(Filter::RequestRateLimiter(RateLimitFilter {
            limiter,
            key_resolver,
            deny_empty_key,
        }));
        self
    }

    pub fn build(self) -> Result<Route> {
        if let Some(e) = self.error {
            return Err(e);
        }
        if self.id.is_empty() {
            return Err(GatewayError::InvalidRoute("route id is empty".to_string()));
        }
        if self.predicates.is_empty() {
            return Err(GatewayError::InvalidRoute(format!(
                "route '{}' has no predicates",
                self.id
            )));
        }

        let target = self.target.ok_or_else(|| {
            GatewayError::InvalidRoute(format!("route '{}' has no target uri", self.id))
        })?;
        let target = Url::parse(&target)?;
        if !matches!(target.scheme(), "http" | "https") || !target.has_host() {
            return Err(GatewayError::InvalidRoute(format!(
                "route '{}' target '{}' must be an absolute http(s) uri",
                self.id, target
            )));
        }

        Ok(Route {
            id: self.id,
            predicates: self.predicates,
            target,
            filters: self.filters,
        })
    }
}

/// Ordered, immutable route table.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Result<Self> {
        for (i, route) in routes.iter().enumerate() {
            if routes[..i].iter().any(|r| r.id == route.id) {
                return Err(GatewayError::InvalidRoute(format!(
                    "duplicate route id '{}'",
                    route.id
                )));
            }
        }
        Ok(Self { routes })
    }

    /// First route whose predicates all match.
    pub fn find(&self, request: &RequestInfo<'_>) -> Option<&Route> {
        self.routes.iter().find(|route| route.matches(request))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }
}
