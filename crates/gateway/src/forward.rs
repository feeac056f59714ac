//! Backend forwarding.
//!
//! Request and response bodies are streamed, never buffered. Hop-by-hop
//! headers are dropped in both directions.

use crate::error::{GatewayError, Result};
use crate::route::{OutboundRequest, Route};
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, Method};
use axum::response::Response;
use metrics::counter;
use std::time::Duration;
use tracing::{debug, error};
use url::Url;

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// HTTP client for the route targets.
#[derive(Debug, Clone)]
pub struct BackendClient {
    client: reqwest::Client,
    response_timeout: Duration,
}

impl BackendClient {
    pub fn new(connect_timeout: Duration, response_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            response_timeout,
        })
    }

    /// Forward to the route's target and relay the backend response.
    ///
    /// Only the wait for response headers is bounded; the body streams for as
    /// long as the backend sends it.
    pub async fn forward(
        &self,
        route: &Route,
        method: Method,
        outbound: OutboundRequest,
        query: Option<&str>,
        body: Body,
    ) -> Result<Response> {
        let url = target_url(route.target(), &outbound.path, query);
        debug!("Forwarding {} {} via route {}", method, url, route.id());

        let has_body = outbound.headers.contains_key(header::CONTENT_LENGTH)
            || outbound.headers.contains_key(header::TRANSFER_ENCODING);

        let mut headers = outbound.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);

        let mut request = self.client.request(method, url.clone()).headers(headers);
        if has_body {
            request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let response = match tokio::time::timeout(self.response_timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => {
                return Err(self.timed_out(route, &url));
            }
            Ok(Err(e)) => {
                error!(route = %route.id(), target = %url, error = %e, "Backend request failed");
                counter!("gateway_backend_failures_total", "route" => route.id().to_string(), "kind" => "unavailable").increment(1);
                return Err(GatewayError::BackendUnavailable(e.to_string()));
            }
            Err(_) => return Err(self.timed_out(route, &url)),
        };

        let status = response.status();
        let mut response_headers = response.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        let mut relayed = Response::new(Body::from_stream(response.bytes_stream()));
        *relayed.status_mut() = status;
        *relayed.headers_mut() = response_headers;
        Ok(relayed)
    }

    fn timed_out(&self, route: &Route, url: &Url) -> GatewayError {
        error!(
            route = %route.id(),
            target = %url,
            "Backend did not respond within {:?}",
            self.response_timeout
        );
        counter!("gateway_backend_failures_total", "route" => route.id().to_string(), "kind" => "timeout").increment(1);
        GatewayError::GatewayTimeout(self.response_timeout)
    }
}

/// Join the target's base path with the outbound path and keep the query.
pub fn target_url(base: &Url, path: &str, query: Option<&str>) -> Url {
    let mut url = base.clone();
    let joined = format!("{}{}", base.path().trim_end_matches('/'), path);
    url.set_path(&joined);
    url.set_query(query);
    url
}

/// Remove hop-by-hop headers, including any the `Connection` header names.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_target_url_keeps_query() {
        let base = Url::parse("http://localhost:8080").unwrap();
        assert_eq!(
            target_url(&base, "/reservations", Some("page=2")).as_str(),
            "http://localhost:8080/reservations?page=2"
        );
        assert_eq!(
            target_url(&base, "/reservations", None).as_str(),
            "http://localhost:8080/reservations"
        );
    }

    #[test]
    fn test_target_url_with_base_path() {
        let base = Url::parse("http://backend/api/").unwrap();
        assert_eq!(
            target_url(&base, "/reservations", None).as_str(),
            "http://backend/api/reservations"
        );
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers[header::ACCEPT], "application/json");
    }
}
