//! Per-request filter chain.
//!
//! authenticate → authorize → match route → rate limit → rewrite → forward.

use crate::error::{GatewayError, Result};
use crate::rate_limiter::RateLimitDecision;
use crate::route::{OutboundRequest, RateLimitFilter, RequestInfo, Route};
use crate::GatewayState;
use axum::{
    extract::{Request, State},
    http::header,
    response::{IntoResponse, Response},
};
use common::Principal;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Fallback handler: every request that is not a gateway endpoint.
pub async fn gateway_handler(
    State(state): State<Arc<GatewayState>>,
    request: Request,
) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = match handle(&state, request).await {
        Ok(response) => response,
        Err(e) => {
            match &e {
                GatewayError::RouteNotFound { .. } => debug!("{}", e),
                GatewayError::RateLimitExceeded(_) | GatewayError::EmptyKey => {
                    info!("{} {} rejected: {}", method, path, e)
                }
                GatewayError::AuthenticationRequired(_) => {
                    debug!("{} {} rejected: {}", method, path, e)
                }
                _ => warn!("{} {} failed: {}", method, path, e),
            }
            e.into_response()
        }
    };

    counter!("gateway_requests_total", "status" => response.status().as_u16().to_string())
        .increment(1);
    histogram!("gateway_request_duration_seconds").record(started.elapsed().as_secs_f64());
    response
}

async fn handle(state: &GatewayState, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();

    let principal = state.security.authenticate(&parts.headers)?;
    state
        .security
        .authorize(parts.uri.path(), principal.as_ref())?;

    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| parts.uri.host());
    let info = RequestInfo {
        method: &parts.method,
        path: parts.uri.path(),
        host,
    };
    let route = state
        .routes
        .find(&info)
        .ok_or_else(|| GatewayError::RouteNotFound {
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
        })?;

    let decisions = admit(route, principal.as_ref())?;

    let mut outbound = OutboundRequest {
        path: parts.uri.path().to_string(),
        headers: parts.headers.clone(),
    };
    route.apply_rewrites(&mut outbound);

    let mut response = state
        .backend
        .forward(route, parts.method.clone(), outbound, parts.uri.query(), body)
        .await?;
    for decision in &decisions {
        decision.apply_headers(response.headers_mut());
    }
    Ok(response)
}

/// Run the route's rate limiters in declared order.
///
/// A request is charged only if every limiter admits it; tokens taken by
/// earlier limiters are refunded when a later one denies.
fn admit(route: &Route, principal: Option<&Principal>) -> Result<Vec<RateLimitDecision>> {
    let mut decisions = Vec::new();
    let mut charged: Vec<(&RateLimitFilter, String)> = Vec::new();

    let denial = 'check: {
        for limit in route.rate_limiters() {
            let Some(key) = limit.key_resolver.resolve(principal) else {
                if limit.deny_empty_key {
                    counter!("gateway_rate_limit_denied_total", "route" => route.id().to_string(), "reason" => "empty_key").increment(1);
                    break 'check Some(GatewayError::EmptyKey);
                }
                continue;
            };

            let decision = limit.limiter.is_allowed(&key);
            if !decision.allowed {
                counter!("gateway_rate_limit_denied_total", "route" => route.id().to_string(), "reason" => "exhausted").increment(1);
                break 'check Some(GatewayError::RateLimitExceeded(decision));
            }
            decisions.push(decision);
            charged.push((limit, key));
        }
        None
    };

    match denial {
        Some(e) => {
            for (limit, key) in charged.iter().rev() {
                limit.limiter.refund(key);
            }
            Err(e)
        }
        None => Ok(decisions),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limiter::{PrincipalNameKeyResolver, RateLimiter, RateLimiterConfig};

    fn limited_route(resolver: PrincipalNameKeyResolver, deny_empty_key: bool) -> Route {
        let limiter = RateLimiter::with_clock(
            RateLimiterConfig::new(1.0, 2).unwrap(),
            Arc::new(ManualClock::default()),
        )
        .unwrap();
        Route::builder("limited")
            .path("/proxy")
            .uri("http://localhost:8080")
            .request_rate_limiter(Arc::new(limiter), Arc::new(resolver), deny_empty_key)
            .build()
            .unwrap()
    }

    #[test]
    fn test_admit_until_exhausted() {
        let route = limited_route(PrincipalNameKeyResolver::new(), true);
        let principal = Principal::new("jlong");

        assert_eq!(admit(&route, Some(&principal)).unwrap()[0].remaining, 1);
        assert_eq!(admit(&route, Some(&principal)).unwrap()[0].remaining, 0);
        assert!(matches!(
            admit(&route, Some(&principal)),
            Err(GatewayError::RateLimitExceeded(_))
        ));
    }

    #[test]
    fn test_later_denial_refunds_earlier_limiters() {
        let clock = Arc::new(ManualClock::default());
        let roomy = Arc::new(
            RateLimiter::with_clock(RateLimiterConfig::new(1.0, 5).unwrap(), clock.clone()).unwrap(),
        );
        let tight = Arc::new(
            RateLimiter::with_clock(RateLimiterConfig::new(1.0, 1).unwrap(), clock).unwrap(),
        );
        let resolver = Arc::new(PrincipalNameKeyResolver::new());
        let route = Route::builder("stacked")
            .path("/proxy")
            .uri("http://localhost:8080")
            .request_rate_limiter(Arc::clone(&roomy), resolver.clone(), true)
            .request_rate_limiter(Arc::clone(&tight), resolver, true)
            .build()
            .unwrap();
        let principal = Principal::new("jlong");

        assert_eq!(admit(&route, Some(&principal)).unwrap().len(), 2);
        assert_eq!(roomy.tokens("jlong"), Some(4.0));

        for _ in 0..3 {
            assert!(matches!(
                admit(&route, Some(&principal)),
                Err(GatewayError::RateLimitExceeded(_))
            ));
        }
        assert_eq!(roomy.tokens("jlong"), Some(4.0));
        assert_eq!(tight.tokens("jlong"), Some(0.0));
    }

    #[test]
    fn test_refund_is_capped_at_capacity() {
        let limiter = RateLimiter::with_clock(
            RateLimiterConfig::new(1.0, 2).unwrap(),
            Arc::new(ManualClock::default()),
        )
        .unwrap();
        limiter.refund("nobody");
        assert_eq!(limiter.bucket_count(), 0);

        limiter.is_allowed("jlong");
        limiter.refund("jlong");
        limiter.refund("jlong");
        assert_eq!(limiter.tokens("jlong"), Some(2.0));
    }

    #[test]
    fn test_empty_key() {
        let strict = limited_route(PrincipalNameKeyResolver::new(), true);
        assert!(matches!(admit(&strict, None), Err(GatewayError::EmptyKey)));

        let skipping = limited_route(PrincipalNameKeyResolver::new(), false);
        assert!(admit(&skipping, None).unwrap().is_empty());

        let anonymous = limited_route(PrincipalNameKeyResolver::new().with_anonymous_fallback(), true);
        assert_eq!(admit(&anonymous, None).unwrap().len(), 1);
    }
}
