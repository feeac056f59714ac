//! Token-bucket rate limiting keyed by principal.
//!
//! Buckets live in a DashMap and each has its own mutex, so requests for
//! different keys never contend and concurrent requests for one key cannot
//! lose updates. A new bucket starts full.

use crate::clock::{Clock, SystemClock};
use crate::error::{GatewayError, Result};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use common::Principal;
use dashmap::DashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_REPLENISH_RATE: &str = "x-ratelimit-replenish-rate";
pub const HEADER_BURST_CAPACITY: &str = "x-ratelimit-burst-capacity";
pub const HEADER_REQUESTED_TOKENS: &str = "x-ratelimit-requested-tokens";

/// Key used for unauthenticated callers when a route admits them.
pub const ANONYMOUS_KEY: &str = "anonymous";

/// Token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    /// Tokens added per second.
    pub replenish_rate: f64,
    /// Maximum tokens a bucket holds.
    pub burst_capacity: u32,
    /// Tokens consumed per request.
    pub requested_tokens: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            replenish_rate: 5.0,
            burst_capacity: 7,
            requested_tokens: 1,
        }
    }
}

impl RateLimiterConfig {
    pub fn new(replenish_rate: f64, burst_capacity: u32) -> Result<Self> {
        let config = Self {
            replenish_rate,
            burst_capacity,
            requested_tokens: 1,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.replenish_rate.is_finite() && self.replenish_rate > 0.0) {
            return Err(GatewayError::Config(format!(
                "replenish rate must be positive, got {}",
                self.replenish_rate
            )));
        }
        if self.burst_capacity < 1 {
            return Err(GatewayError::Config(
                "burst capacity must be at least 1".to_string(),
            ));
        }
        if self.requested_tokens < 1 || self.requested_tokens > self.burst_capacity {
            return Err(GatewayError::Config(format!(
                "requested tokens must be between 1 and {}",
                self.burst_capacity
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(config: &RateLimiterConfig, now: Instant) -> Self {
        Self {
            tokens: f64::from(config.burst_capacity),
            last_refill: now,
        }
    }

    fn available(&self, now: Instant, config: &RateLimiterConfig) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * config.replenish_rate).min(f64::from(config.burst_capacity))
    }

    fn refill(&mut self, now: Instant, config: &RateLimiterConfig) {
        self.tokens = self.available(now, config);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Whole tokens left after this request.
    pub remaining: u64,
    /// Time until the request would be admitted. Set only on denial.
    pub retry_after: Option<Duration>,
    pub replenish_rate: f64,
    pub burst_capacity: u32,
    pub requested_tokens: u32,
}

impl RateLimitDecision {
    /// Retry-after rounded up to whole seconds.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|d| d.as_secs_f64().ceil() as u64)
    }

    /// Write the informational rate-limit headers, plus `Retry-After` on denial.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        let entries = [
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_REPLENISH_RATE, self.replenish_rate.to_string()),
            (HEADER_BURST_CAPACITY, self.burst_capacity.to_string()),
            (HEADER_REQUESTED_TOKENS, self.requested_tokens.to_string()),
        ];
        for (name, value) in entries {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(HeaderName::from_static(name), value);
            }
        }
        if let Some(secs) = self.retry_after_secs() {
            headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(secs));
        }
    }
}

/// Per-key token-bucket limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    clock: Arc<dyn Clock>,
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            buckets: DashMap::new(),
        })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Refill the key's bucket, then take the requested tokens if available.
    pub fn is_allowed(&self, key: &str) -> RateLimitDecision {
        let bucket = self.bucket(key);
        let mut bucket = bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let now = self.clock.now();
        bucket.refill(now, &self.config);

        let requested = f64::from(self.config.requested_tokens);
        let allowed = bucket.tokens >= requested;
        let retry_after = if allowed {
            bucket.tokens -= requested;
            None
        } else {
            Some(Duration::from_secs_f64(
                (requested - bucket.tokens) / self.config.replenish_rate,
            ))
        };
        let remaining = if allowed { bucket.tokens.floor() as u64 } else { 0 };

        debug!(
            key = %key,
            allowed,
            tokens = bucket.tokens,
            "Rate limit check"
        );

        RateLimitDecision {
            allowed,
            remaining,
            retry_after,
            replenish_rate: self.config.replenish_rate,
            burst_capacity: self.config.burst_capacity,
            requested_tokens: self.config.requested_tokens,
        }
    }

    /// Return the tokens taken by an admitted request that was later denied
    /// elsewhere. Never fills past capacity.
    pub fn refund(&self, key: &str) {
        let Some(bucket) = self.buckets.get(key).map(|b| Arc::clone(&*b)) else {
            return;
        };
        let mut bucket = bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        bucket.refill(self.clock.now(), &self.config);
        bucket.tokens = (bucket.tokens + f64::from(self.config.requested_tokens))
            .min(f64::from(self.config.burst_capacity));
        debug!(key = %key, tokens = bucket.tokens, "Rate limit refund");
    }

    /// Tokens the key would have right now, or `None` if it has no bucket.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        let bucket = Arc::clone(&*self.buckets.get(key)?);
        let bucket = bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Some(bucket.available(self.clock.now(), &self.config))
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket(&self, key: &str) -> Arc<Mutex<TokenBucket>> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(&bucket);
        }
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::full(&self.config, self.clock.now()))));
        Arc::clone(&bucket)
    }
}

/// Derives the rate-limit key for a request.
pub trait KeyResolver: Send + Sync + Debug {
    /// `None` means the request has no key.
    fn resolve(&self, principal: Option<&Principal>) -> Option<String>;
}

/// Keys requests by the authenticated principal's name.
#[derive(Debug, Clone, Default)]
pub struct PrincipalNameKeyResolver {
    anonymous_key: Option<String>,
}

impl PrincipalNameKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share one [`ANONYMOUS_KEY`] bucket among unauthenticated callers.
    pub fn with_anonymous_fallback(mut self) -> Self {
        self.anonymous_key = Some(ANONYMOUS_KEY.to_string());
        self
    }
}

impl KeyResolver for PrincipalNameKeyResolver {
    fn resolve(&self, principal: Option<&Principal>) -> Option<String> {
        principal
            .map(|p| p.name().to_string())
            .or_else(|| self.anonymous_key.clone())
    }
}
