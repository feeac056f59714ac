//! Per-exchange error recovery.
//!
//! Handlers are keyed by [`ErrorKind`]. A recovered error replaces the failed
//! response of that one exchange; the connection is unaffected.

use crate::error::{Error, ErrorKind};
use metrics::counter;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

/// Fallback payload returned for domain validation errors.
pub const FALLBACK_RESPONSE: &str = "OoOps!";

/// Produces the replacement payload for a failed exchange.
pub type RecoveryHandler = Arc<dyn Fn(&Error) -> Value + Send + Sync>;

#[derive(Clone, Default)]
pub struct ErrorInterceptor {
    handlers: HashMap<ErrorKind, RecoveryHandler>,
}

impl ErrorInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interceptor used by the greeting routes: validation errors become
    /// [`FALLBACK_RESPONSE`].
    pub fn with_default_fallback() -> Self {
        Self::new().with_fallback(ErrorKind::Validation, Value::from(FALLBACK_RESPONSE))
    }

    /// Register a handler for one error kind, replacing any previous one.
    pub fn on<F>(mut self, kind: ErrorKind, handler: F) -> Self
    where
        F: Fn(&Error) -> Value + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    /// Register a fixed replacement value for one error kind.
    pub fn with_fallback(self, kind: ErrorKind, value: Value) -> Self {
        self.on(kind, move |_| value.clone())
    }

    pub fn handles(&self, kind: ErrorKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Try to recover from an error raised while serving `route`.
    ///
    /// Returns the replacement payload, or `None` when no handler is
    /// registered for the error's kind.
    pub fn recover(&self, route: &str, err: &Error) -> Option<Value> {
        let handler = self.handlers.get(&err.kind())?;
        error!(route = %route, error = %err, "Exchange failed, substituting fallback response");
        counter!("greeting_exchange_recoveries_total", "route" => route.to_string()).increment(1);
        Some(handler(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validation_error_recovered() {
        let interceptor = ErrorInterceptor::with_default_fallback();
        let recovered = interceptor.recover(
            "error-signal",
            &Error::Validation("Invalid input error".to_string()),
        );
        assert_eq!(recovered, Some(json!("OoOps!")));
    }

    #[test]
    fn test_unhandled_kind_passes_through() {
        let interceptor = ErrorInterceptor::with_default_fallback();
        let err = Error::UnknownRoute("nope".to_string());
        assert!(interceptor.recover("nope", &err).is_none());
    }

    #[test]
    fn test_custom_handler_sees_error() {
        let interceptor = ErrorInterceptor::new()
            .on(ErrorKind::Unauthorized, |e| json!({ "denied": e.to_string() }));
        let recovered = interceptor
            .recover("greeting", &Error::Unauthorized("no principal".to_string()))
            .unwrap();
        assert_eq!(recovered["denied"], "Unauthorized: no principal");
        assert!(!interceptor.handles(ErrorKind::Validation));
    }
}
