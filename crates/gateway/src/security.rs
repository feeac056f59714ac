//! Basic-auth authentication and path authorization.
//!
//! Both checks run before any route is matched, so a rejected request never
//! reaches a rate limiter.

use crate::error::{GatewayError, Result};
use crate::pattern::Pattern;
use axum::http::{header, HeaderMap};
use common::{CredentialStore, Credentials, Principal};
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct SecurityPolicy {
    credentials: Arc<dyn CredentialStore>,
    protected: Vec<Pattern>,
}

impl SecurityPolicy {
    /// `protected_paths` are path patterns that require a principal.
    pub fn new<S: AsRef<str>>(
        credentials: Arc<dyn CredentialStore>,
        protected_paths: &[S],
    ) -> Result<Self> {
        let protected = protected_paths
            .iter()
            .map(|p| Pattern::path(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            credentials,
            protected,
        })
    }

    /// Resolve the principal from an `Authorization: Basic` header.
    ///
    /// No header (or another scheme) yields `Ok(None)`; credentials that are
    /// supplied but wrong are rejected on any path.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Option<Principal>> {
        let Some(value) = headers.get(header::AUTHORIZATION) else {
            return Ok(None);
        };
        let value = value.to_str().map_err(|_| {
            GatewayError::AuthenticationRequired("authorization header is not ASCII".to_string())
        })?;

        let credentials = match Credentials::from_basic_authorization(value) {
            Ok(Some(credentials)) => credentials,
            Ok(None) => return Ok(None),
            Err(e) => return Err(GatewayError::AuthenticationRequired(e.to_string())),
        };

        match self.credentials.authenticate(&credentials) {
            Some(principal) => {
                debug!("Authenticated {}", principal);
                Ok(Some(principal))
            }
            None => {
                warn!("Rejected credentials for {}", credentials.username);
                counter!("gateway_auth_failures_total").increment(1);
                Err(GatewayError::AuthenticationRequired(
                    "invalid credentials".to_string(),
                ))
            }
        }
    }

    /// Reject unauthenticated access to protected paths.
    pub fn authorize(&self, path: &str, principal: Option<&Principal>) -> Result<()> {
        if principal.is_none() && self.is_protected(path) {
            counter!("gateway_auth_failures_total").increment(1);
            return Err(GatewayError::AuthenticationRequired(format!(
                "{} requires an authenticated principal",
                path
            )));
        }
        Ok(())
    }

    pub fn is_protected(&self, path: &str) -> bool {
        self.protected.iter().any(|p| p.matches(path))
    }
}
