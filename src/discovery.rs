//! Service discovery: locating the policy endpoint for an identity's domain.

use crate::template::ServiceError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which policy backend an application talks to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendKind {
    #[default]
    Cloud,
    OnPremises,
}

/// A located policy service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyEndpoint {
    /// Base URL of the policy service; also the license issuer
    pub url: String,
    /// Token authority the identity provider should authenticate against
    pub authority: String,
    /// Resource (audience) the bearer token must be scoped to
    pub resource: String,
    /// Tenant served by this endpoint
    pub tenant: String,
}

impl PolicyEndpoint {
    pub fn new(url: impl Into<String>, tenant: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            authority: format!("{}/oauth2", url.trim_end_matches('/')),
            resource: url.clone(),
            url,
            tenant: tenant.into(),
        }
    }

    #[must_use]
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into();
        self
    }
}

/// Locates the policy endpoint serving a domain
pub trait ServiceDiscovery: Send + Sync {
    /// Returns `Ok(None)` when no endpoint is registered for `domain`.
    fn locate(
        &self,
        domain: &str,
        backend: BackendKind,
    ) -> Result<Option<PolicyEndpoint>, ServiceError>;
}

/// Discovery from a fixed domain table
///
/// A lookup for `eu.contoso.com` falls back to `contoso.com` when the
/// subdomain has no entry of its own.
#[derive(Debug, Default, Clone)]
pub struct StaticDiscovery {
    endpoints: HashMap<(BackendKind, String), PolicyEndpoint>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_endpoint(
        mut self,
        backend: BackendKind,
        domain: impl AsRef<str>,
        endpoint: PolicyEndpoint,
    ) -> Self {
        self.register(backend, domain, endpoint);
        self
    }

    pub fn register(&mut self, backend: BackendKind, domain: impl AsRef<str>, endpoint: PolicyEndpoint) {
        self.endpoints
            .insert((backend, domain.as_ref().to_ascii_lowercase()), endpoint);
    }
}

impl ServiceDiscovery for StaticDiscovery {
    fn locate(
        &self,
        domain: &str,
        backend: BackendKind,
    ) -> Result<Option<PolicyEndpoint>, ServiceError> {
        let mut candidate = domain.to_ascii_lowercase();
        loop {
            if let Some(endpoint) = self.endpoints.get(&(backend, candidate.clone())) {
                return Ok(Some(endpoint.clone()));
            }
            match candidate.split_once('.') {
                Some((_, parent)) if parent.contains('.') => candidate = parent.to_string(),
                _ => return Ok(None),
            }
        }
    }
}
