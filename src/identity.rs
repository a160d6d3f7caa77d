//! Application and user identities, plus the identity-provider and consent
//! collaborators consumed by the session manager.
//!
//! The core never speaks an authentication protocol itself. Any type that can
//! turn a [`UserIdentity`] into a bearer token implements [`IdentityProvider`];
//! whether it does so with an authorization-code flow, a device code or a
//! token pasted on the command line is its own business.

use crate::error::{ProtectionError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

/// Identity of the calling application, created once at process start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationIdentity {
    pub application_id: String,
    pub application_name: String,
    pub application_version: String,
}

impl ApplicationIdentity {
    pub fn new(
        application_id: impl Into<String>,
        application_name: impl Into<String>,
        application_version: impl Into<String>,
    ) -> Self {
        Self {
            application_id: application_id.into(),
            application_name: application_name.into(),
            application_version: application_version.into(),
        }
    }

    /// Reject identities with unset fields
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("application id", &self.application_id),
            ("application name", &self.application_name),
            ("application version", &self.application_version),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                return Err(ProtectionError::initialization(format!("{field} is not set")));
            }
        }
        Ok(())
    }
}

/// A signed-in user, identified by email / UPN
///
/// The address is normalized (trimmed, lowercased) so that it can be used as
/// the session cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct UserIdentity {
    email: String,
}

impl From<String> for UserIdentity {
    fn from(email: String) -> Self {
        Self::new(email)
    }
}

impl From<UserIdentity> for String {
    fn from(identity: UserIdentity) -> Self {
        identity.email
    }
}

impl UserIdentity {
    pub fn new(email: impl AsRef<str>) -> Self {
        Self {
            email: email.as_ref().trim().to_ascii_lowercase(),
        }
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    /// Domain part of the address, used for service discovery
    pub fn domain(&self) -> Option<&str> {
        match self.email.rsplit_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Some(domain),
            _ => None,
        }
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.email)
    }
}

/// Bearer credential issued by the identity provider
///
/// Zeroized on drop and never printed.
#[derive(Clone)]
pub struct BearerToken(Zeroizing<String>);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Zeroizing::new(token.into()))
    }

    /// Explicitly access the raw token
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub(crate) fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken([REDACTED])")
    }
}

/// Failure reported by an [`IdentityProvider`]
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("sign-in was cancelled")]
    Cancelled,

    #[error("no credentials available for {0}")]
    NoCredentials(String),

    #[error("token request failed: {0}")]
    RequestFailed(String),
}

/// Resolves the current user and issues bearer tokens on demand
///
/// Both calls may block (interactive sign-in, network round trips).
pub trait IdentityProvider: Send + Sync {
    /// Obtain a bearer token for `identity` from `authority`, scoped to `resource`.
    ///
    /// `claims` carries a claims challenge when the caller is re-authenticating.
    fn acquire_token(
        &self,
        identity: &UserIdentity,
        authority: &str,
        resource: &str,
        claims: Option<&str>,
    ) -> std::result::Result<String, AuthError>;

    /// Pre-identify the signed-in user
    fn user_identity(&self) -> std::result::Result<UserIdentity, AuthError>;
}

/// Ask `provider` who is signed in
///
/// A provider failure, or an answer without an address, is an
/// `Authentication` error.
pub fn resolve_user_identity(provider: &dyn IdentityProvider) -> Result<UserIdentity> {
    let identity = provider
        .user_identity()
        .map_err(|e| ProtectionError::Authentication {
            identity: "the signed-in user".to_string(),
            reason: "the identity provider could not name the signed-in user".to_string(),
            source: Some(Box::new(e)),
        })?;
    if identity.email().is_empty() {
        return Err(ProtectionError::Authentication {
            identity: "the signed-in user".to_string(),
            reason: "the identity provider returned an empty user name".to_string(),
            source: None,
        });
    }
    Ok(identity)
}

/// Identity provider backed by a single pre-issued token
///
/// Useful for command-line tools that receive a token from the environment,
/// and for tests.
pub struct StaticTokenProvider {
    identity: UserIdentity,
    token: BearerToken,
}

impl StaticTokenProvider {
    pub fn new(identity: UserIdentity, token: impl Into<String>) -> Self {
        Self {
            identity,
            token: BearerToken::new(token),
        }
    }
}

impl IdentityProvider for StaticTokenProvider {
    fn acquire_token(
        &self,
        identity: &UserIdentity,
        _authority: &str,
        _resource: &str,
        _claims: Option<&str>,
    ) -> std::result::Result<String, AuthError> {
        if identity != &self.identity {
            return Err(AuthError::NoCredentials(identity.email().to_string()));
        }
        Ok(self.token.expose().to_string())
    }

    fn user_identity(&self) -> std::result::Result<UserIdentity, AuthError> {
        Ok(self.identity.clone())
    }
}

/// Answer to a consent prompt for a remote policy endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consent {
    /// Allow this connection only
    Accept,
    /// Allow and remember the decision
    AcceptAlways,
    Decline,
}

/// Gates first use of a remote policy endpoint
pub trait ConsentDelegate: Send + Sync {
    fn user_consent(&self, url: &str) -> Consent;
}

/// Consent delegate that always gives the same answer
#[derive(Debug, Clone, Copy)]
pub struct FixedConsent(pub Consent);

impl ConsentDelegate for FixedConsent {
    fn user_consent(&self, _url: &str) -> Consent {
        self.0
    }
}
