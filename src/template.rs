//! Templates, resolved protection descriptors and the policy-service interface.

use crate::discovery::PolicyEndpoint;
use crate::error::ProtectionError;
use crate::identity::{BearerToken, UserIdentity};
use crate::license::License;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

/// A server-managed protection policy bundle, as listed to a user
///
/// Everything beyond id and name is policy metadata the core does not
/// interpret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl TemplateDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl fmt::Display for TemplateDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Usage rights a policy can grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Right {
    View,
    Edit,
    Extract,
    Print,
    Export,
    /// Implies every other right
    Owner,
}

impl Right {
    pub const ALL: [Right; 6] = [
        Right::View,
        Right::Edit,
        Right::Extract,
        Right::Print,
        Right::Export,
        Right::Owner,
    ];
}

/// A set of rights granted to a set of principals
///
/// A principal is an exact email address, a bare domain (`contoso.com`),
/// or `*` for any authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRights {
    pub users: Vec<String>,
    pub rights: Vec<Right>,
}

impl UserRights {
    pub fn new(
        users: impl IntoIterator<Item = impl Into<String>>,
        rights: impl IntoIterator<Item = Right>,
    ) -> Self {
        Self {
            users: users.into_iter().map(Into::into).collect(),
            rights: rights.into_iter().collect(),
        }
    }

    pub fn matches(&self, identity: &UserIdentity) -> bool {
        self.users
            .iter()
            .any(|principal| principal_matches(principal, identity))
    }
}

pub(crate) fn principal_matches(principal: &str, identity: &UserIdentity) -> bool {
    let principal = principal.trim();
    if principal == "*" {
        return true;
    }
    if principal.contains('@') {
        return principal.eq_ignore_ascii_case(identity.email());
    }
    identity
        .domain()
        .is_some_and(|domain| domain.eq_ignore_ascii_case(principal))
}

/// Policy resolved from a template for one publishing operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectionDescriptor {
    pub template_id: String,
    pub name: String,
    /// Policy endpoint that issued the descriptor
    pub issuer: String,
    /// Publishing identity; always holds every right
    pub owner: String,
    pub grants: Vec<UserRights>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
}

impl ProtectionDescriptor {
    /// Effective rights of `identity` under this policy
    pub fn rights_for(&self, identity: &UserIdentity) -> BTreeSet<Right> {
        if self.owner.eq_ignore_ascii_case(identity.email()) {
            return Right::ALL.into_iter().collect();
        }
        let granted: BTreeSet<Right> = self
            .grants
            .iter()
            .filter(|grant| grant.matches(identity))
            .flat_map(|grant| grant.rights.iter().copied())
            .collect();
        if granted.contains(&Right::Owner) {
            return Right::ALL.into_iter().collect();
        }
        granted
    }

    pub fn grants_right(&self, identity: &UserIdentity, right: Right) -> bool {
        self.rights_for(identity).contains(&right)
    }

    pub fn is_expired_at(&self, time: DateTime<Utc>) -> bool {
        self.valid_until.is_some_and(|until| time > until)
    }
}

/// Content key wrapped by the policy service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub alg: String,
    pub iv: Vec<u8>,
    pub wrapped: Vec<u8>,
}

/// Error reported by a policy service or discovery collaborator
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service unreachable: {0}")]
    Unavailable(String),

    #[error("bearer token rejected: {0}")]
    Unauthorized(String),

    #[error("template not found: {0}")]
    UnknownTemplate(String),

    #[error("publishing not permitted with template {0}")]
    PublishDenied(String),

    #[error("key release refused: {0}")]
    AccessDenied(String),

    #[error("license rejected: {0}")]
    InvalidLicense(String),

    #[error("template {template_id} cannot be resolved: {reason}")]
    InvalidTemplate { template_id: String, reason: String },
}

impl ServiceError {
    /// Wrap into the public taxonomy
    pub(crate) fn into_protection(self, endpoint: &str, identity: &UserIdentity) -> ProtectionError {
        match self {
            ServiceError::UnknownTemplate(template_id) => {
                ProtectionError::UnknownTemplate { template_id }
            }
            ServiceError::PublishDenied(template_id) => ProtectionError::PolicyDenied {
                template_id,
                identity: identity.email().to_string(),
            },
            ServiceError::InvalidTemplate { template_id, .. } => ProtectionError::PolicyDenied {
                template_id,
                identity: identity.email().to_string(),
            },
            ServiceError::AccessDenied(reason) => {
                ProtectionError::access_denied(identity.email(), reason)
            }
            err @ ServiceError::Unauthorized(_) => ProtectionError::Authentication {
                identity: identity.email().to_string(),
                reason: "the policy service rejected the bearer token".to_string(),
                source: Some(Box::new(err)),
            },
            err @ ServiceError::InvalidLicense(_) => ProtectionError::MalformedLicense {
                reason: "the policy service rejected the license".to_string(),
                source: Some(Box::new(err)),
            },
            err @ ServiceError::Unavailable(_) => ProtectionError::ServiceUnavailable {
                endpoint: endpoint.to_string(),
                source: Some(Box::new(err)),
            },
        }
    }
}

/// Authenticated call context handed to the policy service
#[derive(Debug, Clone, Copy)]
pub struct ServiceContext<'a> {
    pub endpoint: &'a PolicyEndpoint,
    pub token: &'a BearerToken,
    pub identity: &'a UserIdentity,
}

/// Policy/template store consumed by the core
///
/// Implementations may perform blocking network calls. The core never retries
/// a failed call.
pub trait PolicyService: Send + Sync {
    /// Templates available to the caller, in server order
    fn list_templates(
        &self,
        ctx: &ServiceContext<'_>,
    ) -> Result<Vec<TemplateDescriptor>, ServiceError>;

    /// Resolve a template id into a concrete policy owned by the caller
    fn resolve_descriptor(
        &self,
        ctx: &ServiceContext<'_>,
        template_id: &str,
    ) -> Result<ProtectionDescriptor, ServiceError>;

    /// Wrap a fresh content key for the license `license_id`
    fn wrap_key(
        &self,
        ctx: &ServiceContext<'_>,
        license_id: &str,
        content_key: &[u8],
    ) -> Result<WrappedKey, ServiceError>;

    /// Release the content key of `license` to the caller
    fn unwrap_key(
        &self,
        ctx: &ServiceContext<'_>,
        license: &License,
    ) -> Result<Zeroizing<Vec<u8>>, ServiceError>;
}
