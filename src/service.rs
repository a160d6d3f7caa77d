//! In-process policy backend
//!
//! [`LocalPolicyService`] serves template catalogues for one or more tenants
//! and holds a per-tenant master key. Content keys are wrapped with
//! AES-256-GCM under that master key, bound to the license id as associated
//! data, and only released to identities the license policy grants `VIEW`.

use crate::license::{License, KEY_WRAP_ALG};
use crate::template::{
    principal_matches, PolicyService, ProtectionDescriptor, Right, ServiceContext, ServiceError,
    TemplateDescriptor, UserRights, WrappedKey,
};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use tracing::debug;
use zeroize::Zeroizing;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

/// How long protected content stays consumable
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentExpiry {
    #[default]
    Never,
    At(DateTime<Utc>),
    AfterDays(i64),
}

impl ContentExpiry {
    /// Absolute expiry time, or `None` when the content never expires
    ///
    /// Fails when `AfterDays` lands outside the representable date range.
    fn resolve(
        &self,
        template_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ServiceError> {
        match self {
            ContentExpiry::Never => Ok(None),
            ContentExpiry::At(time) => Ok(Some(*time)),
            ContentExpiry::AfterDays(days) => Duration::try_days(*days)
                .and_then(|delta| now.checked_add_signed(delta))
                .map(Some)
                .ok_or_else(|| ServiceError::InvalidTemplate {
                    template_id: template_id.to_string(),
                    reason: format!("expiry of {days} days is out of range"),
                }),
        }
    }
}

/// Server-side definition of a template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDefinition {
    #[serde(flatten)]
    pub descriptor: TemplateDescriptor,
    pub grants: Vec<UserRights>,
    /// Principals the template is listed to; empty means the whole tenant
    #[serde(default)]
    pub audience: Vec<String>,
    /// Principals allowed to publish; empty means the whole audience
    #[serde(default)]
    pub publishers: Vec<String>,
    #[serde(default)]
    pub expiry: ContentExpiry,
}

impl TemplateDefinition {
    pub fn new(descriptor: TemplateDescriptor, grants: Vec<UserRights>) -> Self {
        Self {
            descriptor,
            grants,
            audience: Vec::new(),
            publishers: Vec::new(),
            expiry: ContentExpiry::Never,
        }
    }

    #[must_use]
    pub fn audience(mut self, principals: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.audience = principals.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn publishers(mut self, principals: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.publishers = principals.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn expiry(mut self, expiry: ContentExpiry) -> Self {
        self.expiry = expiry;
        self
    }

    fn visible_to(&self, ctx: &ServiceContext<'_>) -> bool {
        self.audience.is_empty()
            || self
                .audience
                .iter()
                .any(|principal| principal_matches(principal, ctx.identity))
    }

    fn publishable_by(&self, ctx: &ServiceContext<'_>) -> bool {
        self.publishers.is_empty()
            || self
                .publishers
                .iter()
                .any(|principal| principal_matches(principal, ctx.identity))
    }
}

/// Template catalogue file: tenant name to ordered template list
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Catalogue {
    pub tenants: HashMap<String, Vec<TemplateDefinition>>,
}

struct Tenant {
    master_key: Zeroizing<[u8; KEY_SIZE]>,
    templates: Vec<TemplateDefinition>,
}

impl Tenant {
    fn new(templates: Vec<TemplateDefinition>) -> Self {
        let mut master_key = Zeroizing::new([0u8; KEY_SIZE]);
        OsRng.fill_bytes(&mut master_key[..]);
        Self {
            master_key,
            templates,
        }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.master_key[..]))
    }
}

/// Policy service that runs inside the calling process
pub struct LocalPolicyService {
    tenants: RwLock<HashMap<String, Tenant>>,
    accepted_tokens: RwLock<HashSet<String>>,
    available: AtomicBool,
}

impl Default for LocalPolicyService {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalPolicyService {
    pub fn new() -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            accepted_tokens: RwLock::new(HashSet::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Serve `templates` for `tenant`, in the given order
    #[must_use]
    pub fn with_tenant(self, tenant: impl Into<String>, templates: Vec<TemplateDefinition>) -> Self {
        self.add_tenant(tenant, templates);
        self
    }

    /// Only accept this bearer token (may be called repeatedly)
    ///
    /// With no registered tokens any non-blank token is accepted.
    #[must_use]
    pub fn with_accepted_token(self, token: impl Into<String>) -> Self {
        self.accepted_tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.into());
        self
    }

    pub fn add_tenant(&self, tenant: impl Into<String>, templates: Vec<TemplateDefinition>) {
        self.tenants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant.into().to_ascii_lowercase(), Tenant::new(templates));
    }

    pub fn from_catalogue(catalogue: Catalogue) -> Self {
        let service = Self::new();
        for (tenant, templates) in catalogue.tenants {
            service.add_tenant(tenant, templates);
        }
        service
    }

    /// Load a JSON catalogue file
    pub fn load_catalogue(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let catalogue: Catalogue = serde_json::from_slice(&bytes)?;
        for template in catalogue.tenants.values().flatten() {
            if let ContentExpiry::AfterDays(days) = template.expiry {
                if Duration::try_days(days).is_none() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("template {}: expiry of {days} days is out of range", template.descriptor.id),
                    ));
                }
            }
        }
        Ok(Self::from_catalogue(catalogue))
    }

    /// Simulate an outage; every call fails with `ServiceError::Unavailable`
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn with_tenant_for<T>(
        &self,
        ctx: &ServiceContext<'_>,
        f: impl FnOnce(&Tenant) -> Result<T, ServiceError>,
    ) -> Result<T, ServiceError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(ServiceError::Unavailable(format!(
                "{} is not responding",
                ctx.endpoint.url
            )));
        }
        self.authorize(ctx)?;
        let tenants = self.tenants.read().unwrap_or_else(PoisonError::into_inner);
        let tenant = tenants
            .get(&ctx.endpoint.tenant.to_ascii_lowercase())
            .ok_or_else(|| {
                ServiceError::Unavailable(format!("tenant {} is not served", ctx.endpoint.tenant))
            })?;
        f(tenant)
    }

    fn authorize(&self, ctx: &ServiceContext<'_>) -> Result<(), ServiceError> {
        let token = ctx.token.expose();
        if token.trim().is_empty() {
            return Err(ServiceError::Unauthorized("empty bearer token".to_string()));
        }
        let accepted = self
            .accepted_tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if !accepted.is_empty() && !accepted.contains(token) {
            return Err(ServiceError::Unauthorized("unknown bearer token".to_string()));
        }
        Ok(())
    }
}

impl PolicyService for LocalPolicyService {
    fn list_templates(
        &self,
        ctx: &ServiceContext<'_>,
    ) -> Result<Vec<TemplateDescriptor>, ServiceError> {
        self.with_tenant_for(ctx, |tenant| {
            Ok(tenant
                .templates
                .iter()
                .filter(|t| t.visible_to(ctx))
                .map(|t| t.descriptor.clone())
                .collect())
        })
    }

    fn resolve_descriptor(
        &self,
        ctx: &ServiceContext<'_>,
        template_id: &str,
    ) -> Result<ProtectionDescriptor, ServiceError> {
        self.with_tenant_for(ctx, |tenant| {
            let template = tenant
                .templates
                .iter()
                .find(|t| t.descriptor.id == template_id && t.visible_to(ctx))
                .ok_or_else(|| ServiceError::UnknownTemplate(template_id.to_string()))?;

            if !template.publishable_by(ctx) {
                return Err(ServiceError::PublishDenied(template_id.to_string()));
            }

            Ok(ProtectionDescriptor {
                template_id: template.descriptor.id.clone(),
                name: template.descriptor.name.clone(),
                issuer: ctx.endpoint.url.clone(),
                owner: ctx.identity.email().to_string(),
                grants: template.grants.clone(),
                valid_until: template.expiry.resolve(template_id, Utc::now())?,
            })
        })
    }

    fn wrap_key(
        &self,
        ctx: &ServiceContext<'_>,
        license_id: &str,
        content_key: &[u8],
    ) -> Result<WrappedKey, ServiceError> {
        self.with_tenant_for(ctx, |tenant| {
            let mut iv = [0u8; NONCE_SIZE];
            OsRng.fill_bytes(&mut iv);

            let wrapped = tenant
                .cipher()
                .encrypt(
                    Nonce::from_slice(&iv),
                    Payload {
                        msg: content_key,
                        aad: license_id.as_bytes(),
                    },
                )
                .map_err(|_| ServiceError::Unavailable("key wrapping failed".to_string()))?;

            Ok(WrappedKey {
                alg: KEY_WRAP_ALG.to_string(),
                iv: iv.to_vec(),
                wrapped,
            })
        })
    }

    fn unwrap_key(
        &self,
        ctx: &ServiceContext<'_>,
        license: &License,
    ) -> Result<Zeroizing<Vec<u8>>, ServiceError> {
        self.with_tenant_for(ctx, |tenant| {
            if license.issuer() != ctx.endpoint.url {
                return Err(ServiceError::AccessDenied(format!(
                    "license was issued by {}",
                    license.issuer()
                )));
            }

            let wrapped = license.wrapped_key();
            if wrapped.alg != KEY_WRAP_ALG || wrapped.iv.len() != NONCE_SIZE {
                return Err(ServiceError::InvalidLicense(
                    "unsupported key wrapping".to_string(),
                ));
            }

            let content_key = Zeroizing::new(
                tenant
                    .cipher()
                    .decrypt(
                        Nonce::from_slice(&wrapped.iv),
                        Payload {
                            msg: &wrapped.wrapped,
                            aad: license.license_id().as_bytes(),
                        },
                    )
                    .map_err(|_| {
                        ServiceError::InvalidLicense("wrapped key failed to unwrap".to_string())
                    })?,
            );

            license
                .verify_binding(&content_key)
                .map_err(|_| ServiceError::InvalidLicense("policy binding mismatch".to_string()))?;

            let descriptor = license.descriptor();
            if !descriptor.grants_right(ctx.identity, Right::View) {
                return Err(ServiceError::AccessDenied(
                    "no VIEW right in license policy".to_string(),
                ));
            }
            if descriptor.is_expired_at(Utc::now()) {
                return Err(ServiceError::AccessDenied("content has expired".to_string()));
            }

            debug!(
                license_id = license.license_id(),
                identity = %ctx.identity,
                "released content key"
            );
            Ok(content_key)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::PolicyEndpoint;
    use crate::identity::{BearerToken, UserIdentity};

    fn service() -> LocalPolicyService {
        LocalPolicyService::new().with_tenant(
            "contoso.com",
            vec![
                TemplateDefinition::new(
                    TemplateDescriptor::new("T1", "Confidential"),
                    vec![UserRights::new(["contoso.com"], [Right::View])],
                ),
                TemplateDefinition::new(
                    TemplateDescriptor::new("T2", "Secret"),
                    vec![UserRights::new(["contoso.com"], [Right::View])],
                )
                .publishers(["alice@contoso.com"]),
                TemplateDefinition::new(
                    TemplateDescriptor::new("T3", "Board Only"),
                    vec![UserRights::new(["alice@contoso.com"], [Right::View])],
                )
                .audience(["alice@contoso.com"]),
            ],
        )
    }

    fn endpoint() -> PolicyEndpoint {
        PolicyEndpoint::new("https://policy.contoso.com", "contoso.com")
    }

    #[test]
    fn test_listing_respects_order_and_audience() -> Result<(), ServiceError> {
        let svc = service();
        let endpoint = endpoint();
        let token = BearerToken::new("t");

        let alice = UserIdentity::new("alice@contoso.com");
        let ctx = ServiceContext {
            endpoint: &endpoint,
            token: &token,
            identity: &alice,
        };
        let ids: Vec<_> = svc.list_templates(&ctx)?.into_iter().map(|t| t.id).collect();
        assert_eq!(ids, ["T1", "T2", "T3"]);

        let bob = UserIdentity::new("bob@contoso.com");
        let ctx = ServiceContext {
            identity: &bob,
            ..ctx
        };
        let ids: Vec<_> = svc.list_templates(&ctx)?.into_iter().map(|t| t.id).collect();
        assert_eq!(ids, ["T1", "T2"]);
        Ok(())
    }

    #[test]
    fn test_resolve_descriptor_rules() {
        let svc = service();
        let endpoint = endpoint();
        let token = BearerToken::new("t");
        let bob = UserIdentity::new("bob@contoso.com");
        let ctx = ServiceContext {
            endpoint: &endpoint,
            token: &token,
            identity: &bob,
        };

        let descriptor = svc.resolve_descriptor(&ctx, "T1").unwrap();
        assert_eq!(descriptor.owner, "bob@contoso.com");
        assert_eq!(descriptor.issuer, "https://policy.contoso.com");

        assert!(matches!(
            svc.resolve_descriptor(&ctx, "T2"),
            Err(ServiceError::PublishDenied(_))
        ));
        assert!(matches!(
            svc.resolve_descriptor(&ctx, "T3"),
            Err(ServiceError::UnknownTemplate(_))
        ));
    }

    #[test]
    fn test_token_and_availability_checks() {
        let svc = service().with_accepted_token("good");
        let endpoint = endpoint();
        let alice = UserIdentity::new("alice@contoso.com");

        let bad = BearerToken::new("bad");
        let ctx = ServiceContext {
            endpoint: &endpoint,
            token: &bad,
            identity: &alice,
        };
        assert!(matches!(
            svc.list_templates(&ctx),
            Err(ServiceError::Unauthorized(_))
        ));

        let good = BearerToken::new("good");
        let ctx = ServiceContext {
            token: &good,
            ..ctx
        };
        assert!(svc.list_templates(&ctx).is_ok());

        svc.set_available(false);
        assert!(matches!(
            svc.list_templates(&ctx),
            Err(ServiceError::Unavailable(_))
        ));
    }

    #[test]
    fn test_catalogue_json() -> Result<(), Box<dyn std::error::Error>> {
        let json = r#"{
            "tenants": {
                "contoso.com": [
                    { "id": "T1", "name": "Confidential",
                      "grants": [ { "users": ["contoso.com"], "rights": ["VIEW"] } ] },
                    { "id": "T2", "name": "Secret", "description": "Top secret",
                      "grants": [ { "users": ["*"], "rights": ["VIEW", "EDIT"] } ],
                      "expiry": { "afterDays": 30 } }
                ]
            }
        }"#;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("catalogue.json");
        std::fs::write(&path, json)?;

        let svc = LocalPolicyService::load_catalogue(&path)?;
        let endpoint = endpoint();
        let token = BearerToken::new("t");
        let alice = UserIdentity::new("alice@contoso.com");
        let ctx = ServiceContext {
            endpoint: &endpoint,
            token: &token,
            identity: &alice,
        };
        let templates = svc.list_templates(&ctx)?;
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[1].description, "Top secret");

        let descriptor = svc.resolve_descriptor(&ctx, "T2")?;
        assert!(descriptor.valid_until.is_some());
        Ok(())
    }

    #[test]
    fn test_expiry_out_of_range_is_rejected() {
        let svc = LocalPolicyService::new().with_tenant(
            "contoso.com",
            vec![
                TemplateDefinition::new(TemplateDescriptor::new("MAX", "Forever"), Vec::new())
                    .expiry(ContentExpiry::AfterDays(i64::MAX)),
                TemplateDefinition::new(TemplateDescriptor::new("LONG", "Very long"), Vec::new())
                    .expiry(ContentExpiry::AfterDays(1_000_000_000)),
            ],
        );
        let endpoint = endpoint();
        let token = BearerToken::new("t");
        let alice = UserIdentity::new("alice@contoso.com");
        let ctx = ServiceContext {
            endpoint: &endpoint,
            token: &token,
            identity: &alice,
        };

        for id in ["MAX", "LONG"] {
            assert!(matches!(
                svc.resolve_descriptor(&ctx, id),
                Err(ServiceError::InvalidTemplate { .. })
            ));
        }
    }

    #[test]
    fn test_catalogue_with_unrepresentable_expiry() -> Result<(), Box<dyn std::error::Error>> {
        let json = format!(
            r#"{{ "tenants": {{ "contoso.com": [
                {{ "id": "T1", "name": "Forever", "grants": [],
                   "expiry": {{ "afterDays": {} }} }}
            ] }} }}"#,
            i64::MAX
        );
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("catalogue.json");
        std::fs::write(&path, json)?;

        let err = LocalPolicyService::load_catalogue(&path).err().ok_or("catalogue loaded")?;
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        Ok(())
    }
}
