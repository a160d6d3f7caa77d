//! Shared fixtures for contentguard integration tests

#![allow(dead_code)]

use contentguard::{
    ApplicationIdentity, BackendKind, Consent, FixedConsent, LocalPolicyService, PolicyEndpoint,
    PolicyService, ProtectionProfile, ProtectionSession, Right, SessionManager, StaticDiscovery,
    StaticTokenProvider, StorageConfig, TemplateDefinition, TemplateDescriptor, UserIdentity,
    UserRights,
};
use std::sync::Arc;

pub const POLICY_URL: &str = "https://policy.contoso.com";
pub const TENANT: &str = "contoso.com";

/// Test payload used by the end-to-end scenario
pub const HELLO: &[u8] = b"hello world";

pub fn discovery() -> StaticDiscovery {
    StaticDiscovery::new()
        .with_endpoint(
            BackendKind::Cloud,
            TENANT,
            PolicyEndpoint::new(POLICY_URL, TENANT),
        )
        .with_endpoint(
            BackendKind::OnPremises,
            TENANT,
            PolicyEndpoint::new("https://rms.corp.contoso.com", TENANT),
        )
}

/// T1 "Confidential" readable by the whole tenant, T2 "Secret" for bob only
pub fn templates() -> Vec<TemplateDefinition> {
    vec![
        TemplateDefinition::new(
            TemplateDescriptor::new("T1", "Confidential"),
            vec![UserRights::new([TENANT], [Right::View])],
        ),
        TemplateDefinition::new(
            TemplateDescriptor::new("T2", "Secret"),
            vec![UserRights::new(["bob@contoso.com"], [Right::View])],
        ),
    ]
}

pub fn policy_service() -> LocalPolicyService {
    LocalPolicyService::new().with_tenant(TENANT, templates())
}

pub fn app() -> ApplicationIdentity {
    ApplicationIdentity::new("00000000-0000-0000-0000-000000000001", "contentguard-tests", "1.0")
}

pub fn manager_with(policy: Arc<dyn PolicyService>, consent: Consent) -> SessionManager {
    SessionManager::new(Arc::new(discovery()), policy, Arc::new(FixedConsent(consent)))
}

pub fn manager() -> SessionManager {
    manager_with(Arc::new(policy_service()), Consent::AcceptAlways)
}

pub fn open(manager: &SessionManager) -> contentguard::Result<ProtectionProfile> {
    manager.open(app(), StorageConfig::in_memory())
}

pub fn provider(email: &str) -> Arc<StaticTokenProvider> {
    Arc::new(StaticTokenProvider::new(UserIdentity::new(email), "test-token"))
}

pub fn session(
    profile: &ProtectionProfile,
    email: &str,
) -> contentguard::Result<Arc<ProtectionSession>> {
    profile.get_or_create_session(&UserIdentity::new(email), provider(email))
}
