//! Session manager: the protection profile and its per-identity sessions
//!
//! A [`SessionManager`] is the explicit context object for the process. It
//! opens at most one live [`ProtectionProfile`], which owns every
//! [`ProtectionSession`] created through it. Sessions are cached by the
//! identity's email so that the authentication and discovery round trips
//! happen once per identity per profile.
//!
//! Teardown order is strict: `ProtectionProfile::close` waits for in-flight
//! session calls to finish, closes every session, and only then releases the
//! profile. Any session call made afterwards fails with `UseAfterClose`.
//!
//! # Example
//!
//! ```no_run
//! use contentguard::{
//!     ApplicationIdentity, BackendKind, Consent, FixedConsent, LocalPolicyService,
//!     PolicyEndpoint, SessionManager, StaticDiscovery, StaticTokenProvider, StorageConfig,
//!     UserIdentity,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let discovery = StaticDiscovery::new().with_endpoint(
//!     BackendKind::Cloud,
//!     "contoso.com",
//!     PolicyEndpoint::new("https://policy.contoso.com", "contoso.com"),
//! );
//! let manager = SessionManager::new(
//!     Arc::new(discovery),
//!     Arc::new(LocalPolicyService::new()),
//!     Arc::new(FixedConsent(Consent::AcceptAlways)),
//! );
//!
//! let app = ApplicationIdentity::new("app-id", "quickstart", "1.0");
//! let profile = manager.open(app, StorageConfig::in_memory())?;
//!
//! let alice = UserIdentity::new("alice@contoso.com");
//! let credentials = Arc::new(StaticTokenProvider::new(alice.clone(), "token"));
//! let session = profile.get_or_create_session(&alice, credentials)?;
//! let templates = session.list_templates()?;
//!
//! profile.close()?;
//! # Ok(())
//! # }
//! ```

use crate::cache::{ConsentCache, StorageConfig};
use crate::discovery::{PolicyEndpoint, ServiceDiscovery};
use crate::error::{ProtectionError, Result};
use crate::identity::{ApplicationIdentity, BearerToken, Consent, ConsentDelegate, IdentityProvider, UserIdentity};
use crate::template::{PolicyService, ServiceContext, ServiceError, TemplateDescriptor};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tracing::{debug, info, warn};

/// Explicit process context guarding profile initialization
pub struct SessionManager {
    profile_open: Arc<AtomicBool>,
    discovery: Arc<dyn ServiceDiscovery>,
    policy: Arc<dyn PolicyService>,
    consent: Arc<dyn ConsentDelegate>,
}

impl SessionManager {
    pub fn new(
        discovery: Arc<dyn ServiceDiscovery>,
        policy: Arc<dyn PolicyService>,
        consent: Arc<dyn ConsentDelegate>,
    ) -> Self {
        Self {
            profile_open: Arc::new(AtomicBool::new(false)),
            discovery,
            policy,
            consent,
        }
    }

    /// Open the profile for this context
    ///
    /// Fails with `InitializationError` if the application identity is
    /// incomplete, the cache directory cannot be prepared, or a profile opened
    /// by this manager is still live.
    pub fn open(&self, app: ApplicationIdentity, storage: StorageConfig) -> Result<ProtectionProfile> {
        app.validate()?;

        if self
            .profile_open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ProtectionError::initialization(
                "a protection profile is already open in this context",
            ));
        }

        let consent_cache = match ConsentCache::open(&storage) {
            Ok(cache) => cache,
            Err(e) => {
                self.profile_open.store(false, Ordering::Release);
                return Err(ProtectionError::initialization(format!(
                    "cache storage could not be prepared: {e}"
                )));
            }
        };

        info!(
            application = %app.application_name,
            version = %app.application_version,
            backend = ?storage.backend,
            "protection profile opened"
        );

        Ok(ProtectionProfile {
            inner: Arc::new(ProfileInner {
                app,
                storage,
                discovery: Arc::clone(&self.discovery),
                policy: Arc::clone(&self.policy),
                consent: Arc::clone(&self.consent),
                consent_cache,
                sessions: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                open_flag: Arc::clone(&self.profile_open),
            }),
        })
    }

    /// Whether a profile opened by this manager is live
    pub fn has_open_profile(&self) -> bool {
        self.profile_open.load(Ordering::Acquire)
    }
}

type SessionSlot = Arc<Mutex<Option<Arc<ProtectionSession>>>>;

struct ProfileInner {
    app: ApplicationIdentity,
    storage: StorageConfig,
    discovery: Arc<dyn ServiceDiscovery>,
    policy: Arc<dyn PolicyService>,
    consent: Arc<dyn ConsentDelegate>,
    consent_cache: ConsentCache,
    sessions: Mutex<HashMap<String, SessionSlot>>,
    closed: AtomicBool,
    open_flag: Arc<AtomicBool>,
}

impl ProfileInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProtectionError::UseAfterClose { resource: "profile" });
        }
        Ok(())
    }

    fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let slots: Vec<SessionSlot> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in slots {
            // waits for any creation still holding the slot
            let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(session) = slot.take() {
                session.close();
            }
        }
        self.open_flag.store(false, Ordering::Release);
        true
    }
}

impl Drop for ProfileInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Process-wide root resource owning every protection session
#[derive(Clone)]
pub struct ProtectionProfile {
    inner: Arc<ProfileInner>,
}

impl ProtectionProfile {
    pub fn application(&self) -> &ApplicationIdentity {
        &self.inner.app
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.inner.storage
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of live cached sessions
    pub fn session_count(&self) -> usize {
        let slots: Vec<SessionSlot> = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        slots
            .iter()
            .filter(|slot| {
                slot.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .as_ref()
                    .is_some_and(|s| !s.is_closed())
            })
            .count()
    }

    /// Return the cached session for `user`, or create one
    ///
    /// Creation blocks on service discovery, the consent prompt (first use of
    /// an endpoint) and a token request to `credentials`. The first failure is
    /// returned as is; nothing is retried. Callers on a latency-sensitive path
    /// should run this on a worker thread.
    pub fn get_or_create_session(
        &self,
        user: &UserIdentity,
        credentials: Arc<dyn IdentityProvider>,
    ) -> Result<Arc<ProtectionSession>> {
        self.inner.ensure_open()?;

        let slot = {
            let mut sessions = self
                .inner
                .sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(sessions.entry(user.email().to_string()).or_default())
        };

        let mut cached = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = cached.as_ref().filter(|s| !s.is_closed()) {
            debug!(identity = %user, "session cache hit");
            return Ok(Arc::clone(session));
        }

        // the profile may have been closed while this slot was contended
        let created = self
            .inner
            .ensure_open()
            .and_then(|_| {
                debug!(identity = %user, "session cache miss");
                self.create_session(user, credentials)
            });
        match created {
            Ok(session) => {
                *cached = Some(Arc::clone(&session));
                Ok(session)
            }
            Err(e) => {
                drop(cached);
                self.release_slot(user, &slot);
                Err(e)
            }
        }
    }

    /// Drop `slot` from the cache if it is still empty and nobody else waits on it
    fn release_slot(&self, user: &UserIdentity, slot: &SessionSlot) {
        let mut sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let unused = sessions.get(user.email()).is_some_and(|existing| {
            Arc::ptr_eq(existing, slot)
                && Arc::strong_count(slot) == 2
                && slot.try_lock().is_ok_and(|cached| cached.is_none())
        });
        if unused {
            sessions.remove(user.email());
        }
    }

    fn create_session(
        &self,
        user: &UserIdentity,
        credentials: Arc<dyn IdentityProvider>,
    ) -> Result<Arc<ProtectionSession>> {
        let domain = user.domain().ok_or_else(|| ProtectionError::Discovery {
            domain: user.email().to_string(),
        })?;

        let endpoint = self
            .inner
            .discovery
            .locate(domain, self.inner.storage.backend)
            .map_err(|e| match e {
                ServiceError::Unavailable(_) => ProtectionError::ServiceUnavailable {
                    endpoint: format!("discovery for {domain}"),
                    source: Some(Box::new(e)),
                },
                _ => ProtectionError::Discovery {
                    domain: domain.to_string(),
                },
            })?
            .ok_or_else(|| ProtectionError::Discovery {
                domain: domain.to_string(),
            })?;

        self.check_consent(&endpoint)?;

        let token = acquire_token(credentials.as_ref(), user, &endpoint, None)?;

        info!(identity = %user, endpoint = %endpoint.url, "protection session created");
        Ok(Arc::new(ProtectionSession {
            session_id: uuid::Uuid::new_v4().to_string(),
            identity: user.clone(),
            profile: Arc::downgrade(&self.inner),
            policy: Arc::clone(&self.inner.policy),
            credentials,
            state: RwLock::new(SessionState::Open(OpenSession {
                endpoint,
                token,
                templates: Mutex::new(None),
            })),
        }))
    }

    fn check_consent(&self, endpoint: &PolicyEndpoint) -> Result<()> {
        if self.inner.consent_cache.is_accepted(&endpoint.url) {
            return Ok(());
        }
        match self.inner.consent.user_consent(&endpoint.url) {
            Consent::Accept => Ok(()),
            Consent::AcceptAlways => {
                if let Err(e) = self.inner.consent_cache.remember(&endpoint.url) {
                    warn!(endpoint = %endpoint.url, error = %e, "failed to persist consent");
                }
                Ok(())
            }
            Consent::Decline => {
                info!(endpoint = %endpoint.url, "consent declined");
                Err(ProtectionError::ConsentDenied {
                    url: endpoint.url.clone(),
                })
            }
        }
    }

    /// Tear down every session, then release the profile
    ///
    /// Blocks until in-flight session calls finish. Calling it again is a
    /// no-op.
    pub fn close(&self) -> Result<()> {
        if self.inner.shutdown() {
            info!(application = %self.inner.app.application_name, "protection profile closed");
        }
        Ok(())
    }
}

fn acquire_token(
    credentials: &dyn IdentityProvider,
    user: &UserIdentity,
    endpoint: &PolicyEndpoint,
    claims: Option<&str>,
) -> Result<BearerToken> {
    let token = credentials
        .acquire_token(user, &endpoint.authority, &endpoint.resource, claims)
        .map(BearerToken::new)
        .map_err(|e| ProtectionError::Authentication {
            identity: user.email().to_string(),
            reason: "the identity provider could not issue a token".to_string(),
            source: Some(Box::new(e)),
        })?;
    if token.is_blank() {
        return Err(ProtectionError::Authentication {
            identity: user.email().to_string(),
            reason: "the identity provider returned an empty token".to_string(),
            source: None,
        });
    }
    Ok(token)
}

pub(crate) struct OpenSession {
    pub(crate) endpoint: PolicyEndpoint,
    token: BearerToken,
    templates: Mutex<Option<Vec<TemplateDescriptor>>>,
}

impl OpenSession {
    pub(crate) fn context<'a>(&'a self, identity: &'a UserIdentity) -> ServiceContext<'a> {
        ServiceContext {
            endpoint: &self.endpoint,
            token: &self.token,
            identity,
        }
    }

    pub(crate) fn cached_templates(&self) -> Option<Vec<TemplateDescriptor>> {
        self.templates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

enum SessionState {
    Open(OpenSession),
    Closed,
}

/// Per-identity protection context
///
/// Holds the bearer token and located endpoint for one identity. Safe to share
/// between threads; read-only calls run concurrently.
pub struct ProtectionSession {
    session_id: String,
    identity: UserIdentity,
    profile: Weak<ProfileInner>,
    pub(crate) policy: Arc<dyn PolicyService>,
    credentials: Arc<dyn IdentityProvider>,
    state: RwLock<SessionState>,
}

impl ProtectionSession {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            *self.state.read().unwrap_or_else(PoisonError::into_inner),
            SessionState::Closed
        ) || self.profile.strong_count() == 0
    }

    /// Policy endpoint this session is bound to
    pub fn endpoint(&self) -> Result<PolicyEndpoint> {
        self.with_open(|open| Ok(open.endpoint.clone()))
    }

    /// Run `f` against the open session state
    ///
    /// Holds the state read lock for the duration of `f`, which is what makes
    /// profile teardown wait for in-flight calls.
    pub(crate) fn with_open<T>(&self, f: impl FnOnce(&OpenSession) -> Result<T>) -> Result<T> {
        if self.profile.strong_count() == 0 {
            return Err(ProtectionError::UseAfterClose { resource: "session" });
        }
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match &*state {
            SessionState::Open(open) => f(open),
            SessionState::Closed => Err(ProtectionError::UseAfterClose { resource: "session" }),
        }
    }

    /// Templates available to this identity, in server order
    ///
    /// The first successful listing is cached for the life of the session.
    pub fn list_templates(&self) -> Result<Vec<TemplateDescriptor>> {
        self.with_open(|open| {
            if let Some(templates) = open.cached_templates() {
                return Ok(templates);
            }
            self.fetch_templates(open)
        })
    }

    /// Re-fetch the template list and replace the cached copy
    pub fn refresh_templates(&self) -> Result<Vec<TemplateDescriptor>> {
        self.with_open(|open| self.fetch_templates(open))
    }

    fn fetch_templates(&self, open: &OpenSession) -> Result<Vec<TemplateDescriptor>> {
        let templates = self
            .policy
            .list_templates(&open.context(&self.identity))
            .map_err(|e| e.into_protection(&open.endpoint.url, &self.identity))?;
        debug!(identity = %self.identity, count = templates.len(), "fetched templates");
        *open.templates.lock().unwrap_or_else(PoisonError::into_inner) = Some(templates.clone());
        Ok(templates)
    }

    /// Request a new bearer token, optionally answering a claims challenge
    ///
    /// Only ever invoked by the caller; the core does not refresh tokens on
    /// its own.
    pub fn refresh_token(&self, claims: Option<&str>) -> Result<()> {
        if self.profile.strong_count() == 0 {
            return Err(ProtectionError::UseAfterClose { resource: "session" });
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match &mut *state {
            SessionState::Open(open) => {
                open.token =
                    acquire_token(self.credentials.as_ref(), &self.identity, &open.endpoint, claims)?;
                debug!(identity = %self.identity, "bearer token refreshed");
                Ok(())
            }
            SessionState::Closed => Err(ProtectionError::UseAfterClose { resource: "session" }),
        }
    }

    /// Waits for readers, then drops the token and cached templates
    fn close(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = SessionState::Closed;
        debug!(identity = %self.identity, session_id = %self.session_id, "protection session closed");
    }
}

impl std::fmt::Debug for ProtectionProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectionProfile")
            .field("application", self.application())
            .field("storage", self.storage())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl std::fmt::Debug for ProtectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectionSession")
            .field("session_id", &self.session_id)
            .field("identity", &self.identity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{BackendKind, StaticDiscovery};
    use crate::error::ErrorKind;
    use crate::identity::{AuthError, FixedConsent, StaticTokenProvider};
    use crate::service::{LocalPolicyService, TemplateDefinition};
    use crate::template::{Right, UserRights};
    use std::sync::atomic::AtomicUsize;

    struct CountingProvider {
        calls: AtomicUsize,
        token: &'static str,
    }

    impl IdentityProvider for CountingProvider {
        fn acquire_token(
            &self,
            _identity: &UserIdentity,
            _authority: &str,
            _resource: &str,
            _claims: Option<&str>,
        ) -> std::result::Result<String, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.token.to_string())
        }

        fn user_identity(&self) -> std::result::Result<UserIdentity, AuthError> {
            Ok(UserIdentity::new("alice@contoso.com"))
        }
    }

    struct FailingProvider;

    impl IdentityProvider for FailingProvider {
        fn acquire_token(
            &self,
            _identity: &UserIdentity,
            _authority: &str,
            _resource: &str,
            _claims: Option<&str>,
        ) -> std::result::Result<String, AuthError> {
            Err(AuthError::Cancelled)
        }

        fn user_identity(&self) -> std::result::Result<UserIdentity, AuthError> {
            Err(AuthError::Cancelled)
        }
    }

    fn manager(consent: Consent) -> SessionManager {
        let discovery = StaticDiscovery::new().with_endpoint(
            BackendKind::Cloud,
            "contoso.com",
            PolicyEndpoint::new("https://policy.contoso.com", "contoso.com"),
        );
        let policy = LocalPolicyService::new().with_tenant(
            "contoso.com",
            vec![TemplateDefinition::new(
                TemplateDescriptor::new("T1", "Confidential"),
                vec![UserRights::new(["contoso.com"], [Right::View])],
            )],
        );
        SessionManager::new(
            Arc::new(discovery),
            Arc::new(policy),
            Arc::new(FixedConsent(consent)),
        )
    }

    fn app() -> ApplicationIdentity {
        ApplicationIdentity::new("id", "test", "1.0")
    }

    fn counting(token: &'static str) -> Arc<CountingProvider> {
        Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            token,
        })
    }

    #[test]
    fn test_single_live_profile_per_manager() -> Result<()> {
        let m = manager(Consent::Accept);
        let profile = m.open(app(), StorageConfig::in_memory())?;
        assert!(m.has_open_profile());

        let err = m.open(app(), StorageConfig::in_memory()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Initialization);

        profile.close()?;
        assert!(!m.has_open_profile());
        let reopened = m.open(app(), StorageConfig::in_memory())?;
        reopened.close()
    }

    #[test]
    fn test_incomplete_application_identity() {
        let m = manager(Consent::Accept);
        let err = m
            .open(ApplicationIdentity::new("", "test", "1.0"), StorageConfig::in_memory())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Initialization);
        assert!(!m.has_open_profile());
    }

    #[test]
    fn test_session_is_cached_per_identity() -> Result<()> {
        let m = manager(Consent::Accept);
        let profile = m.open(app(), StorageConfig::in_memory())?;
        let provider = counting("token");

        let alice = UserIdentity::new("alice@contoso.com");
        let a1 = profile.get_or_create_session(&alice, provider.clone())?;
        let a2 = profile.get_or_create_session(&UserIdentity::new("ALICE@contoso.com"), provider.clone())?;
        assert!(Arc::ptr_eq(&a1, &a2));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        let bob = UserIdentity::new("bob@contoso.com");
        let b = profile.get_or_create_session(&bob, provider.clone())?;
        assert!(!Arc::ptr_eq(&a1, &b));
        assert_eq!(profile.session_count(), 2);
        profile.close()
    }

    #[test]
    fn test_session_creation_failures() -> Result<()> {
        let m = manager(Consent::Accept);
        let profile = m.open(app(), StorageConfig::in_memory())?;

        let err = profile
            .get_or_create_session(&UserIdentity::new("alice@contoso.com"), Arc::new(FailingProvider))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);

        let err = profile
            .get_or_create_session(&UserIdentity::new("alice@contoso.com"), counting("   "))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);

        let err = profile
            .get_or_create_session(&UserIdentity::new("eve@fabrikam.com"), counting("t"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Discovery);

        let err = profile
            .get_or_create_session(&UserIdentity::new("no-domain"), counting("t"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Discovery);

        assert_eq!(profile.session_count(), 0);
        assert!(profile.inner.sessions.lock().unwrap().is_empty());
        profile.close()
    }

    #[test]
    fn test_failed_creation_leaves_no_slot() -> Result<()> {
        let m = manager(Consent::Accept);
        let profile = m.open(app(), StorageConfig::in_memory())?;

        for i in 0..16 {
            let user = UserIdentity::new(format!("user{i}@fabrikam.com"));
            assert!(profile.get_or_create_session(&user, counting("t")).is_err());
        }
        assert!(profile.inner.sessions.lock().unwrap().is_empty());

        let alice = UserIdentity::new("alice@contoso.com");
        assert!(profile
            .get_or_create_session(&alice, Arc::new(FailingProvider))
            .is_err());
        let session = profile.get_or_create_session(&alice, counting("t"))?;
        assert_eq!(profile.inner.sessions.lock().unwrap().len(), 1);
        assert!(Arc::ptr_eq(
            &session,
            &profile.get_or_create_session(&alice, counting("t"))?
        ));
        profile.close()
    }

    #[test]
    fn test_consent_declined() -> Result<()> {
        let m = manager(Consent::Decline);
        let profile = m.open(app(), StorageConfig::in_memory())?;
        let provider = counting("t");
        let err = profile
            .get_or_create_session(&UserIdentity::new("alice@contoso.com"), provider.clone())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConsentDenied);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        profile.close()
    }

    #[test]
    fn test_close_invalidates_sessions() -> Result<()> {
        let m = manager(Consent::Accept);
        let profile = m.open(app(), StorageConfig::in_memory())?;
        let alice = UserIdentity::new("alice@contoso.com");
        let session = profile.get_or_create_session(&alice, counting("t"))?;
        assert_eq!(session.list_templates()?.len(), 1);

        profile.close()?;
        profile.close()?;
        assert!(session.is_closed());

        let err = session.list_templates().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UseAfterClose);
        let err = session.refresh_token(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UseAfterClose);
        let err = profile
            .get_or_create_session(&alice, counting("t"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UseAfterClose);
        Ok(())
    }

    #[test]
    fn test_dropping_profile_closes_sessions() -> Result<()> {
        let m = manager(Consent::Accept);
        let profile = m.open(app(), StorageConfig::in_memory())?;
        let session = profile
            .get_or_create_session(&UserIdentity::new("alice@contoso.com"), counting("t"))?;
        drop(profile);

        assert!(!m.has_open_profile());
        let err = session.endpoint().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UseAfterClose);
        Ok(())
    }

    #[test]
    fn test_refresh_token_passes_claims() -> Result<()> {
        struct ClaimsProvider(Mutex<Vec<Option<String>>>);

        impl IdentityProvider for ClaimsProvider {
            fn acquire_token(
                &self,
                _identity: &UserIdentity,
                _authority: &str,
                _resource: &str,
                claims: Option<&str>,
            ) -> std::result::Result<String, AuthError> {
                self.0.lock().unwrap().push(claims.map(str::to_string));
                Ok("t".to_string())
            }

            fn user_identity(&self) -> std::result::Result<UserIdentity, AuthError> {
                Err(AuthError::Cancelled)
            }
        }

        let m = manager(Consent::Accept);
        let profile = m.open(app(), StorageConfig::in_memory())?;
        let provider = Arc::new(ClaimsProvider(Mutex::new(Vec::new())));
        let session = profile
            .get_or_create_session(&UserIdentity::new("alice@contoso.com"), provider.clone())?;
        session.refresh_token(Some("{\"acrs\":\"c1\"}"))?;

        let calls = provider.0.lock().unwrap().clone();
        assert_eq!(calls, vec![None, Some("{\"acrs\":\"c1\"}".to_string())]);
        profile.close()
    }

    #[test]
    fn test_concurrent_creation_yields_one_session() -> Result<()> {
        let m = manager(Consent::Accept);
        let profile = m.open(app(), StorageConfig::in_memory())?;
        let provider = counting("t");
        let alice = UserIdentity::new("alice@contoso.com");

        let sessions: Vec<Arc<ProtectionSession>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let profile = profile.clone();
                    let provider = provider.clone();
                    let alice = alice.clone();
                    scope.spawn(move || profile.get_or_create_session(&alice, provider))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap().unwrap())
                .collect()
        });

        assert!(sessions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        profile.close()
    }

    #[test]
    fn test_static_provider_session() -> Result<()> {
        let m = manager(Consent::AcceptAlways);
        let profile = m.open(app(), StorageConfig::in_memory())?;
        let alice = UserIdentity::new("alice@contoso.com");
        let session = profile.get_or_create_session(
            &alice,
            Arc::new(StaticTokenProvider::new(alice.clone(), "token")),
        )?;
        assert_eq!(session.identity(), &alice);
        assert_eq!(session.endpoint()?.url, "https://policy.contoso.com");
        profile.close()
    }
}
