//! Identity-bound content protection
//!
//! `contentguard` manages per-identity protection sessions against a policy
//! service, resolves protection templates into licenses, and encrypts and
//! decrypts opaque byte payloads under those licenses.
//!
//! The flow is: open a [`ProtectionProfile`] from a [`SessionManager`], get a
//! [`ProtectionSession`] for a user, list templates, build a
//! [`PublishingHandler`] from a template id, [`protect`] a payload, ship the
//! serialized license with the ciphertext, then build a
//! [`ConsumptionHandler`] from that license and [`unprotect`].

mod cache;
mod cipher;
mod discovery;
mod error;
mod handler;
mod identity;
mod license;
mod service;
mod session;
mod template;

pub mod prelude;

pub use cache::{CacheStorage, StorageConfig};
pub use cipher::{protect, unprotect, ProtectionHandler, NONCE_LEN, PROTECTION_OVERHEAD, TAG_LEN};
pub use discovery::{BackendKind, PolicyEndpoint, ServiceDiscovery, StaticDiscovery};
pub use error::{ErrorKind, ErrorScope, ProtectionError, Result};
pub use handler::{ConsumptionHandler, PublishingHandler};
pub use identity::{
    resolve_user_identity, ApplicationIdentity, AuthError, BearerToken, Consent, ConsentDelegate,
    FixedConsent, IdentityProvider, StaticTokenProvider, UserIdentity,
};
pub use license::{License, LicenseInfo, LicensePolicy, BINDING_ALG, KEY_WRAP_ALG, LICENSE_VERSION};
pub use service::{Catalogue, ContentExpiry, LocalPolicyService, TemplateDefinition};
pub use session::{ProtectionProfile, ProtectionSession, SessionManager};
pub use template::{
    PolicyService, ProtectionDescriptor, Right, ServiceContext, ServiceError, TemplateDescriptor,
    UserRights, WrappedKey,
};
