//! Commonly used types and traits
//!
//! ```rust
//! use contentguard::prelude::*;
//!
//! # fn example(session: std::sync::Arc<ProtectionSession>) -> Result<()> {
//! let mut handler = session.create_publishing_handler("T1")?;
//! let protected = protect(&mut handler, b"hello world")?;
//! # let _ = protected;
//! # Ok(())
//! # }
//! ```

pub use crate::cache::StorageConfig;
pub use crate::cipher::{protect, unprotect, ProtectionHandler};
pub use crate::discovery::{BackendKind, PolicyEndpoint, ServiceDiscovery};
pub use crate::error::{ErrorKind, ProtectionError, Result};
pub use crate::handler::{ConsumptionHandler, PublishingHandler};
pub use crate::identity::{
    ApplicationIdentity, Consent, ConsentDelegate, IdentityProvider, UserIdentity,
};
pub use crate::session::{ProtectionProfile, ProtectionSession, SessionManager};
pub use crate::template::{PolicyService, Right, TemplateDescriptor};
