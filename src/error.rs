//! Unified error type for the contentguard public API
//!
//! Collaborators (identity provider, policy backend) report their own error
//! types; the core wraps them into [`ProtectionError`] so that callers see one
//! taxonomy and never the raw transport or crypto codes.
//!
//! # Example
//!
//! ```no_run
//! use contentguard::{ErrorScope, ProtectionError};
//!
//! fn report(err: &ProtectionError) {
//!     eprintln!("{err}");
//!     if let Some(hint) = err.suggestion() {
//!         eprintln!("hint: {hint}");
//!     }
//!     if err.scope() == ErrorScope::Session {
//!         // the workflow for this identity cannot continue
//!     }
//! }
//! ```

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ProtectionError>;

/// Unified error type for all protection operations
///
/// # Error Categories
///
/// - **Session**: profile and session setup (`Initialization`, `Authentication`,
///   `ConsentDenied`, `Discovery`). Terminal for the affected workflow.
/// - **Operation**: one handler or store call (`ServiceUnavailable`,
///   `UnknownTemplate`, `PolicyDenied`, `MalformedLicense`, `AccessDenied`).
///   The owning session stays usable.
/// - **Cipher**: buffer-level encrypt/decrypt (`Encryption`, `MalformedInput`).
/// - **Lifecycle**: misuse after teardown (`UseAfterClose`).
#[derive(Debug, Error)]
pub enum ProtectionError {
    #[error("Initialization failed: {reason}")]
    Initialization { reason: String },

    #[error("Authentication failed for {identity}: {reason}")]
    Authentication {
        identity: String,
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Consent declined for policy endpoint {url}")]
    ConsentDenied { url: String },

    #[error("No policy endpoint could be located for domain '{domain}'")]
    Discovery { domain: String },

    #[error("Policy service unavailable at {endpoint}")]
    ServiceUnavailable {
        endpoint: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Unknown template '{template_id}'")]
    UnknownTemplate { template_id: String },

    #[error("{identity} is not permitted to publish with template '{template_id}'")]
    PolicyDenied {
        template_id: String,
        identity: String,
    },

    #[error("Malformed license: {reason}")]
    MalformedLicense {
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Access denied for {identity}: {reason}")]
    AccessDenied { identity: String, reason: String },

    #[error("Encryption failed: {reason}")]
    Encryption { reason: String },

    #[error("Malformed input: {reason}")]
    MalformedInput { reason: String },

    #[error("{resource} used after the protection profile was closed")]
    UseAfterClose { resource: &'static str },
}

/// Error kind for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Initialization,
    Authentication,
    ConsentDenied,
    Discovery,
    ServiceUnavailable,
    UnknownTemplate,
    PolicyDenied,
    MalformedLicense,
    AccessDenied,
    Encryption,
    MalformedInput,
    UseAfterClose,
}

/// Propagation class of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Unrecoverable for the affected workflow without caller intervention
    Session,
    /// Scoped to one operation; the session remains valid
    Operation,
    /// Programming or data error at the buffer level
    Cipher,
    /// Use of a resource after teardown
    Lifecycle,
}

impl ProtectionError {
    pub(crate) fn initialization(reason: impl Into<String>) -> Self {
        Self::Initialization {
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed_license(reason: impl Into<String>) -> Self {
        Self::MalformedLicense {
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn malformed_input(reason: impl Into<String>) -> Self {
        Self::MalformedInput {
            reason: reason.into(),
        }
    }

    pub(crate) fn encryption(reason: impl Into<String>) -> Self {
        Self::Encryption {
            reason: reason.into(),
        }
    }

    pub(crate) fn access_denied(identity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AccessDenied {
            identity: identity.into(),
            reason: reason.into(),
        }
    }

    /// Returns the error kind for programmatic handling
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Initialization { .. } => ErrorKind::Initialization,
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::ConsentDenied { .. } => ErrorKind::ConsentDenied,
            Self::Discovery { .. } => ErrorKind::Discovery,
            Self::ServiceUnavailable { .. } => ErrorKind::ServiceUnavailable,
            Self::UnknownTemplate { .. } => ErrorKind::UnknownTemplate,
            Self::PolicyDenied { .. } => ErrorKind::PolicyDenied,
            Self::MalformedLicense { .. } => ErrorKind::MalformedLicense,
            Self::AccessDenied { .. } => ErrorKind::AccessDenied,
            Self::Encryption { .. } => ErrorKind::Encryption,
            Self::MalformedInput { .. } => ErrorKind::MalformedInput,
            Self::UseAfterClose { .. } => ErrorKind::UseAfterClose,
        }
    }

    /// Returns the propagation class of this error
    pub fn scope(&self) -> ErrorScope {
        match self.kind() {
            ErrorKind::Initialization
            | ErrorKind::Authentication
            | ErrorKind::ConsentDenied
            | ErrorKind::Discovery => ErrorScope::Session,
            ErrorKind::ServiceUnavailable
            | ErrorKind::UnknownTemplate
            | ErrorKind::PolicyDenied
            | ErrorKind::MalformedLicense
            | ErrorKind::AccessDenied => ErrorScope::Operation,
            ErrorKind::Encryption | ErrorKind::MalformedInput => ErrorScope::Cipher,
            ErrorKind::UseAfterClose => ErrorScope::Lifecycle,
        }
    }

    /// Returns true if the error is potentially retryable
    ///
    /// Only transient policy-service failures qualify. The core itself never
    /// retries; this is a hint for the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable { .. })
    }

    /// Returns a suggestion for resolving this error
    pub fn suggestion(&self) -> Option<&str> {
        let hint = match self {
            Self::Initialization { .. } => {
                "Set the application id, name and version, and make sure the cache directory is writable"
            }
            Self::Authentication { .. } => {
                "Sign in again or supply a fresh bearer token for this identity"
            }
            Self::ConsentDenied { .. } => {
                "Accept the consent prompt to allow connecting to the policy endpoint"
            }
            Self::Discovery { .. } => {
                "Check the identity's domain, or register a policy endpoint for it"
            }
            Self::ServiceUnavailable { .. } => {
                "The policy service could not be reached; try again later"
            }
            Self::UnknownTemplate { .. } => {
                "List the templates available to this identity and pick one of their ids"
            }
            Self::PolicyDenied { .. } => {
                "Ask the template administrator for publishing rights, or pick another template"
            }
            Self::MalformedLicense { .. } => {
                "The license is damaged or was not produced by a publishing handler"
            }
            Self::AccessDenied { .. } => {
                "Ask the content owner to grant this identity access"
            }
            Self::Encryption { .. } => {
                "Size the output buffer with required_output_length and pass the whole payload as the final block"
            }
            Self::MalformedInput { .. } => {
                "Protected content must be passed exactly as produced by protect()"
            }
            Self::UseAfterClose { .. } => {
                "Open a new profile; sessions cannot outlive the profile that created them"
            }
        };
        Some(hint)
    }

    /// Returns a stable error code for programmatic error handling
    ///
    /// Error codes follow the format: `CONTENTGUARD_E_<CATEGORY>`
    pub fn error_code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Initialization => "CONTENTGUARD_E_INIT",
            ErrorKind::Authentication => "CONTENTGUARD_E_AUTH",
            ErrorKind::ConsentDenied => "CONTENTGUARD_E_CONSENT_DENIED",
            ErrorKind::Discovery => "CONTENTGUARD_E_DISCOVERY",
            ErrorKind::ServiceUnavailable => "CONTENTGUARD_E_SERVICE_UNAVAILABLE",
            ErrorKind::UnknownTemplate => "CONTENTGUARD_E_TEMPLATE_UNKNOWN",
            ErrorKind::PolicyDenied => "CONTENTGUARD_E_POLICY_DENIED",
            ErrorKind::MalformedLicense => "CONTENTGUARD_E_LICENSE_MALFORMED",
            ErrorKind::AccessDenied => "CONTENTGUARD_E_ACCESS_DENIED",
            ErrorKind::Encryption => "CONTENTGUARD_E_ENCRYPTION",
            ErrorKind::MalformedInput => "CONTENTGUARD_E_INPUT_MALFORMED",
            ErrorKind::UseAfterClose => "CONTENTGUARD_E_USE_AFTER_CLOSE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_scopes() {
        let err = ProtectionError::Discovery {
            domain: "contoso.com".to_string(),
        };
        assert_eq!(err.scope(), ErrorScope::Session);
        assert!(!err.is_retryable());

        let err = ProtectionError::UnknownTemplate {
            template_id: "nope".to_string(),
        };
        assert_eq!(err.scope(), ErrorScope::Operation);

        let err = ProtectionError::malformed_input("empty");
        assert_eq!(err.scope(), ErrorScope::Cipher);

        let err = ProtectionError::UseAfterClose { resource: "session" };
        assert_eq!(err.scope(), ErrorScope::Lifecycle);
    }

    #[test]
    fn test_only_service_unavailable_is_retryable() {
        let err = ProtectionError::ServiceUnavailable {
            endpoint: "https://policy.contoso.com".to_string(),
            source: None,
        };
        assert!(err.is_retryable());
        assert_eq!(err.error_code(), "CONTENTGUARD_E_SERVICE_UNAVAILABLE");
    }

    #[test]
    fn test_source_is_wrapped_not_displayed() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "ECONNREFUSED 10061");
        let err = ProtectionError::ServiceUnavailable {
            endpoint: "https://policy.contoso.com".to_string(),
            source: Some(Box::new(io)),
        };
        let msg = err.to_string();
        assert!(msg.contains("policy.contoso.com"));
        assert!(!msg.contains("10061"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_distinct_messages_per_kind() {
        let errors = [
            ProtectionError::initialization("x"),
            ProtectionError::ConsentDenied { url: "u".into() },
            ProtectionError::Discovery { domain: "d".into() },
            ProtectionError::UnknownTemplate { template_id: "t".into() },
            ProtectionError::PolicyDenied {
                template_id: "t".into(),
                identity: "i".into(),
            },
            ProtectionError::malformed_license("x"),
            ProtectionError::access_denied("i", "x"),
            ProtectionError::encryption("x"),
            ProtectionError::malformed_input("x"),
            ProtectionError::UseAfterClose { resource: "session" },
        ];
        let mut hints: Vec<_> = errors.iter().filter_map(|e| e.suggestion()).collect();
        let total = hints.len();
        assert_eq!(total, errors.len());
        hints.sort_unstable();
        hints.dedup();
        assert_eq!(hints.len(), total);
    }
}
