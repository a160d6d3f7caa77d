//! Serialized publishing licenses
//!
//! A license is a UTF-8 JSON document that travels with protected content. It
//! carries the resolved policy (base64-encoded, exactly as it was bound), the
//! content key wrapped by the issuing policy service, and an HMAC-SHA256
//! binding of the policy to the content key:
//!
//! ```json
//! {
//!   "version": "1.0",
//!   "licenseId": "8d0f…",
//!   "issuer": "https://policy.contoso.com",
//!   "issuedAt": "2026-10-18T09:30:00Z",
//!   "policy": "eyJ0ZW1wbGF0ZUlkIjoiVDEi…",
//!   "keyAccess": { "alg": "A256GCMKW", "iv": "…", "wrappedKey": "…" },
//!   "policyBinding": { "alg": "HS256", "hash": "…" }
//! }
//! ```
//!
//! The policy binding lets the key holder detect a license whose policy was
//! edited after issuance: only someone holding the content key can produce a
//! matching hash.

use crate::error::{ProtectionError, Result};
use crate::identity::UserIdentity;
use crate::template::{ProtectionDescriptor, UserRights, WrappedKey};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{
    digest::{KeyInit, MacError},
    Hmac, Mac,
};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

pub const LICENSE_VERSION: &str = "1.0";
pub const KEY_WRAP_ALG: &str = "A256GCMKW";
pub const BINDING_ALG: &str = "HS256";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LicenseDocument {
    version: String,
    license_id: String,
    issuer: String,
    issued_at: DateTime<Utc>,
    policy: String,
    key_access: KeyAccess,
    policy_binding: PolicyBinding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyAccess {
    alg: String,
    iv: String,
    wrapped_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PolicyBinding {
    alg: String,
    hash: String,
}

/// Policy embedded in a license
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicensePolicy {
    pub template_id: String,
    pub name: String,
    pub owner: String,
    pub grants: Vec<UserRights>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
}

/// A parsed, structurally valid publishing license
#[derive(Debug, Clone)]
pub struct License {
    document: LicenseDocument,
    policy: LicensePolicy,
    wrapped_key: WrappedKey,
}

impl License {
    /// Issue a license for `descriptor` whose content key was wrapped as `wrapped_key`
    pub(crate) fn issue(
        descriptor: &ProtectionDescriptor,
        license_id: String,
        wrapped_key: WrappedKey,
        content_key: &[u8],
    ) -> Result<Self> {
        let policy = LicensePolicy {
            template_id: descriptor.template_id.clone(),
            name: descriptor.name.clone(),
            owner: descriptor.owner.clone(),
            grants: descriptor.grants.clone(),
            valid_until: descriptor.valid_until,
        };
        let policy_json = serde_json::to_string(&policy)
            .map_err(|e| ProtectionError::encryption(format!("policy serialization failed: {e}")))?;
        let policy_b64 = BASE64.encode(policy_json);
        let hash = policy_binding(&policy_b64, content_key)
            .map_err(|_| ProtectionError::encryption("policy binding generation failed"))?;

        let document = LicenseDocument {
            version: LICENSE_VERSION.to_string(),
            license_id,
            issuer: descriptor.issuer.clone(),
            issued_at: Utc::now(),
            policy: policy_b64,
            key_access: KeyAccess {
                alg: wrapped_key.alg.clone(),
                iv: BASE64.encode(&wrapped_key.iv),
                wrapped_key: BASE64.encode(&wrapped_key.wrapped),
            },
            policy_binding: PolicyBinding {
                alg: BINDING_ALG.to_string(),
                hash,
            },
        };

        Ok(Self {
            document,
            policy,
            wrapped_key,
        })
    }

    /// Parse and structurally validate a serialized license
    ///
    /// This does not verify the policy binding; that needs the content key and
    /// happens when the issuing service releases it.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(ProtectionError::malformed_license("license is empty"));
        }
        let document: LicenseDocument =
            serde_json::from_slice(bytes).map_err(|e| ProtectionError::MalformedLicense {
                reason: "license is not a valid license document".to_string(),
                source: Some(Box::new(e)),
            })?;

        if document.version != LICENSE_VERSION {
            return Err(ProtectionError::malformed_license(format!(
                "unsupported license version '{}'",
                document.version
            )));
        }
        if uuid::Uuid::parse_str(&document.license_id).is_err() {
            return Err(ProtectionError::malformed_license("license id is not a UUID"));
        }
        if document.policy_binding.alg != BINDING_ALG {
            return Err(ProtectionError::malformed_license(format!(
                "unsupported policy binding algorithm '{}'",
                document.policy_binding.alg
            )));
        }

        let policy_json = decode_field("policy", &document.policy)?;
        let policy: LicensePolicy =
            serde_json::from_slice(&policy_json).map_err(|e| ProtectionError::MalformedLicense {
                reason: "embedded policy is not valid".to_string(),
                source: Some(Box::new(e)),
            })?;

        let wrapped_key = WrappedKey {
            alg: document.key_access.alg.clone(),
            iv: decode_field("keyAccess.iv", &document.key_access.iv)?,
            wrapped: decode_field("keyAccess.wrappedKey", &document.key_access.wrapped_key)?,
        };

        Ok(Self {
            document,
            policy,
            wrapped_key,
        })
    }

    /// Serialize to the atomic byte form stored alongside ciphertext
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.document)
            .map_err(|e| ProtectionError::encryption(format!("license serialization failed: {e}")))
    }

    pub fn license_id(&self) -> &str {
        &self.document.license_id
    }

    pub fn issuer(&self) -> &str {
        &self.document.issuer
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.document.issued_at
    }

    pub fn policy(&self) -> &LicensePolicy {
        &self.policy
    }

    pub fn wrapped_key(&self) -> &WrappedKey {
        &self.wrapped_key
    }

    /// The embedded policy as a descriptor, for rights evaluation
    pub fn descriptor(&self) -> ProtectionDescriptor {
        ProtectionDescriptor {
            template_id: self.policy.template_id.clone(),
            name: self.policy.name.clone(),
            issuer: self.document.issuer.clone(),
            owner: self.policy.owner.clone(),
            grants: self.policy.grants.clone(),
            valid_until: self.policy.valid_until,
        }
    }

    /// Check the policy binding against the released content key
    pub fn verify_binding(&self, content_key: &[u8]) -> std::result::Result<(), MacError> {
        let expected = BASE64
            .decode(&self.document.policy_binding.hash)
            .map_err(|_| MacError)?;
        let mut mac = <HmacSha256 as KeyInit>::new_from_slice(content_key).map_err(|_| MacError)?;
        mac.update(self.document.policy.as_bytes());
        mac.verify_slice(&expected)
    }

    pub fn info(&self) -> LicenseInfo {
        LicenseInfo {
            license_id: self.document.license_id.clone(),
            issuer: self.document.issuer.clone(),
            issued_at: self.document.issued_at,
            template_id: self.policy.template_id.clone(),
            template_name: self.policy.name.clone(),
            owner: self.policy.owner.clone(),
            grants: self.policy.grants.clone(),
            valid_until: self.policy.valid_until,
        }
    }

    /// Whether `identity` is the license owner
    pub fn is_owned_by(&self, identity: &UserIdentity) -> bool {
        self.policy.owner.eq_ignore_ascii_case(identity.email())
    }
}

/// License header, readable without a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseInfo {
    pub license_id: String,
    pub issuer: String,
    pub issued_at: DateTime<Utc>,
    pub template_id: String,
    pub template_name: String,
    pub owner: String,
    pub grants: Vec<UserRights>,
    pub valid_until: Option<DateTime<Utc>>,
}

impl LicenseInfo {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        License::from_bytes(bytes).map(|license| license.info())
    }
}

fn policy_binding(policy_b64: &str, key: &[u8]) -> std::result::Result<String, MacError> {
    let mut mac = <HmacSha256 as KeyInit>::new_from_slice(key).map_err(|_| MacError)?;
    mac.update(policy_b64.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

fn decode_field(field: &str, value: &str) -> Result<Vec<u8>> {
    BASE64.decode(value).map_err(|e| ProtectionError::MalformedLicense {
        reason: format!("{field} is not valid base64"),
        source: Some(Box::new(e)),
    })
}
