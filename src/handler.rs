//! Handler factory: publishing and consumption handlers for a session
//!
//! A [`PublishingHandler`] is built from a template id. It resolves the
//! template into a concrete policy owned by the session's identity, draws a
//! fresh content key, has the policy service wrap it, and issues the license
//! that must travel with the protected content.
//!
//! A [`ConsumptionHandler`] is built from those license bytes. The license
//! header is parsed and the caller's rights are evaluated before the policy
//! service is asked to release the content key.
//!
//! Both handlers keep a weak reference to their session and refuse to run
//! once it has been closed.

use crate::cipher::{ContentCipher, ProtectionHandler};
use crate::error::{ProtectionError, Result};
use crate::identity::UserIdentity;
use crate::license::License;
use crate::session::ProtectionSession;
use crate::template::{ProtectionDescriptor, Right};
use chrono::Utc;
use rand::{rngs::OsRng, RngCore};
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use tracing::{debug, info};
use zeroize::Zeroizing;

const CONTENT_KEY_LEN: usize = 32;

impl ProtectionSession {
    /// Build a handler that protects content under `template_id`
    ///
    /// When the template list has already been fetched, an id missing from it
    /// fails with `UnknownTemplate` without contacting the policy service.
    /// Otherwise the template is resolved with a single lookup, and nothing
    /// else is sent to the service until the lookup succeeds.
    pub fn create_publishing_handler(self: &Arc<Self>, template_id: &str) -> Result<PublishingHandler> {
        self.with_open(|open| {
            if let Some(templates) = open.cached_templates() {
                if !templates.iter().any(|t| t.id == template_id) {
                    return Err(ProtectionError::UnknownTemplate {
                        template_id: template_id.to_string(),
                    });
                }
            }

            let ctx = open.context(self.identity());
            let endpoint = open.endpoint.url.as_str();
            let descriptor = self
                .policy
                .resolve_descriptor(&ctx, template_id)
                .map_err(|e| e.into_protection(endpoint, self.identity()))?;

            let mut content_key = Zeroizing::new([0u8; CONTENT_KEY_LEN]);
            OsRng.fill_bytes(&mut content_key[..]);
            let license_id = uuid::Uuid::new_v4().to_string();

            let wrapped_key = self
                .policy
                .wrap_key(&ctx, &license_id, &content_key[..])
                .map_err(|e| e.into_protection(endpoint, self.identity()))?;

            let license = License::issue(&descriptor, license_id, wrapped_key, &content_key[..])?;
            let license_bytes = license.to_bytes()?;
            let cipher = ContentCipher::new(&content_key[..], license.license_id())?;

            info!(
                identity = %self.identity(),
                template_id = %descriptor.template_id,
                license_id = %license.license_id(),
                "publishing handler created"
            );

            Ok(PublishingHandler {
                session: Arc::downgrade(self),
                descriptor,
                license,
                license_bytes,
                cipher,
            })
        })
    }

    /// Build a handler that unprotects content published under `license`
    ///
    /// `content_label` is recorded for audit only.
    pub fn create_consumption_handler(
        self: &Arc<Self>,
        license: &[u8],
        content_label: Option<&str>,
    ) -> Result<ConsumptionHandler> {
        self.with_open(|open| {
            let license = License::from_bytes(license)?;
            let identity = self.identity();
            if license.issuer() != open.endpoint.url {
                return Err(ProtectionError::access_denied(
                    identity.email(),
                    format!(
                        "license was issued by {}, not this session's policy endpoint",
                        license.issuer()
                    ),
                ));
            }

            let descriptor = license.descriptor();
            let rights = descriptor.rights_for(identity);
            if !rights.contains(&Right::View) {
                return Err(ProtectionError::access_denied(
                    identity.email(),
                    format!("the policy of template {} grants no VIEW right", descriptor.template_id),
                ));
            }
            if descriptor.is_expired_at(Utc::now()) {
                return Err(ProtectionError::access_denied(
                    identity.email(),
                    "the protected content has expired",
                ));
            }

            let content_key = self
                .policy
                .unwrap_key(&open.context(identity), &license)
                .map_err(|e| e.into_protection(&open.endpoint.url, identity))?;

            license.verify_binding(&content_key).map_err(|_| {
                ProtectionError::malformed_license("policy binding does not match the content key")
            })?;

            let cipher = ContentCipher::new(&content_key, license.license_id())?;

            info!(
                identity = %identity,
                license_id = %license.license_id(),
                content_label = content_label.unwrap_or(""),
                "consumption handler created"
            );

            Ok(ConsumptionHandler {
                session: Arc::downgrade(self),
                identity: identity.clone(),
                rights,
                content_label: content_label.map(str::to_string),
                license,
                cipher,
            })
        })
    }
}

fn ensure_session(session: &Weak<ProtectionSession>) -> Result<()> {
    match session.upgrade() {
        Some(session) if !session.is_closed() => Ok(()),
        _ => Err(ProtectionError::UseAfterClose { resource: "handler" }),
    }
}

/// Encrypts content under one resolved policy
pub struct PublishingHandler {
    session: Weak<ProtectionSession>,
    descriptor: ProtectionDescriptor,
    license: License,
    license_bytes: Vec<u8>,
    cipher: ContentCipher,
}

impl PublishingHandler {
    pub fn descriptor(&self) -> &ProtectionDescriptor {
        &self.descriptor
    }

    pub fn license(&self) -> &License {
        &self.license
    }

    /// The license to store or transmit alongside the ciphertext
    pub fn serialized_license(&self) -> &[u8] {
        &self.license_bytes
    }
}

impl ProtectionHandler for PublishingHandler {
    fn required_output_length(&self, input_len: usize, final_block: bool) -> usize {
        ContentCipher::required_output_length(input_len, final_block)
    }

    fn encrypt_buffer(&mut self, input: &[u8], output: &mut [u8], final_block: bool) -> Result<usize> {
        ensure_session(&self.session)?;
        self.cipher.encrypt_into(input, output, final_block)
    }

    fn decrypt_buffer(&mut self, input: &[u8], output: &mut [u8], final_block: bool) -> Result<usize> {
        ensure_session(&self.session)?;
        self.cipher.decrypt_into(input, output, final_block)
    }
}

impl std::fmt::Debug for PublishingHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishingHandler")
            .field("template_id", &self.descriptor.template_id)
            .field("license_id", &self.license.license_id())
            .finish_non_exhaustive()
    }
}

/// Decrypts content published under one license
pub struct ConsumptionHandler {
    session: Weak<ProtectionSession>,
    identity: UserIdentity,
    rights: BTreeSet<Right>,
    content_label: Option<String>,
    license: License,
    cipher: ContentCipher,
}

impl ConsumptionHandler {
    pub fn license(&self) -> &License {
        &self.license
    }

    /// Rights the consuming identity holds under the license policy
    pub fn rights(&self) -> &BTreeSet<Right> {
        &self.rights
    }

    pub fn content_label(&self) -> Option<&str> {
        self.content_label.as_deref()
    }
}

impl ProtectionHandler for ConsumptionHandler {
    fn required_output_length(&self, input_len: usize, final_block: bool) -> usize {
        ContentCipher::required_output_length(input_len, final_block)
    }

    /// Re-protecting consumed content needs the `EDIT` right
    fn encrypt_buffer(&mut self, input: &[u8], output: &mut [u8], final_block: bool) -> Result<usize> {
        ensure_session(&self.session)?;
        if !self.rights.contains(&Right::Edit) {
            return Err(ProtectionError::access_denied(
                self.identity.email(),
                "encrypting with a consumed license needs the EDIT right",
            ));
        }
        self.cipher.encrypt_into(input, output, final_block)
    }

    fn decrypt_buffer(&mut self, input: &[u8], output: &mut [u8], final_block: bool) -> Result<usize> {
        ensure_session(&self.session)?;
        let written = self.cipher.decrypt_into(input, output, final_block)?;
        debug!(
            license_id = %self.license.license_id(),
            content_label = self.content_label.as_deref().unwrap_or(""),
            bytes = written,
            "content decrypted"
        );
        Ok(written)
    }
}

impl std::fmt::Debug for ConsumptionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumptionHandler")
            .field("identity", &self.identity)
            .field("license_id", &self.license.license_id())
            .field("content_label", &self.content_label)
            .finish_non_exhaustive()
    }
}
