//! Buffer-level protect / unprotect
//!
//! Content is sealed with AES-256-GCM in a single shot. The protected layout
//! is `nonce (12) ‖ ciphertext ‖ tag (16)`, with the license id as associated
//! data so that content cannot be paired with a different license.

use crate::error::{ProtectionError, Result};
use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Key, Nonce, Tag,
};
use rand::{rngs::OsRng, RngCore};
use tracing::debug;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// Bytes added to a payload by single-shot protection
pub const PROTECTION_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

const CONTENT_KEY_LEN: usize = 32;

/// A cryptographic context bound to one license
///
/// Methods take `&mut self`: a handler serves one protect/unprotect call at a
/// time and callers needing parallelism use one handler per operation.
pub trait ProtectionHandler {
    /// Output size for `input_len` bytes of plaintext
    ///
    /// Only the final block carries the nonce and tag; intermediate blocks
    /// have no framing.
    fn required_output_length(&self, input_len: usize, final_block: bool) -> usize;

    /// Encrypt `input` into `output`, returning the bytes written
    fn encrypt_buffer(&mut self, input: &[u8], output: &mut [u8], final_block: bool)
        -> Result<usize>;

    /// Decrypt `input` into `output`, returning the bytes written
    fn decrypt_buffer(&mut self, input: &[u8], output: &mut [u8], final_block: bool)
        -> Result<usize>;
}

/// Protect `plaintext` with `handler`
///
/// Allocates exactly `required_output_length(len, true)` bytes and encrypts in
/// one call. A write count that differs from the allocation is an
/// `EncryptionError`.
pub fn protect<H>(handler: &mut H, plaintext: &[u8]) -> Result<Vec<u8>>
where
    H: ProtectionHandler + ?Sized,
{
    let required = handler.required_output_length(plaintext.len(), true);
    let mut output = vec![0u8; required];
    let written = handler.encrypt_buffer(plaintext, &mut output, true)?;
    if written != required {
        return Err(ProtectionError::encryption(format!(
            "handler wrote {written} bytes into a {required}-byte buffer"
        )));
    }
    debug!(plaintext_len = plaintext.len(), protected_len = written, "protected buffer");
    Ok(output)
}

/// Unprotect `ciphertext` with `handler`
///
/// Decrypts into a scratch buffer of `ciphertext.len()` bytes and truncates it
/// to the count the handler reports as written.
pub fn unprotect<H>(handler: &mut H, ciphertext: &[u8]) -> Result<Vec<u8>>
where
    H: ProtectionHandler + ?Sized,
{
    if ciphertext.is_empty() {
        return Err(ProtectionError::malformed_input("protected content is empty"));
    }
    let mut scratch = vec![0u8; ciphertext.len()];
    let written = handler.decrypt_buffer(ciphertext, &mut scratch, true)?;
    if written > scratch.len() {
        return Err(ProtectionError::encryption(format!(
            "handler reported {written} bytes for a {}-byte buffer",
            scratch.len()
        )));
    }
    scratch.truncate(written);
    debug!(protected_len = ciphertext.len(), plaintext_len = written, "unprotected buffer");
    Ok(scratch)
}

/// AES-256-GCM content cipher shared by publishing and consumption handlers
pub(crate) struct ContentCipher {
    cipher: Aes256Gcm,
    associated_data: Vec<u8>,
}

impl ContentCipher {
    pub(crate) fn new(content_key: &[u8], license_id: &str) -> Result<Self> {
        if content_key.len() != CONTENT_KEY_LEN {
            return Err(ProtectionError::encryption(format!(
                "content key must be {CONTENT_KEY_LEN} bytes, got {}",
                content_key.len()
            )));
        }
        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(content_key)),
            associated_data: license_id.as_bytes().to_vec(),
        })
    }

    pub(crate) fn required_output_length(input_len: usize, final_block: bool) -> usize {
        if final_block {
            input_len + PROTECTION_OVERHEAD
        } else {
            input_len
        }
    }

    pub(crate) fn encrypt_into(
        &self,
        input: &[u8],
        output: &mut [u8],
        final_block: bool,
    ) -> Result<usize> {
        if !final_block {
            return Err(ProtectionError::encryption(
                "streamed protection is not supported; pass the whole payload as the final block",
            ));
        }
        let required = Self::required_output_length(input.len(), true);
        if output.len() < required {
            return Err(ProtectionError::encryption(format!(
                "output buffer too small: need {required} bytes, got {}",
                output.len()
            )));
        }

        let (nonce, rest) = output.split_at_mut(NONCE_LEN);
        OsRng.fill_bytes(nonce);
        let (body, rest) = rest.split_at_mut(input.len());
        body.copy_from_slice(input);

        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(nonce), &self.associated_data, body)
            .map_err(|_| ProtectionError::encryption("AES-GCM encryption failed"))?;
        rest[..TAG_LEN].copy_from_slice(tag.as_slice());

        Ok(required)
    }

    pub(crate) fn decrypt_into(
        &self,
        input: &[u8],
        output: &mut [u8],
        final_block: bool,
    ) -> Result<usize> {
        if !final_block {
            return Err(ProtectionError::encryption(
                "streamed unprotection is not supported; pass the whole payload as the final block",
            ));
        }
        if input.is_empty() {
            return Err(ProtectionError::malformed_input("protected content is empty"));
        }
        if input.len() < PROTECTION_OVERHEAD {
            return Err(ProtectionError::malformed_input(format!(
                "protected content is {} bytes, shorter than its {PROTECTION_OVERHEAD}-byte framing",
                input.len()
            )));
        }

        let body_len = input.len() - PROTECTION_OVERHEAD;
        if output.len() < body_len {
            return Err(ProtectionError::encryption(format!(
                "output buffer too small: need {body_len} bytes, got {}",
                output.len()
            )));
        }

        let (nonce, rest) = input.split_at(NONCE_LEN);
        let (body, tag) = rest.split_at(body_len);
        let plaintext = &mut output[..body_len];
        plaintext.copy_from_slice(body);

        if self
            .cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                &self.associated_data,
                plaintext,
                Tag::from_slice(tag),
            )
            .is_err()
        {
            plaintext.fill(0);
            return Err(ProtectionError::malformed_input(
                "protected content failed authentication",
            ));
        }

        Ok(body_len)
    }
}
