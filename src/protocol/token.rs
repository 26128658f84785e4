//! Endpoint tokens
//!
//! A token is `base64url(nonce || AES-256-GCM("<uaid>.<channelID>"))` under a
//! key derived from the server secret with SHA-256. Tokens can be decoded back
//! to the pair without touching the store, and any tampering fails the GCM
//! tag check.

use super::Uaid;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Nonce size for AES-GCM (96 bits)
const NONCE_SIZE: usize = 12;

/// Separator between uaid and channel id in the plaintext
const SEPARATOR: char = '.';

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token is not valid base64")]
    Encoding(#[from] base64::DecodeError),

    #[error("token is too short")]
    Truncated,

    #[error("token failed authentication")]
    Decrypt,

    #[error("token payload is malformed")]
    Malformed,

    #[error("encryption failed")]
    Encrypt,
}

/// Encodes and decodes endpoint tokens under a server secret
#[derive(Clone)]
pub struct EndpointTokenCodec {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for EndpointTokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointTokenCodec").finish_non_exhaustive()
    }
}

impl EndpointTokenCodec {
    pub fn new(secret: &str) -> Self {
        let key = Sha256::digest(secret.as_bytes());
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Create an opaque token for `(uaid, channel_id)`
    pub fn encode(&self, uaid: &Uaid, channel_id: &str) -> Result<String, TokenError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = format!("{}{}{}", uaid, SEPARATOR, channel_id);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| TokenError::Encrypt)?;

        let mut raw = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        raw.extend_from_slice(&nonce_bytes);
        raw.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(raw))
    }

    /// Recover `(uaid, channel_id)` from a token
    pub fn decode(&self, token: &str) -> Result<(Uaid, String), TokenError> {
        let raw = BASE64.decode(token.trim())?;
        if raw.len() <= NONCE_SIZE {
            return Err(TokenError::Truncated);
        }

        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| TokenError::Decrypt)?;
        let plaintext = String::from_utf8(plaintext).map_err(|_| TokenError::Malformed)?;

        // uaid is a hyphenated UUID so the first separator is always the split
        let (uaid, channel_id) = plaintext
            .split_once(SEPARATOR)
            .ok_or(TokenError::Malformed)?;
        let uaid = Uaid::parse(uaid).ok_or(TokenError::Malformed)?;
        if channel_id.is_empty() {
            return Err(TokenError::Malformed);
        }

        Ok((uaid, channel_id.to_string()))
    }
}
