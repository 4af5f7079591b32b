//! Authenticated encryption for the session's launch-data blob
//!
//! AES-256-GCM with a fresh random 96-bit nonce per message, nonce
//! prepended to the ciphertext, whole blob base64-encoded. Claims are
//! serialized as JSON before sealing. Any decrypt failure collapses to
//! [`LtiError::DecryptError`]: a tampered or foreign blob means "no valid
//! session", never a crash and never partial claims.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;

use ltitool_core::{LtiError, LtiResult};

use crate::config::ToolConfig;

/// GCM nonce length prefixed to every sealed blob.
const NONCE_LEN: usize = 12;

/// Seals and opens the session's launch-data blob.
#[derive(Clone)]
pub struct SessionCodec {
    cipher: Aes256Gcm,
}

impl SessionCodec {
    /// Build from raw key material.
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    /// Build from the tool configuration; key errors are fatal here.
    pub fn from_config(config: &ToolConfig) -> LtiResult<Self> {
        Ok(Self::new(config.session_key_bytes()?))
    }

    /// Encrypt `claims` into a base64 blob.
    pub fn seal<T: Serialize>(&self, claims: &T) -> LtiResult<String> {
        let plaintext = serde_json::to_vec(claims)
            .map_err(|e| LtiError::Config(format!("session payload not serializable: {e}")))?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| LtiError::Config("session encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Decrypt a sealed blob back into claims.
    pub fn open<T: DeserializeOwned>(&self, blob: &str) -> LtiResult<T> {
        let raw = BASE64.decode(blob).map_err(|_| LtiError::DecryptError)?;
        if raw.len() <= NONCE_LEN {
            return Err(LtiError::DecryptError);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| LtiError::DecryptError)?;

        serde_json::from_slice(&plaintext).map_err(|_| LtiError::DecryptError)
    }
}

impl std::fmt::Debug for SessionCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCodec").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn codec() -> SessionCodec {
        SessionCodec::new([7u8; 32])
    }

    fn claims() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("context_label".to_string(), "PSYCH 101 A".to_string());
        map.insert("user_id".to_string(), "e1ec31bd10a3".to_string());
        map
    }

    #[test]
    fn round_trip() {
        let codec = codec();
        let sealed = codec.seal(&claims()).unwrap();
        let opened: HashMap<String, String> = codec.open(&sealed).unwrap();
        assert_eq!(opened, claims());
    }

    #[test]
    fn sealing_twice_differs_but_opens_identically() {
        let codec = codec();
        let a = codec.seal(&claims()).unwrap();
        let b = codec.seal(&claims()).unwrap();
        // fresh nonce per message
        assert_ne!(a, b);
        let oa: HashMap<String, String> = codec.open(&a).unwrap();
        let ob: HashMap<String, String> = codec.open(&b).unwrap();
        assert_eq!(oa, ob);
    }

    #[test]
    fn wrong_key_fails_closed() {
        let sealed = codec().seal(&claims()).unwrap();
        let other = SessionCodec::new([8u8; 32]);
        let err = other.open::<HashMap<String, String>>(&sealed).unwrap_err();
        assert!(matches!(err, LtiError::DecryptError));
    }

    #[test]
    fn tampered_blob_fails_closed() {
        let codec = codec();
        let sealed = codec.seal(&claims()).unwrap();
        let mut raw = BASE64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);
        assert!(matches!(
            codec.open::<HashMap<String, String>>(&tampered),
            Err(LtiError::DecryptError)
        ));
    }

    #[test]
    fn garbage_blob_fails_closed() {
        let codec = codec();
        assert!(matches!(
            codec.open::<HashMap<String, String>>("not base64 at all"),
            Err(LtiError::DecryptError)
        ));
        assert!(matches!(
            codec.open::<HashMap<String, String>>("AAAA"),
            Err(LtiError::DecryptError)
        ));
    }
}
