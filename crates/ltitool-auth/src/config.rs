//! Tool configuration: consumer registry, session key, platform registrations
//!
//! Mirrors the deployment shape of the original tool-config file: one JSON
//! document holding the LTI 1.1 consumer-key/secret map, the session-sealing
//! key, and one registration per LTI 1.3 platform issuer. Secrets are kept
//! behind [`secrecy`] wrappers so they never leak through `Debug` output.
//!
//! Missing or malformed key material is a fatal configuration error at load
//! time; nothing here is recoverable per-request.

use std::collections::HashMap;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use jsonwebtoken::jwk::JwkSet;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use ltitool_core::{LtiError, LtiResult};

/// Secret handed out for unknown consumer keys.
///
/// Validation proceeds against this value so an unknown key fails the same
/// way as a wrong signature; callers must never register it as a real
/// secret.
pub const DUMMY_SECRET: &str = "dummy";

/// Immutable consumer-key -> shared-secret map for LTI 1.1 launches.
#[derive(Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ConsumerRegistry {
    consumers: HashMap<String, SecretString>,
}

impl ConsumerRegistry {
    pub fn new(consumers: HashMap<String, String>) -> Self {
        Self {
            consumers: consumers
                .into_iter()
                .map(|(k, v)| (k, SecretString::new(v)))
                .collect(),
        }
    }

    /// Shared secret for a consumer key; unknown keys get [`DUMMY_SECRET`]
    /// so the caller's failure path is uniform.
    pub fn secret_for(&self, consumer_key: &str) -> &str {
        self.consumers
            .get(consumer_key)
            .map(|s| s.expose_secret().as_str())
            .unwrap_or(DUMMY_SECRET)
    }

    /// Whether the key is registered. Callers who need uniform failure must
    /// still run the signature check and AND this in afterwards.
    pub fn contains(&self, consumer_key: &str) -> bool {
        self.consumers.contains_key(consumer_key)
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

impl std::fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerRegistry")
            .field("consumers", &self.consumers.len())
            .finish()
    }
}

/// One LTI 1.3 platform registration, keyed by issuer.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    /// OAuth2 client id the platform assigned this tool.
    pub client_id: String,
    /// The platform's OIDC authorization endpoint.
    pub auth_login_url: String,
    /// Where the platform publishes its signing keys.
    #[serde(default)]
    pub key_set_url: Option<String>,
    /// Static keys for platforms without a JWKS endpoint.
    #[serde(default)]
    pub key_set: Option<JwkSet>,
    /// Deployment ids registered for this tool.
    #[serde(default)]
    pub deployment_ids: Vec<String>,
}

/// Issuer -> platform registration map.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct PlatformRegistry {
    platforms: HashMap<String, PlatformConfig>,
}

impl PlatformRegistry {
    pub fn new(platforms: HashMap<String, PlatformConfig>) -> Self {
        Self { platforms }
    }

    pub fn get(&self, issuer: &str) -> Option<&PlatformConfig> {
        self.platforms.get(issuer)
    }
}

/// The whole tool configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolConfig {
    /// LTI 1.1 consumer registry.
    #[serde(default)]
    pub consumers: ConsumerRegistry,

    /// Base64 of the 32-byte session-sealing key.
    pub session_key: SecretString,

    /// LTI 1.3 platform registrations.
    #[serde(default)]
    pub platforms: PlatformRegistry,

    /// This tool's public signing keys, published at the JWKS endpoint.
    #[serde(default)]
    pub public_jwks: Option<JwkSet>,

    /// Storage-handshake give-up timer in seconds (clamped to 5-60).
    #[serde(default)]
    pub handshake_timeout_secs: Option<u64>,
}

impl ToolConfig {
    /// Parse a tool-config JSON document.
    pub fn from_json(json: &str) -> LtiResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| LtiError::Config(format!("invalid tool config: {e}")))?;
        config.session_key_bytes()?;
        Ok(config)
    }

    /// Load the tool-config file from disk.
    pub fn from_file(path: impl AsRef<Path>) -> LtiResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            LtiError::Config(format!("cannot read tool config {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// The tool's public keys, as served at the JWKS endpoint. Tools with
    /// no registered keys publish an empty set.
    pub fn published_jwks(&self) -> JwkSet {
        self.public_jwks
            .clone()
            .unwrap_or(JwkSet { keys: vec![] })
    }

    /// Decode and length-check the session key.
    pub fn session_key_bytes(&self) -> LtiResult<[u8; 32]> {
        let raw = BASE64
            .decode(self.session_key.expose_secret())
            .map_err(|e| LtiError::Config(format!("session_key is not valid base64: {e}")))?;
        raw.try_into().map_err(|_| {
            LtiError::Config("session_key must decode to exactly 32 bytes".to_string())
        })
    }
}
