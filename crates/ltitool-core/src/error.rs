//! Launch-failure taxonomy shared across the ltitool crates

use thiserror::Error;

/// Result type for launch validation and session operations
pub type LtiResult<T> = Result<T, LtiError>;

/// Everything that can go wrong between an inbound launch request and an
/// established session.
///
/// Signature, replay, and timestamp failures deliberately collapse to one
/// user-visible message so an attacker probing the endpoint cannot tell
/// which check rejected the request. The detailed variant is preserved for
/// server-side logging only.
#[derive(Error, Debug, Clone)]
pub enum LtiError {
    #[error("malformed launch request: {0}")]
    MalformedRequest(String),

    #[error("invalid OAuth signature")]
    InvalidSignature,

    #[error("replayed OAuth nonce")]
    ReplayedNonce,

    #[error("OAuth timestamp outside accepted window")]
    StaleTimestamp,

    #[error("OIDC validation failed: {reason}")]
    OidcValidationFailed { reason: String },

    #[error("session blob failed authenticated decryption")]
    DecryptError,

    #[error("session envelope bound to a different session")]
    SessionBindingMismatch,

    #[error("no valid launch session")]
    InvalidSession,

    #[error("not authorized to view this content")]
    Forbidden,

    #[error("authorization not implemented for platform {platform:?}")]
    UnsupportedPlatform { platform: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JWKS fetch failed: {0}")]
    JwksFetch(String),
}

impl LtiError {
    /// Shorthand for an OIDC failure with a logged sub-reason.
    pub fn oidc(reason: impl Into<String>) -> Self {
        Self::OidcValidationFailed {
            reason: reason.into(),
        }
    }

    /// HTTP status the request boundary should answer with.
    ///
    /// Configuration and JWKS-transport failures are the server's fault
    /// (500); everything else is a rejected launch (400/401/403).
    pub fn status(&self) -> u16 {
        match self {
            Self::MalformedRequest(_) => 400,
            Self::Forbidden => 403,
            Self::Config(_) | Self::JwksFetch(_) => 500,
            _ => 401,
        }
    }

    /// Generic message safe to show an end user.
    ///
    /// Never includes the OIDC sub-reason, and never distinguishes
    /// signature/nonce/timestamp failures from one another.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::MalformedRequest(_) => "Malformed LTI launch request",
            Self::InvalidSignature | Self::ReplayedNonce | Self::StaleTimestamp => {
                "Invalid LTI launch request"
            }
            Self::OidcValidationFailed { .. } => "LTI authentication failure",
            Self::DecryptError | Self::SessionBindingMismatch | Self::InvalidSession => {
                "Invalid session"
            }
            Self::Forbidden => "You are not authorized to view this content",
            Self::UnsupportedPlatform { .. } => "Unsupported LMS platform",
            Self::Config(_) | Self::JwksFetch(_) => "LTI launch failure",
        }
    }

    /// Error category for logging and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::MalformedRequest(_) => "malformed_request",
            Self::InvalidSignature => "invalid_signature",
            Self::ReplayedNonce => "replayed_nonce",
            Self::StaleTimestamp => "stale_timestamp",
            Self::OidcValidationFailed { .. } => "oidc_validation_failed",
            Self::DecryptError => "decrypt_error",
            Self::SessionBindingMismatch => "session_binding_mismatch",
            Self::InvalidSession => "invalid_session",
            Self::Forbidden => "forbidden",
            Self::UnsupportedPlatform { .. } => "unsupported_platform",
            Self::Config(_) => "config",
            Self::JwksFetch(_) => "jwks_fetch",
        }
    }

    /// True for failures that mean "treat as no session and force a fresh
    /// launch" rather than a hard error page.
    pub fn forces_relaunch(&self) -> bool {
        matches!(
            self,
            Self::DecryptError | Self::SessionBindingMismatch | Self::InvalidSession
        )
    }
}
