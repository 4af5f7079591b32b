//! # ltitool-auth - LTI Launch Validation & Session Sealing
//!
//! Authenticates inbound LTI launches from an LMS and establishes a
//! verified, sealed session for the launched application:
//!
//! - [`oauth1`] - LTI 1.1: OAuth 1.0a (RFC 5849) HMAC-SHA1 form-POST
//!   verification with replay protection ([`nonce`])
//! - [`oidc`] - LTI 1.3: OIDC third-party-initiated login and signed
//!   `id_token` launch verification, keys via [`jwks`]
//! - [`codec`] / [`session`] - the AES-256-GCM session envelope both
//!   generations feed, bound to one session id
//! - [`config`] - the tool-config document: consumer secrets, platform
//!   registrations, session key
//! - [`pipeline`] - the composed [`pipeline::LaunchPipeline`], a
//!   framework-agnostic request-in / session-out surface
//!
//! The host web framework stays out of scope: it hands over the request
//! method, URL, TLS flag, and form body, and stores the sealed blob in
//! whatever session container it owns.

pub mod codec;
pub mod config;
pub mod jwks;
pub mod nonce;
pub mod oauth1;
pub mod oidc;
pub mod pipeline;
pub mod session;

pub use codec::SessionCodec;
pub use config::{ConsumerRegistry, PlatformConfig, PlatformRegistry, ToolConfig};
pub use jwks::{JwksClient, JwksRegistry};
pub use nonce::{MemoryNonceStore, NonceStore};
pub use oauth1::OAuth1Validator;
pub use oidc::{LaunchDataStore, LoginRedirect, MemoryLaunchDataStore, OidcValidator};
pub use pipeline::{Clock, EstablishedSession, LaunchPipeline, LaunchRequest, SystemClock};
pub use session::LaunchSession;

pub use ltitool_core::{LaunchData, LtiError, LtiResult};
