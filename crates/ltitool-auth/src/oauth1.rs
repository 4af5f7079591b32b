//! LTI 1.1 launch verification: OAuth 1.0a (RFC 5849) HMAC-SHA1
//!
//! The launch arrives as a signed `application/x-www-form-urlencoded` POST.
//! Verification rebuilds the RFC 5849 signature base string from the request
//! and compares HMAC-SHA1 signatures in constant time.
//!
//! Unknown consumer keys are not short-circuited: they get a constant dummy
//! secret and proceed to the signature check, so a probing client cannot
//! distinguish "unknown key" from "bad signature". Replay protection and the
//! timestamp window live in [`crate::nonce`]; both run after the signature
//! check, so a rejected launch never consumes its nonce.
//!
//! Deployments behind a TLS-terminating proxy see `http:` request URLs for
//! launches the platform signed as `https:`; a failed signature check is
//! retried once with the scheme flipped when the connection was secure.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha1::Sha1;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use url::Url;

use ltitool_core::{LaunchData, LtiError, LtiResult};

use crate::config::ConsumerRegistry;
use crate::nonce::{validate_timestamp, NonceStore};

type HmacSha1 = Hmac<Sha1>;

/// RFC 3986: everything but unreserved characters is percent-encoded.
const OAUTH_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Accepted consumer-key length band.
const CLIENT_KEY_LEN: std::ops::RangeInclusive<usize> = 12..=30;

/// Accepted nonce length band.
const NONCE_LEN: std::ops::RangeInclusive<usize> = 20..=50;

/// Verifies signed LTI 1.1 launch requests.
pub struct OAuth1Validator {
    consumers: ConsumerRegistry,
    nonces: Arc<dyn NonceStore>,
}

impl OAuth1Validator {
    pub fn new(consumers: ConsumerRegistry, nonces: Arc<dyn NonceStore>) -> Self {
        Self { consumers, nonces }
    }

    /// Validate a launch POST.
    ///
    /// `url` is the request URL as the server saw it; `is_secure` is whether
    /// the connection (after any proxy) used TLS. On success the non-OAuth
    /// form parameters come back as flat launch data.
    pub fn validate(
        &self,
        method: &str,
        url: &str,
        is_secure: bool,
        body: &str,
        now: u64,
    ) -> LtiResult<LaunchData> {
        let params: Vec<(String, String)> = url::form_urlencoded::parse(body.as_bytes())
            .into_owned()
            .collect();

        let consumer_key = single_oauth_param(&params, "oauth_consumer_key")?;
        let nonce = single_oauth_param(&params, "oauth_nonce")?;
        let timestamp = single_oauth_param(&params, "oauth_timestamp")?;
        let signature = single_oauth_param(&params, "oauth_signature")?;
        let signature_method = single_oauth_param(&params, "oauth_signature_method")?;

        if signature_method != "HMAC-SHA1" {
            return Err(LtiError::MalformedRequest(format!(
                "unsupported oauth_signature_method {signature_method:?}"
            )));
        }
        if let Some(version) = optional_param(&params, "oauth_version") {
            if version != "1.0" {
                return Err(LtiError::MalformedRequest(format!(
                    "unsupported oauth_version {version:?}"
                )));
            }
        }

        // shape checks; failures look like any other bad signature
        if !CLIENT_KEY_LEN.contains(&consumer_key.len()) || !safe_characters(consumer_key) {
            debug!(consumer_key, "consumer key fails shape check");
            return Err(LtiError::InvalidSignature);
        }
        if !NONCE_LEN.contains(&nonce.len()) || !safe_characters(nonce) {
            debug!(consumer_key, "nonce fails shape check");
            return Err(LtiError::InvalidSignature);
        }

        // the signature check always runs, even for an unknown key (which
        // gets the dummy secret); the known-key bit is ANDed in afterwards
        // so both failure modes are indistinguishable from outside
        let known_consumer = self.consumers.contains(consumer_key);
        let secret = self.consumers.secret_for(consumer_key);
        let request_url =
            Url::parse(url).map_err(|e| LtiError::MalformedRequest(format!("bad url: {e}")))?;

        let mut ok = signature_matches(secret, method, &request_url, &params, signature)?;
        if !ok && is_secure && request_url.scheme() == "http" {
            // TLS-terminating proxy: the platform signed the https URL
            let mut flipped = request_url.clone();
            if flipped.set_scheme("https").is_ok() {
                ok = signature_matches(secret, method, &flipped, &params, signature)?;
            }
        }
        if !ok || !known_consumer {
            warn!(consumer_key, "launch signature mismatch");
            return Err(LtiError::InvalidSignature);
        }

        // the nonce is recorded only after the signature verifies, so a
        // rejected launch leaves its nonce usable for a legitimate retry
        if !validate_timestamp(timestamp, now) {
            warn!(consumer_key, timestamp, "launch timestamp outside window");
            return Err(LtiError::StaleTimestamp);
        }
        if self.nonces.seen(consumer_key, nonce, now) {
            warn!(consumer_key, "replayed launch nonce");
            return Err(LtiError::ReplayedNonce);
        }

        debug!(consumer_key, "LTI 1.1 launch verified");
        let launch: HashMap<String, String> = params
            .into_iter()
            .filter(|(k, _)| !k.starts_with("oauth_"))
            .collect();
        Ok(LaunchData::from_params(launch))
    }
}

fn single_oauth_param<'a>(params: &'a [(String, String)], name: &str) -> LtiResult<&'a str> {
    let mut found = None;
    for (k, v) in params {
        if k == name {
            if found.is_some() {
                return Err(LtiError::MalformedRequest(format!("duplicate {name}")));
            }
            found = Some(v.as_str());
        }
    }
    found.ok_or_else(|| LtiError::MalformedRequest(format!("missing {name}")))
}

fn optional_param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
}

fn safe_characters(value: &str) -> bool {
    value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn signature_matches(
    secret: &str,
    method: &str,
    url: &Url,
    params: &[(String, String)],
    provided: &str,
) -> LtiResult<bool> {
    let expected = sign_request(secret, method, url, params)?;
    Ok(expected.as_bytes().ct_eq(provided.as_bytes()).into())
}

/// Compute the RFC 5849 HMAC-SHA1 signature for a request.
///
/// Exposed so test fixtures can sign launches the way a platform would;
/// `params` are the form-decoded body pairs (an existing `oauth_signature`
/// entry is ignored).
pub fn sign_request(
    secret: &str,
    method: &str,
    url: &Url,
    params: &[(String, String)],
) -> LtiResult<String> {
    let base = signature_base_string(method, url, params);
    let key = format!("{}&", enc(secret));
    let mut mac = HmacSha1::new_from_slice(key.as_bytes())
        .map_err(|_| LtiError::Config("HMAC key setup failed".to_string()))?;
    mac.update(base.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// RFC 5849 §3.4.1: `METHOD&enc(base-url)&enc(sorted-params)`.
fn signature_base_string(method: &str, url: &Url, params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .filter(|(k, _)| k != "oauth_signature")
        .map(|(k, v)| (enc(k), enc(v)))
        .chain(
            url.query_pairs()
                .map(|(k, v)| (enc(k.as_ref()), enc(v.as_ref()))),
        )
        .collect();
    encoded.sort();

    let normalized = encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        enc(&base_url(url)),
        enc(&normalized)
    )
}

/// Lowercased scheme/host, default ports dropped, no query or fragment.
fn base_url(url: &Url) -> String {
    let scheme = url.scheme().to_ascii_lowercase();
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    match url.port() {
        Some(port) => format!("{scheme}://{host}:{port}{}", url.path()),
        None => format!("{scheme}://{host}{}", url.path()),
    }
}

fn enc(value: &str) -> String {
    utf8_percent_encode(value, OAUTH_ENCODE).to_string()
}
