//! LTI 1.3 launch verification: OIDC third-party-initiated login
//!
//! Two phases. Login initiation takes the platform's `iss` / `login_hint` /
//! `target_link_uri` POST, mints single-use `state` and `nonce` values, and
//! produces the platform authorization redirect. The launch phase receives
//! the signed `id_token`, resolves the platform's key by `kid`, and verifies
//! signature, issuer, audience, expiry, nonce, and deployment id.
//!
//! Every launch failure is an [`LtiError::OidcValidationFailed`] whose
//! sub-reason is logged server-side only; the user sees one generic message.

use std::sync::Arc;

use dashmap::DashMap;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use ltitool_core::{LaunchData, LtiError, LtiResult, CLAIM_DEPLOYMENT_ID};

use crate::config::{PlatformConfig, PlatformRegistry};
use crate::jwks::JwksRegistry;

/// Clock-skew leeway for `exp`/`iat`/`nbf`.
const JWT_LEEWAY_SECS: u64 = 60;

/// A pending login older than this is dead even if never consumed.
const LOGIN_TTL_SECS: u64 = 3600;

/// State minted at login initiation, consumed at launch.
#[derive(Debug, Clone)]
pub struct PendingLogin {
    pub issuer: String,
    pub nonce: String,
    pub target_link_uri: String,
    pub created_at: u64,
}

/// Storage for in-flight logins, keyed by `state`.
///
/// Injected so multi-process deployments can back it with something shared;
/// consumption must be single-use (a second `consume` of the same state
/// returns `None`).
pub trait LaunchDataStore: Send + Sync {
    fn store(&self, state: String, login: PendingLogin);
    fn consume(&self, state: &str) -> Option<PendingLogin>;
}

/// Process-local [`LaunchDataStore`].
#[derive(Debug, Default)]
pub struct MemoryLaunchDataStore {
    logins: DashMap<String, PendingLogin>,
}

impl MemoryLaunchDataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LaunchDataStore for MemoryLaunchDataStore {
    fn store(&self, state: String, login: PendingLogin) {
        self.logins.insert(state, login);
    }

    fn consume(&self, state: &str) -> Option<PendingLogin> {
        self.logins.remove(state).map(|(_, login)| login)
    }
}

/// The authorization redirect produced by login initiation.
#[derive(Debug, Clone)]
pub struct LoginRedirect {
    /// Full platform authorization URL with all OIDC parameters.
    pub location: String,
    pub state: String,
    pub nonce: String,
}

/// Verifies LTI 1.3 logins and launches against registered platforms.
pub struct OidcValidator {
    platforms: PlatformRegistry,
    jwks: JwksRegistry,
    logins: Arc<dyn LaunchDataStore>,
    allowed_algorithms: Vec<Algorithm>,
}

impl OidcValidator {
    pub fn new(platforms: PlatformRegistry, logins: Arc<dyn LaunchDataStore>) -> Self {
        Self {
            platforms,
            jwks: JwksRegistry::new(),
            logins,
            allowed_algorithms: vec![
                Algorithm::RS256,
                Algorithm::RS384,
                Algorithm::RS512,
                Algorithm::ES256,
                Algorithm::ES384,
                Algorithm::PS256,
                Algorithm::PS384,
                Algorithm::PS512,
            ],
        }
    }

    /// Restrict (or widen) the accepted signing algorithms.
    pub fn with_algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.allowed_algorithms = algorithms;
        self
    }

    /// Origin of the issuer's authorization endpoint, used to restrict the
    /// postMessage target of the handshake pages.
    pub fn authorization_origin(&self, issuer: &str) -> LtiResult<String> {
        let platform = self
            .platforms
            .get(issuer)
            .ok_or_else(|| LtiError::oidc(format!("unregistered issuer {issuer}")))?;
        let url = Url::parse(&platform.auth_login_url)
            .map_err(|e| LtiError::Config(format!("bad auth_login_url for {issuer}: {e}")))?;
        Ok(url.origin().ascii_serialization())
    }

    /// Handle the platform's login-initiation POST.
    ///
    /// `params` is the form body; `is_secure` drives the same http->https
    /// fixup the 1.1 path applies behind a TLS-terminating proxy.
    pub fn validate_login(
        &self,
        params: &[(String, String)],
        is_secure: bool,
        now: u64,
    ) -> LtiResult<LoginRedirect> {
        let issuer = required_param(params, "iss")?;
        let login_hint = required_param(params, "login_hint")?;
        let target_link_uri = required_param(params, "target_link_uri")?;

        let platform = self.platforms.get(issuer).ok_or_else(|| {
            warn!(issuer, "login initiation from unregistered issuer");
            LtiError::oidc(format!("unregistered issuer {issuer}"))
        })?;

        let target_link_uri = fix_target_scheme(target_link_uri, is_secure);

        let state = Uuid::new_v4().to_string();
        let nonce = Uuid::new_v4().to_string();
        self.logins.store(
            state.clone(),
            PendingLogin {
                issuer: issuer.to_string(),
                nonce: nonce.clone(),
                target_link_uri: target_link_uri.clone(),
                created_at: now,
            },
        );

        let mut auth_url = Url::parse(&platform.auth_login_url)
            .map_err(|e| LtiError::Config(format!("bad auth_login_url for {issuer}: {e}")))?;
        {
            let mut query = auth_url.query_pairs_mut();
            query
                .append_pair("client_id", &platform.client_id)
                .append_pair("login_hint", login_hint)
                .append_pair("nonce", &nonce)
                .append_pair("prompt", "none")
                .append_pair("redirect_uri", &target_link_uri)
                .append_pair("response_mode", "form_post")
                .append_pair("response_type", "id_token")
                .append_pair("scope", "openid")
                .append_pair("state", &state);
            if let Some(hint) = optional_param(params, "lti_message_hint") {
                query.append_pair("lti_message_hint", hint);
            }
        }

        debug!(issuer, state = %state, "login initiation accepted");
        Ok(LoginRedirect {
            location: auth_url.into(),
            state,
            nonce,
        })
    }

    /// Handle the platform's authentication response (the launch POST).
    pub async fn validate_launch(
        &self,
        params: &[(String, String)],
        now: u64,
    ) -> LtiResult<LaunchData> {
        let state = required_param(params, "state")?;
        let id_token = required_param(params, "id_token")?;

        let pending = self
            .logins
            .consume(state)
            .ok_or_else(|| LtiError::oidc("unknown or already-used state"))?;
        if now.saturating_sub(pending.created_at) > LOGIN_TTL_SECS {
            return Err(LtiError::oidc("login initiation expired"));
        }

        let platform = self
            .platforms
            .get(&pending.issuer)
            .ok_or_else(|| LtiError::oidc(format!("unregistered issuer {}", pending.issuer)))?;

        let header =
            decode_header(id_token).map_err(|e| LtiError::oidc(format!("bad JWT header: {e}")))?;
        if !self.allowed_algorithms.contains(&header.alg) {
            return Err(LtiError::oidc(format!(
                "disallowed signing algorithm {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| LtiError::oidc("id_token header missing kid"))?;

        let decoding_key = self.resolve_key(&pending.issuer, platform, kid).await?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = JWT_LEEWAY_SECS;
        validation.set_audience(&[&platform.client_id]);
        validation.set_issuer(&[&pending.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        let token = decode::<Map<String, Value>>(id_token, &decoding_key, &validation)
            .map_err(|e| LtiError::oidc(format!("id_token rejected: {e}")))?;
        let claims = token.claims;

        let token_nonce = claims.get("nonce").and_then(Value::as_str);
        if token_nonce != Some(pending.nonce.as_str()) {
            warn!(issuer = %pending.issuer, "launch nonce does not match login initiation");
            return Err(LtiError::oidc("nonce mismatch"));
        }

        let deployment_id = claims
            .get(CLAIM_DEPLOYMENT_ID)
            .and_then(Value::as_str)
            .ok_or_else(|| LtiError::oidc("missing deployment_id claim"))?;
        if !platform.deployment_ids.iter().any(|d| d == deployment_id) {
            warn!(
                issuer = %pending.issuer,
                deployment_id,
                "launch from unregistered deployment"
            );
            return Err(LtiError::oidc(format!(
                "unregistered deployment_id {deployment_id}"
            )));
        }

        debug!(issuer = %pending.issuer, "LTI 1.3 launch verified");
        Ok(LaunchData::from_claims(claims))
    }

    /// Resolve the platform key for `kid`: static key set when configured,
    /// otherwise the cached JWKS endpoint with one rotation-refresh retry.
    async fn resolve_key(
        &self,
        issuer: &str,
        platform: &PlatformConfig,
        kid: &str,
    ) -> LtiResult<DecodingKey> {
        if let Some(key_set) = &platform.key_set {
            return key_from_set(key_set, kid);
        }

        let jwks_uri = platform
            .key_set_url
            .as_deref()
            .ok_or_else(|| LtiError::Config(format!("no key source configured for {issuer}")))?;
        let client = self.jwks.client_for(issuer, jwks_uri);

        let jwks = client.get_jwks().await?;
        match key_from_set(&jwks, kid) {
            Ok(key) => Ok(key),
            Err(_) => {
                // kid miss may mean the platform rotated keys
                debug!(issuer, kid, "kid not in cached JWKS, refreshing");
                let jwks = client.refresh().await?;
                key_from_set(&jwks, kid)
            }
        }
    }
}

fn key_from_set(key_set: &JwkSet, kid: &str) -> LtiResult<DecodingKey> {
    let jwk = key_set
        .find(kid)
        .ok_or_else(|| LtiError::oidc(format!("no key for kid {kid}")))?;
    DecodingKey::from_jwk(jwk).map_err(|e| LtiError::oidc(format!("unusable platform key: {e}")))
}

fn required_param<'a>(params: &'a [(String, String)], name: &str) -> LtiResult<&'a str> {
    optional_param(params, name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| LtiError::MalformedRequest(format!("missing {name}")))
}

fn optional_param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
}

/// A TLS-terminated proxy leaves `http:` in platform-supplied URIs that were
/// registered as `https:`.
fn fix_target_scheme(target: &str, is_secure: bool) -> String {
    if is_secure {
        if let Some(rest) = target.strip_prefix("http://") {
            return format!("https://{rest}");
        }
    }
    target.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::{SystemTime, UNIX_EPOCH};

    const ISSUER: &str = "https://canvas.instructure.com";
    const CLIENT_ID: &str = "10000000000001";
    const DEPLOYMENT: &str = "1:abc";
    const HS_SECRET: &[u8] = b"a-test-only-shared-signing-secret";
    const KID: &str = "test-key-1";

    fn static_key_set() -> JwkSet {
        serde_json::from_value(json!({
            "keys": [{
                "kty": "oct",
                "kid": KID,
                "alg": "HS256",
                "k": URL_SAFE_NO_PAD.encode(HS_SECRET),
            }]
        }))
        .unwrap()
    }

    fn platforms() -> PlatformRegistry {
        let mut map = HashMap::new();
        map.insert(
            ISSUER.to_string(),
            PlatformConfig {
                client_id: CLIENT_ID.to_string(),
                auth_login_url: "https://sso.canvaslms.com/api/lti/authorize_redirect".to_string(),
                key_set_url: None,
                key_set: Some(static_key_set()),
                deployment_ids: vec![DEPLOYMENT.to_string()],
            },
        );
        PlatformRegistry::new(map)
    }

    fn validator() -> OidcValidator {
        OidcValidator::new(platforms(), Arc::new(MemoryLaunchDataStore::new()))
            .with_algorithms(vec![Algorithm::HS256])
    }

    fn login_params() -> Vec<(String, String)> {
        vec![
            ("iss".to_string(), ISSUER.to_string()),
            ("login_hint".to_string(), "hint-1".to_string()),
            (
                "target_link_uri".to_string(),
                "https://tool.example.edu/launch".to_string(),
            ),
        ]
    }

    fn wall_now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn id_token(claims: &Map<String, Value>) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(KID.to_string());
        encode(&header, claims, &EncodingKey::from_secret(HS_SECRET)).unwrap()
    }

    fn launch_claims(nonce: &str) -> Map<String, Value> {
        let now = wall_now();
        let value = json!({
            "iss": ISSUER,
            "aud": CLIENT_ID,
            "exp": now + 3600,
            "iat": now,
            "nonce": nonce,
            "https://purl.imsglobal.org/spec/lti/claim/deployment_id": DEPLOYMENT,
            "https://purl.imsglobal.org/spec/lti/claim/context": {"label": "PSYCH 101 A"},
        });
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn login_redirect_carries_the_oidc_parameters() {
        let mut params = login_params();
        params.push(("lti_message_hint".to_string(), "mh-9".to_string()));
        let redirect = validator().validate_login(&params, true, wall_now()).unwrap();

        let url = Url::parse(&redirect.location).unwrap();
        let query: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query.get("scope").map(String::as_str), Some("openid"));
        assert_eq!(
            query.get("response_type").map(String::as_str),
            Some("id_token")
        );
        assert_eq!(
            query.get("response_mode").map(String::as_str),
            Some("form_post")
        );
        assert_eq!(query.get("prompt").map(String::as_str), Some("none"));
        assert_eq!(query.get("client_id").map(String::as_str), Some(CLIENT_ID));
        assert_eq!(
            query.get("redirect_uri").map(String::as_str),
            Some("https://tool.example.edu/launch")
        );
        assert_eq!(query.get("login_hint").map(String::as_str), Some("hint-1"));
        assert_eq!(query.get("lti_message_hint").map(String::as_str), Some("mh-9"));
        assert_eq!(query.get("state").map(String::as_str), Some(redirect.state.as_str()));
        assert_eq!(query.get("nonce").map(String::as_str), Some(redirect.nonce.as_str()));
    }

    #[test]
    fn login_from_unknown_issuer_fails() {
        let params = vec![
            ("iss".to_string(), "https://unknown.example.com".to_string()),
            ("login_hint".to_string(), "hint-1".to_string()),
            (
                "target_link_uri".to_string(),
                "https://tool.example.edu/launch".to_string(),
            ),
        ];
        assert!(matches!(
            validator().validate_login(&params, true, wall_now()),
            Err(LtiError::OidcValidationFailed { .. })
        ));
    }

    #[test]
    fn login_without_hint_is_malformed() {
        let params = vec![("iss".to_string(), ISSUER.to_string())];
        assert!(matches!(
            validator().validate_login(&params, true, wall_now()),
            Err(LtiError::MalformedRequest(_))
        ));
    }

    #[test]
    fn proxied_target_link_uri_is_upgraded_to_https() {
        let params = vec![
            ("iss".to_string(), ISSUER.to_string()),
            ("login_hint".to_string(), "hint-1".to_string()),
            (
                "target_link_uri".to_string(),
                "http://tool.example.edu/launch".to_string(),
            ),
        ];
        let redirect = validator().validate_login(&params, true, wall_now()).unwrap();
        let url = Url::parse(&redirect.location).unwrap();
        let query: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(
            query.get("redirect_uri").map(String::as_str),
            Some("https://tool.example.edu/launch")
        );
    }

    #[tokio::test]
    async fn full_launch_round_trip() {
        let validator = validator();
        let now = wall_now();
        let login = login_params();
        let redirect = validator.validate_login(&login, true, now).unwrap();

        let token = id_token(&launch_claims(&redirect.nonce));
        let launch = vec![
            ("state".to_string(), redirect.state.clone()),
            ("id_token".to_string(), token),
        ];
        let data = validator.validate_launch(&launch, now).await.unwrap();
        assert_eq!(data.claim("context", "label"), Some("PSYCH 101 A"));
    }

    #[tokio::test]
    async fn state_is_single_use() {
        let validator = validator();
        let now = wall_now();
        let login = login_params();
        let redirect = validator.validate_login(&login, true, now).unwrap();
        let token = id_token(&launch_claims(&redirect.nonce));
        let launch = vec![
            ("state".to_string(), redirect.state.clone()),
            ("id_token".to_string(), token),
        ];
        assert!(validator.validate_launch(&launch, now).await.is_ok());
        assert!(matches!(
            validator.validate_launch(&launch, now).await,
            Err(LtiError::OidcValidationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn wrong_nonce_rejected() {
        let validator = validator();
        let now = wall_now();
        let login = login_params();
        let redirect = validator.validate_login(&login, true, now).unwrap();
        let token = id_token(&launch_claims("some-other-nonce"));
        let launch = vec![
            ("state".to_string(), redirect.state.clone()),
            ("id_token".to_string(), token),
        ];
        assert!(matches!(
            validator.validate_launch(&launch, now).await,
            Err(LtiError::OidcValidationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn unregistered_deployment_rejected() {
        let validator = validator();
        let now = wall_now();
        let login = login_params();
        let redirect = validator.validate_login(&login, true, now).unwrap();
        let mut claims = launch_claims(&redirect.nonce);
        claims.insert(
            CLAIM_DEPLOYMENT_ID.to_string(),
            json!("9:never-registered"),
        );
        let token = id_token(&claims);
        let launch = vec![
            ("state".to_string(), redirect.state.clone()),
            ("id_token".to_string(), token),
        ];
        assert!(matches!(
            validator.validate_launch(&launch, now).await,
            Err(LtiError::OidcValidationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn tampered_token_rejected() {
        let validator = validator();
        let now = wall_now();
        let login = login_params();
        let redirect = validator.validate_login(&login, true, now).unwrap();
        let token = id_token(&launch_claims(&redirect.nonce));
        // flip a payload byte
        let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
        parts[1] = parts[1].replace('A', "B");
        let launch = vec![
            ("state".to_string(), redirect.state.clone()),
            ("id_token".to_string(), parts.join(".")),
        ];
        assert!(matches!(
            validator.validate_launch(&launch, now).await,
            Err(LtiError::OidcValidationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn default_algorithms_exclude_symmetric() {
        // same platform but without the HS256 allowance
        let validator = OidcValidator::new(platforms(), Arc::new(MemoryLaunchDataStore::new()));
        let now = wall_now();
        let login = login_params();
        let redirect = validator.validate_login(&login, true, now).unwrap();
        let token = id_token(&launch_claims(&redirect.nonce));
        let launch = vec![
            ("state".to_string(), redirect.state.clone()),
            ("id_token".to_string(), token),
        ];
        let err = validator.validate_launch(&launch, now).await.unwrap_err();
        assert!(matches!(err, LtiError::OidcValidationFailed { .. }));
    }
}
