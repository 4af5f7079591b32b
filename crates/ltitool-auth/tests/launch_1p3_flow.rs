//! End-to-end LTI 1.3 flow: login initiation, platform authentication
//! response, sealed session. The platform's JWKS endpoint is mocked with
//! wiremock; tokens are signed with a test-only symmetric key so the suite
//! needs no key generation.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::json;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ltitool_auth::{
    LaunchDataStore, LaunchPipeline, LaunchRequest, LtiError, MemoryLaunchDataStore,
    MemoryNonceStore,
    OidcValidator, SystemClock, ToolConfig,
};
use ltitool_core::RequiredRole;

const ISSUER: &str = "https://canvas.instructure.com";
const CLIENT_ID: &str = "10000000000001";
const DEPLOYMENT: &str = "1:abc";
const HS_SECRET: &[u8] = b"a-test-only-shared-signing-secret";
const KID: &str = "sso-2024-01";
const LAUNCH_URL: &str = "https://tool.example.edu/launch";

async fn mock_platform_jwks() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/lti/security/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "keys": [{
                "kty": "oct",
                "kid": KID,
                "alg": "HS256",
                "k": URL_SAFE_NO_PAD.encode(HS_SECRET),
            }]
        })))
        .mount(&server)
        .await;
    server
}

fn config(jwks_base: &str) -> ToolConfig {
    ToolConfig::from_json(&format!(
        r#"{{
            "session_key": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=",
            "platforms": {{
                "{ISSUER}": {{
                    "client_id": "{CLIENT_ID}",
                    "auth_login_url": "https://sso.canvaslms.com/api/lti/authorize_redirect",
                    "key_set_url": "{jwks_base}/api/lti/security/jwks",
                    "deployment_ids": ["{DEPLOYMENT}"]
                }}
            }}
        }}"#
    ))
    .unwrap()
}

fn pipeline(config: &ToolConfig) -> LaunchPipeline {
    let logins: Arc<dyn LaunchDataStore> = Arc::new(MemoryLaunchDataStore::new());
    let oidc = OidcValidator::new(config.platforms.clone(), Arc::clone(&logins))
        .with_algorithms(vec![Algorithm::HS256]);
    LaunchPipeline::with_stores(
        config,
        Arc::new(MemoryNonceStore::new()),
        logins,
        Arc::new(SystemClock),
    )
    .unwrap()
    .with_oidc(oidc)
}

fn login_request() -> LaunchRequest {
    let body = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs([
            ("iss", ISSUER),
            ("login_hint", "opaque-hint-1"),
            ("target_link_uri", LAUNCH_URL),
            ("lti_message_hint", "mh-42"),
        ])
        .finish();
    LaunchRequest::post("https://tool.example.edu/login", true, body)
}

fn signed_id_token(nonce: &str, mutate: impl FnOnce(&mut serde_json::Map<String, serde_json::Value>)) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let value = json!({
        "iss": ISSUER,
        "aud": CLIENT_ID,
        "sub": "user-9000",
        "exp": now + 3600,
        "iat": now,
        "nonce": nonce,
        "name": "James Average",
        "https://purl.imsglobal.org/spec/lti/claim/deployment_id": DEPLOYMENT,
        "https://purl.imsglobal.org/spec/lti/claim/message_type": "LtiResourceLinkRequest",
        "https://purl.imsglobal.org/spec/lti/claim/tool_platform": {
            "product_family_code": "canvas"
        },
        "https://purl.imsglobal.org/spec/lti/claim/context": {
            "label": "PSYCH 101 A"
        },
        "https://purl.imsglobal.org/spec/lti/claim/custom": {
            "canvas_user_id": "700007"
        },
        "https://purl.imsglobal.org/spec/lti/claim/roles": [
            "http://purl.imsglobal.org/vocab/lis/v2/membership#Learner",
            "http://purl.imsglobal.org/vocab/lis/v2/institution/person#Student"
        ],
    });
    let mut claims = match value {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    };
    mutate(&mut claims);

    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(KID.to_string());
    encode(&header, &claims, &EncodingKey::from_secret(HS_SECRET)).unwrap()
}

fn launch_request(state: &str, id_token: &str) -> LaunchRequest {
    let body = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs([("state", state), ("id_token", id_token)])
        .finish();
    LaunchRequest::post(LAUNCH_URL, true, body)
}

#[tokio::test]
async fn login_then_launch_establishes_a_session() {
    let server = mock_platform_jwks().await;
    let config = config(&server.uri());
    let pipeline = pipeline(&config);

    let redirect = pipeline.login(&login_request()).unwrap();
    let url = Url::parse(&redirect.location).unwrap();
    assert!(url.as_str().starts_with("https://sso.canvaslms.com/api/lti/authorize_redirect?"));
    let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    assert!(query.contains(&("scope".to_string(), "openid".to_string())));
    assert!(query.contains(&("response_mode".to_string(), "form_post".to_string())));
    assert!(query.contains(&("state".to_string(), redirect.state.clone())));

    let token = signed_id_token(&redirect.nonce, |_| {});
    let established = pipeline
        .launch(&launch_request(&redirect.state, &token), "sess-1")
        .await
        .unwrap();

    assert_eq!(established.data.claim("context", "label"), Some("PSYCH 101 A"));
    assert_eq!(
        established.data.claim("custom", "canvas_user_id"),
        Some("700007")
    );
    assert!(pipeline
        .authorize(&established.data, &RequiredRole::Member)
        .is_ok());
    assert!(matches!(
        pipeline.authorize(&established.data, &RequiredRole::Admin),
        Err(LtiError::Forbidden)
    ));

    let reopened = pipeline
        .open_session("sess-1", &established.sealed_blob)
        .unwrap();
    assert_eq!(reopened.claim("context", "label"), Some("PSYCH 101 A"));
}

#[tokio::test]
async fn launch_with_a_wrong_nonce_fails() {
    let server = mock_platform_jwks().await;
    let config = config(&server.uri());
    let pipeline = pipeline(&config);

    let redirect = pipeline.login(&login_request()).unwrap();
    let token = signed_id_token("not-the-minted-nonce", |_| {});
    let err = pipeline
        .launch(&launch_request(&redirect.state, &token), "sess-1")
        .await
        .unwrap_err();
    assert!(matches!(err, LtiError::OidcValidationFailed { .. }));
    assert_eq!(err.status(), 401);
}

#[tokio::test]
async fn state_cannot_be_replayed() {
    let server = mock_platform_jwks().await;
    let config = config(&server.uri());
    let pipeline = pipeline(&config);

    let redirect = pipeline.login(&login_request()).unwrap();
    let token = signed_id_token(&redirect.nonce, |_| {});
    let request = launch_request(&redirect.state, &token);

    assert!(pipeline.launch(&request, "sess-1").await.is_ok());
    assert!(matches!(
        pipeline.launch(&request, "sess-1").await,
        Err(LtiError::OidcValidationFailed { .. })
    ));
}

#[tokio::test]
async fn expired_token_fails() {
    let server = mock_platform_jwks().await;
    let config = config(&server.uri());
    let pipeline = pipeline(&config);

    let redirect = pipeline.login(&login_request()).unwrap();
    let token = signed_id_token(&redirect.nonce, |claims| {
        let past = json!(1_500_000_000u64);
        claims.insert("exp".to_string(), past.clone());
        claims.insert("iat".to_string(), past);
    });
    assert!(matches!(
        pipeline
            .launch(&launch_request(&redirect.state, &token), "sess-1")
            .await,
        Err(LtiError::OidcValidationFailed { .. })
    ));
}

#[tokio::test]
async fn audience_must_be_this_tool() {
    let server = mock_platform_jwks().await;
    let config = config(&server.uri());
    let pipeline = pipeline(&config);

    let redirect = pipeline.login(&login_request()).unwrap();
    let token = signed_id_token(&redirect.nonce, |claims| {
        claims.insert("aud".to_string(), json!("some-other-tool"));
    });
    assert!(matches!(
        pipeline
            .launch(&launch_request(&redirect.state, &token), "sess-1")
            .await,
        Err(LtiError::OidcValidationFailed { .. })
    ));
}

#[tokio::test]
async fn unknown_kid_forces_a_refresh_then_fails_cleanly() {
    let server = mock_platform_jwks().await;
    let config = config(&server.uri());
    let pipeline = pipeline(&config);

    let redirect = pipeline.login(&login_request()).unwrap();
    let token = {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("rotated-away".to_string());
        let claims = json!({
            "iss": ISSUER,
            "aud": CLIENT_ID,
            "exp": 4_000_000_000u64,
            "nonce": redirect.nonce,
        });
        encode(&header, &claims, &EncodingKey::from_secret(HS_SECRET)).unwrap()
    };
    let err = pipeline
        .launch(&launch_request(&redirect.state, &token), "sess-1")
        .await
        .unwrap_err();
    assert!(matches!(err, LtiError::OidcValidationFailed { .. }));
}
