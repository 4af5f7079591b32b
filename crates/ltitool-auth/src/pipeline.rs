//! The composed launch pipeline
//!
//! Ties the validators, the nonce cache, the session envelope, and the
//! pending-login store together behind a framework-agnostic surface: a
//! [`LaunchRequest`] in, an established session or an [`LtiError`] out.
//! The host application owns the HTTP layer and the session container; this
//! type owns everything between "signed bytes arrived" and "sealed,
//! session-bound launch data".
//!
//! Dispatch mirrors the launch endpoint's behavior: a body carrying
//! `oauth_consumer_key` is an LTI 1.1 launch, one carrying `id_token` is an
//! LTI 1.3 authentication response, anything else is malformed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};
use url::Url;

use ltitool_core::{roles, LaunchData, LtiError, LtiResult, RequiredRole};
use ltitool_handshake::{
    render_cookie_check_page, render_launch_redirect, render_redirect, CookieCheckTexts,
    HandshakeConfig,
};

use crate::codec::SessionCodec;
use crate::config::ToolConfig;
use crate::nonce::{MemoryNonceStore, NonceStore};
use crate::oauth1::OAuth1Validator;
use crate::oidc::{LaunchDataStore, LoginRedirect, MemoryLaunchDataStore, OidcValidator};
use crate::session::LaunchSession;

/// Time source, injected so window tests never sleep.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now(&self) -> u64;
}

/// Wall-clock [`Clock`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// An inbound request, as the host framework saw it.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub method: String,
    /// Full request URL, scheme included.
    pub url: String,
    /// Whether the connection (after any proxy) used TLS.
    pub is_secure: bool,
    /// The raw `application/x-www-form-urlencoded` body.
    pub body: String,
}

impl LaunchRequest {
    pub fn post(url: impl Into<String>, is_secure: bool, body: impl Into<String>) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            is_secure,
            body: body.into(),
        }
    }

    fn form_params(&self) -> Vec<(String, String)> {
        url::form_urlencoded::parse(self.body.as_bytes())
            .into_owned()
            .collect()
    }

    fn has_param(&self, name: &str) -> bool {
        self.form_params().iter().any(|(k, _)| k == name)
    }
}

/// A verified launch: the sealed blob for the session container plus the
/// decoded data for immediate use.
#[derive(Debug, Clone)]
pub struct EstablishedSession {
    pub sealed_blob: String,
    pub data: LaunchData,
}

/// Session-binding values the fetching redirect recovers from platform
/// storage when the session cookie never arrived.
const RECOVERY_KEYS: &[&str] = &["nonce", "state", "session_cookie_name", "session_cookie_value"];

/// Everything between an inbound launch POST and an established session.
pub struct LaunchPipeline {
    oauth1: OAuth1Validator,
    oidc: OidcValidator,
    session: LaunchSession,
    handshake: HandshakeConfig,
    clock: Arc<dyn Clock>,
}

impl LaunchPipeline {
    /// Assemble the default pipeline: in-memory nonce and login stores, the
    /// wall clock, and validators drawn from configuration.
    pub fn new(config: &ToolConfig) -> LtiResult<Self> {
        Self::with_stores(
            config,
            Arc::new(MemoryNonceStore::new()),
            Arc::new(MemoryLaunchDataStore::new()),
            Arc::new(SystemClock),
        )
    }

    /// Assemble with injected stores, for shared deployments and for tests.
    pub fn with_stores(
        config: &ToolConfig,
        nonces: Arc<dyn NonceStore>,
        logins: Arc<dyn LaunchDataStore>,
        clock: Arc<dyn Clock>,
    ) -> LtiResult<Self> {
        let codec = SessionCodec::from_config(config)?;
        let handshake = match config.handshake_timeout_secs {
            Some(secs) => HandshakeConfig::new(Duration::from_secs(secs)),
            None => HandshakeConfig::default(),
        };
        Ok(Self {
            oauth1: OAuth1Validator::new(config.consumers.clone(), nonces),
            oidc: OidcValidator::new(config.platforms.clone(), logins),
            session: LaunchSession::new(codec),
            handshake,
            clock,
        })
    }

    /// Replace the OIDC validator, e.g. to widen the accepted algorithms.
    pub fn with_oidc(mut self, oidc: OidcValidator) -> Self {
        self.oidc = oidc;
        self
    }

    /// Validate a launch POST and seal the result for `session_id`.
    pub async fn launch(
        &self,
        request: &LaunchRequest,
        session_id: &str,
    ) -> LtiResult<EstablishedSession> {
        let now = self.clock.now();

        let result = if request.has_param("oauth_consumer_key") {
            self.oauth1.validate(
                &request.method,
                &request.url,
                request.is_secure,
                &request.body,
                now,
            )
        } else if request.has_param("id_token") {
            self.oidc.validate_launch(&request.form_params(), now).await
        } else {
            Err(LtiError::MalformedRequest(
                "neither an LTI 1.1 nor an LTI 1.3 launch".to_string(),
            ))
        };

        match result {
            Ok(data) => {
                info!(params = data.len(), "launch validated");
                let sealed_blob = self.session.seal(session_id, &data)?;
                Ok(EstablishedSession { sealed_blob, data })
            }
            Err(e) => {
                warn!(category = e.category(), error = %e, "launch rejected");
                Err(e)
            }
        }
    }

    /// Handle an OIDC login-initiation POST.
    pub fn login(&self, request: &LaunchRequest) -> LtiResult<LoginRedirect> {
        self.oidc
            .validate_login(&request.form_params(), request.is_secure, self.clock.now())
    }

    /// Recover sealed launch data for the current session.
    pub fn open_session(&self, session_id: &str, blob: &str) -> LtiResult<LaunchData> {
        self.session.open(session_id, blob)
    }

    /// Render the third-party-cookie probe page for a login initiation,
    /// carrying the request's parameters through the probe.
    pub fn cookie_check_page(&self, request: &LaunchRequest) -> String {
        let params: BTreeMap<String, String> = request.form_params().into_iter().collect();
        let protocol = if request.is_secure { "https" } else { "http" };
        render_cookie_check_page(&params, protocol, &CookieCheckTexts::default())
    }

    /// Render the storing redirect for a minted login: pushes the state's
    /// nonce into platform storage (`lti.put_data`) before following the
    /// authorization redirect.
    pub fn login_redirect_page(&self, redirect: &LoginRedirect) -> LtiResult<String> {
        let auth_url = Url::parse(&redirect.location)
            .map_err(|e| LtiError::Config(format!("bad authorization URL: {e}")))?;
        let auth_origin = auth_url.origin().ascii_serialization();

        let mut values = BTreeMap::new();
        values.insert(redirect.state.clone(), redirect.nonce.clone());
        Ok(render_redirect(
            &redirect.location,
            &auth_origin,
            &values,
            self.handshake.timeout(),
        ))
    }

    /// Render the fetching redirect for a launch that arrived without its
    /// session cookie: recovers the values stored during login
    /// (`lti.get_data` per key) and re-enters the launch at `location` with
    /// them appended.
    ///
    /// `state` is the launch's `state` parameter; it scopes the per-key
    /// message ids to this launch.
    pub fn launch_recovery_page(
        &self,
        issuer: &str,
        state: &str,
        location: &str,
    ) -> LtiResult<String> {
        let auth_origin = self.oidc.authorization_origin(issuer)?;
        Ok(render_launch_redirect(
            location,
            &auth_origin,
            state,
            RECOVERY_KEYS,
            self.handshake.timeout(),
        ))
    }

    /// Enforce the platform gate and the role requirement at a view boundary.
    /// The default requirement everywhere is `member`.
    pub fn authorize(&self, data: &LaunchData, required: &RequiredRole) -> LtiResult<()> {
        roles::authorize(data, required)
    }
}
