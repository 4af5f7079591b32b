//! Platform JWKS fetching and caching
//!
//! Each LTI 1.3 platform publishes its signing keys at a JWKS endpoint.
//! Keys are fetched with a bounded timeout and cached with a TTL; a
//! validation failure may force a refresh (key rotation), rate limited so
//! a flood of bad tokens cannot be turned into a flood of JWKS fetches.
//!
//! HTTPS is required for key-set endpoints; plain HTTP is allowed only for
//! localhost so integration tests can stand up a local server.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use jsonwebtoken::jwk::JwkSet;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use ltitool_core::{LtiError, LtiResult};

/// A fetched key set and its expiry window.
#[derive(Debug, Clone)]
struct CachedJwks {
    jwks: JwkSet,
    cached_at: SystemTime,
    ttl: Duration,
}

impl CachedJwks {
    fn is_valid(&self) -> bool {
        match SystemTime::now().duration_since(self.cached_at) {
            Ok(age) => age < self.ttl,
            Err(_) => false, // clock went backwards, invalidate
        }
    }
}

/// Client for one platform's JWKS endpoint.
///
/// # Example
///
/// ```rust,no_run
/// # use ltitool_auth::jwks::JwksClient;
/// # tokio_test::block_on(async {
/// let client = JwksClient::new("https://sso.canvaslms.com/api/lti/security/jwks".to_string());
///
/// // first call hits the endpoint, later calls come from the cache
/// let jwks = client.get_jwks().await?;
/// if let Some(key) = jwks.find("key-id-123") {
///     // verify the id_token against this key
/// }
/// # Ok::<(), ltitool_core::LtiError>(())
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct JwksClient {
    jwks_uri: String,
    cache: Arc<RwLock<Option<CachedJwks>>>,
    http_client: reqwest::Client,
    cache_ttl: Duration,
    /// Floor between forced refreshes.
    min_refresh_interval: Duration,
    last_refresh: Arc<RwLock<Option<SystemTime>>>,
}

impl JwksClient {
    /// Client with the default 10-minute cache TTL.
    pub fn new(jwks_uri: String) -> Self {
        Self {
            jwks_uri,
            cache: Arc::new(RwLock::new(None)),
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client with static options"),
            cache_ttl: Duration::from_secs(600),
            min_refresh_interval: Duration::from_secs(5),
            last_refresh: Arc::new(RwLock::new(None)),
        }
    }

    /// Client with a custom cache TTL.
    pub fn with_ttl(jwks_uri: String, cache_ttl: Duration) -> Self {
        let mut client = Self::new(jwks_uri);
        client.cache_ttl = cache_ttl;
        client
    }

    /// Get the key set, from cache when still valid.
    pub async fn get_jwks(&self) -> LtiResult<JwkSet> {
        if let Some(jwks) = self.cached().await {
            return Ok(jwks);
        }
        self.fetch_fresh().await
    }

    /// Force a refresh, e.g. after a `kid` miss that suggests key rotation.
    ///
    /// Throttled: within the minimum interval the cache answers instead, so
    /// a flood of forged tokens cannot hammer the platform endpoint.
    pub async fn refresh(&self) -> LtiResult<JwkSet> {
        if self.recently_refreshed().await {
            warn!(jwks_uri = %self.jwks_uri, "key-set refresh throttled, answering from cache");
            return self.get_jwks().await;
        }
        self.fetch_fresh().await
    }

    async fn cached(&self) -> Option<JwkSet> {
        let cache = self.cache.read().await;
        let cached = cache.as_ref()?;
        if cached.is_valid() {
            debug!(jwks_uri = %self.jwks_uri, "key set answered from cache");
            Some(cached.jwks.clone())
        } else {
            None
        }
    }

    async fn recently_refreshed(&self) -> bool {
        let last_refresh = self.last_refresh.read().await;
        match *last_refresh {
            Some(at) => SystemTime::now()
                .duration_since(at)
                .map(|since| since < self.min_refresh_interval)
                .unwrap_or(false),
            None => false,
        }
    }

    async fn fetch_fresh(&self) -> LtiResult<JwkSet> {
        if !self.jwks_uri.starts_with("https://")
            && !self.jwks_uri.starts_with("http://localhost")
            && !self.jwks_uri.starts_with("http://127.0.0.1")
        {
            return Err(LtiError::Config(
                "key-set endpoint must use https (plain http only for localhost)".to_string(),
            ));
        }

        info!(jwks_uri = %self.jwks_uri, "fetching platform key set");
        let response = self
            .http_client
            .get(&self.jwks_uri)
            .send()
            .await
            .map_err(|e| {
                error!(jwks_uri = %self.jwks_uri, error = %e, "key-set fetch failed");
                LtiError::JwksFetch(format!("key-set fetch failed: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            error!(jwks_uri = %self.jwks_uri, status = %status, "key-set endpoint unhealthy");
            return Err(LtiError::JwksFetch(format!(
                "key-set endpoint returned status {status}"
            )));
        }

        let jwks: JwkSet = response.json().await.map_err(|e| {
            error!(jwks_uri = %self.jwks_uri, error = %e, "key-set response is not a JWK set");
            LtiError::JwksFetch(format!("invalid key-set document: {e}"))
        })?;
        info!(
            jwks_uri = %self.jwks_uri,
            key_count = jwks.keys.len(),
            "platform key set refreshed"
        );

        let now = SystemTime::now();
        *self.cache.write().await = Some(CachedJwks {
            jwks: jwks.clone(),
            cached_at: now,
            ttl: self.cache_ttl,
        });
        *self.last_refresh.write().await = Some(now);

        Ok(jwks)
    }

    pub fn jwks_uri(&self) -> &str {
        &self.jwks_uri
    }

    /// Drop the cached key set; the next lookup fetches fresh.
    pub async fn clear_cache(&self) {
        let mut cache = self.cache.write().await;
        *cache = None;
        debug!(jwks_uri = %self.jwks_uri, "key-set cache dropped");
    }
}

/// Per-issuer JWKS clients, one per registered platform.
///
/// Platforms carry their key-set URL in configuration, so there is no
/// OIDC discovery step here.
#[derive(Debug, Default)]
pub struct JwksRegistry {
    clients: DashMap<String, Arc<JwksClient>>,
}

impl JwksRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the client for `issuer` at `jwks_uri`.
    pub fn client_for(&self, issuer: &str, jwks_uri: &str) -> Arc<JwksClient> {
        self.clients
            .entry(issuer.to_string())
            .or_insert_with(|| Arc::new(JwksClient::new(jwks_uri.to_string())))
            .clone()
    }
}
