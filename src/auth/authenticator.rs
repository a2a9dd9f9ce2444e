//! API key to access token, with verification and a per-environment cache.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::backend::AuthBackend;
use super::jwks;
use super::token_cache::{CachedToken, TokenCache};
use crate::types::Result;

/// Lifetime assumed for a token whose claims carry no `exp`.
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 55 * 60;

/// Anything that can hand out an access token for a connection.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self, endpoint: &str, api_key: &str, env: &str) -> Result<String>;
}

/// Issues verified access tokens, reusing cached ones while they are fresh.
///
/// The cache is read from disk on first use and written back after every
/// change. Save failures are logged and otherwise ignored; the token in hand
/// is still good.
pub struct Authenticator {
    backend: Arc<dyn AuthBackend>,
    cache_path: Option<PathBuf>,
    cache: Mutex<Option<TokenCache>>,
}

impl Authenticator {
    /// `cache_path` of `None` keeps the cache in memory only.
    pub fn new(backend: Arc<dyn AuthBackend>, cache_path: Option<PathBuf>) -> Self {
        Self {
            backend,
            cache_path,
            cache: Mutex::new(None),
        }
    }

    pub fn cache_path(&self) -> Option<&PathBuf> {
        self.cache_path.as_ref()
    }

    /// Get an access token for `env`.
    ///
    /// A cached token is returned as-is while it has more than five minutes
    /// left. Otherwise the API key is exchanged, the new token is verified
    /// against the service's published keys, and the result is cached.
    pub async fn get_jwt(&self, endpoint: &str, api_key: &str, env: &str) -> Result<String> {
        let mut guard = self.cache.lock().await;
        if guard.is_none() {
            *guard = Some(self.load_cache().await);
        }
        let cache = guard.get_or_insert_with(TokenCache::default);

        let now = Utc::now();
        if let Some(cached) = cache.get(env) {
            if cached.is_fresh(now) {
                debug!(env, expires_at = %cached.expires_at, "Using cached access token");
                return Ok(cached.access_token.clone());
            }
            debug!(env, expires_at = %cached.expires_at, "Cached access token near expiry");
        }

        info!(env, "Requesting access token");
        let token = self.backend.exchange(endpoint, api_key).await?;
        let keys = self.backend.fetch_key_set(endpoint).await?;
        let claims = jwks::verify_token(&token, &keys)?;

        let expires_at = claims
            .expires_at()
            .unwrap_or_else(|| now + chrono::Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS));
        info!(env, expires_at = %expires_at, "Access token verified");

        cache.insert(
            env,
            CachedToken {
                access_token: token.clone(),
                expires_at,
            },
        );
        self.persist(cache).await;

        Ok(token)
    }

    /// Forget the cached token for `env`.
    ///
    /// Does nothing if the cache has not been loaded yet.
    pub async fn clear_cache(&self, env: &str) {
        let mut guard = self.cache.lock().await;
        let Some(cache) = guard.as_mut() else {
            return;
        };

        cache.remove(env);
        self.persist(cache).await;
        debug!(env, "Cleared cached access token");
    }

    async fn load_cache(&self) -> TokenCache {
        match &self.cache_path {
            Some(path) => TokenCache::load(path).await,
            None => TokenCache::default(),
        }
    }

    async fn persist(&self, cache: &TokenCache) {
        let Some(path) = &self.cache_path else {
            return;
        };
        if let Err(e) = cache.save(path).await {
            warn!(path = %path.display(), error = %e, "Failed to save token cache");
        }
    }
}

#[async_trait]
impl TokenProvider for Authenticator {
    async fn token(&self, endpoint: &str, api_key: &str, env: &str) -> Result<String> {
        self.get_jwt(endpoint, api_key, env).await
    }
}
