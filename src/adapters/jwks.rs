use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::domain::auth::AuthError;

const DEFAULT_TTL: Duration = Duration::from_secs(900);

#[derive(Debug, Deserialize, Clone)]
pub struct Jwk {
    pub kid: String,
    pub kty: String,
    pub alg: Option<String>,
    pub n: Option<String>,
    pub e: Option<String>,
}

impl Jwk {
    /// RSA verification key for this entry
    pub fn decoding_key(&self) -> Result<DecodingKey, AuthError> {
        if self.kty != "RSA" {
            return Err(AuthError::KeyUnavailable(format!(
                "key {} has unsupported type {}",
                self.kid, self.kty
            )));
        }
        let (n, e) = match (&self.n, &self.e) {
            (Some(n), Some(e)) => (n, e),
            _ => {
                return Err(AuthError::KeyUnavailable(format!(
                    "key {} is missing RSA components",
                    self.kid
                )))
            }
        };
        DecodingKey::from_rsa_components(n, e)
            .map_err(|e| AuthError::KeyUnavailable(format!("key {}: {}", self.kid, e)))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

type KeyCache = Option<(HashMap<String, Jwk>, Instant)>;

/// Fetches and caches the signing keys published by the identity provider
#[derive(Clone)]
pub struct JwksClient {
    client: reqwest::Client,
    url: String,
    cache: Arc<RwLock<KeyCache>>,
    ttl: Duration,
}

impl JwksClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            cache: Arc::new(RwLock::new(None)),
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn get_key(&self, kid: &str) -> Result<Jwk, AuthError> {
        {
            let cache = self.cache.read().await;
            if let Some((keys, fetched_at)) = &*cache {
                if fetched_at.elapsed() < self.ttl {
                    if let Some(key) = keys.get(kid) {
                        return Ok(key.clone());
                    }
                }
            }
        }

        // Unknown kid or stale cache: the provider may have rotated keys
        self.refresh().await?;

        let cache = self.cache.read().await;
        cache
            .as_ref()
            .and_then(|(keys, _)| keys.get(kid).cloned())
            .ok_or_else(|| AuthError::InvalidToken(format!("unknown key id {}", kid)))
    }

    async fn refresh(&self) -> Result<(), AuthError> {
        let jwks: Jwks = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| AuthError::KeyUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::KeyUnavailable(e.to_string()))?;

        let keys: HashMap<String, Jwk> = jwks
            .keys
            .into_iter()
            .map(|key| (key.kid.clone(), key))
            .collect();
        tracing::debug!(url = %self.url, keys = keys.len(), "Refreshed JWKS");

        let mut cache = self.cache.write().await;
        *cache = Some((keys, Instant::now()));
        Ok(())
    }
}
