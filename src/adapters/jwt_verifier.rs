use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use super::jwks::JwksClient;
use crate::domain::auth::{AuthConfig, AuthError, AuthMode, Subject};
use crate::domain::TokenPort;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
    #[serde(default)]
    roles: Vec<String>,
}

enum KeySource {
    Secret {
        key: DecodingKey,
        algorithm: Algorithm,
    },
    Jwks(JwksClient),
}

/// Verifies bearer tokens and extracts the caller's identity
pub struct JwtVerifier {
    keys: KeySource,
    leeway: u64,
}

impl JwtVerifier {
    pub fn from_config(config: &AuthConfig) -> Result<Self, AuthError> {
        let keys = match config.mode {
            AuthMode::BearerToken => {
                let secret = config.jwt_secret.as_ref().ok_or_else(|| {
                    AuthError::Configuration("jwt_secret is required for bearer_token".to_string())
                })?;
                KeySource::Secret {
                    key: DecodingKey::from_secret(secret.as_bytes()),
                    algorithm: hmac_algorithm(config.jwt_algorithm.as_deref())?,
                }
            }
            AuthMode::Jwks => {
                let url = config.jwks_url.as_ref().ok_or_else(|| {
                    AuthError::Configuration("jwks_url is required for jwks".to_string())
                })?;
                KeySource::Jwks(JwksClient::new(url.clone()))
            }
        };

        Ok(Self {
            keys,
            leeway: config.leeway_secs,
        })
    }

    fn validation(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        validation.leeway = self.leeway;
        validation.set_required_spec_claims(&["exp", "sub"]);
        validation
    }
}

fn hmac_algorithm(name: Option<&str>) -> Result<Algorithm, AuthError> {
    match name {
        None | Some("HS256") => Ok(Algorithm::HS256),
        Some("HS384") => Ok(Algorithm::HS384),
        Some("HS512") => Ok(Algorithm::HS512),
        Some(other) => Err(AuthError::Configuration(format!(
            "unsupported jwt_algorithm {}",
            other
        ))),
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        _ => AuthError::InvalidToken(err.to_string()),
    }
}

#[async_trait]
impl TokenPort for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Subject, AuthError> {
        let claims = match &self.keys {
            KeySource::Secret { key, algorithm } => {
                decode::<Claims>(token, key, &self.validation(*algorithm))
                    .map_err(map_jwt_error)?
                    .claims
            }
            KeySource::Jwks(client) => {
                let header = decode_header(token).map_err(map_jwt_error)?;
                let kid = header
                    .kid
                    .ok_or_else(|| AuthError::InvalidToken("token has no kid".to_string()))?;
                let key = client.get_key(&kid).await?.decoding_key()?;
                decode::<Claims>(token, &key, &self.validation(Algorithm::RS256))
                    .map_err(map_jwt_error)?
                    .claims
            }
        };

        if claims.sub.is_empty() {
            return Err(AuthError::InvalidToken("empty subject".to_string()));
        }

        Ok(Subject {
            user_id: claims.sub,
            roles: claims.roles,
        })
    }
}
