use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// HMAC-signed JWTs checked against `jwt_secret`
    #[default]
    BearerToken,
    /// RSA-signed JWTs checked against keys published at `jwks_url`
    Jwks,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default = "default_algorithm")]
    pub jwt_algorithm: Option<String>,
    #[serde(default)]
    pub jwks_url: Option<String>,
    /// Clock skew tolerated when checking `exp`
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,
}

fn default_algorithm() -> Option<String> {
    Some("HS256".to_string())
}

fn default_leeway() -> u64 {
    30
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::BearerToken,
            jwt_secret: None,
            jwt_algorithm: default_algorithm(),
            jwks_url: None,
            leeway_secs: default_leeway(),
        }
    }
}

/// Identity extracted from a verified token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing credentials")]
    MissingCredentials,

    #[error("Token expired")]
    Expired,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Signing key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("Auth configuration error: {0}")]
    Configuration(String),
}
