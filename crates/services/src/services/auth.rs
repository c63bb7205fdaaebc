use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utils::text::random_suffix;
use uuid::Uuid;

use super::config::AuthConfig;

const EPHEMERAL_SECRET_LEN: usize = 48;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,
    #[error("Invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
}

/// HS256 bearer tokens whose subject is the user id.
#[derive(Clone)]
pub struct AuthService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    token_ttl_secs: u64,
}

impl AuthService {
    pub fn new(secret: &str, token_ttl_secs: u64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            token_ttl_secs,
        }
    }

    /// Reads the secret from the configured environment variable. Without one,
    /// tokens are signed with a per-process secret and do not survive restarts.
    pub fn from_config(config: &AuthConfig) -> Self {
        match std::env::var(&config.jwt_secret_env) {
            Ok(secret) if !secret.trim().is_empty() => Self::new(&secret, config.token_ttl_secs),
            _ => {
                tracing::warn!(
                    "{} is not set, signing tokens with an ephemeral secret",
                    config.jwt_secret_env
                );
                Self::new(&random_suffix(EPHEMERAL_SECRET_LEN), config.token_ttl_secs)
            }
        }
    }

    pub fn issue(&self, user_id: Uuid) -> Result<String, AuthError> {
        let exp = Utc::now().timestamp().max(0) as u64 + self.token_ttl_secs;
        let claims = Claims {
            sub: user_id,
            exp: exp as usize,
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    pub fn verify(&self, token: &str) -> Result<Uuid, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))?;
        Ok(data.claims.sub)
    }

    /// Accepts `Bearer <token>` with a case-insensitive scheme.
    pub fn verify_bearer(&self, header: Option<&str>) -> Result<Uuid, AuthError> {
        let token = header
            .and_then(|value| value.split_once(' '))
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
            .map(|(_, token)| token.trim())
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingToken)?;
        self.verify(token)
    }
}
