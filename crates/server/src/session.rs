use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::domain::{Identity, UserId};
use storage::Storage;
use tracing::warn;

use crate::gate::SessionValidator;

pub const SESSION_COOKIE: &str = "session";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub secret: String,
    pub ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    name: String,
    iat: i64,
    exp: i64,
}

pub fn mint_session_token(
    cfg: &SessionConfig,
    identity: &Identity,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let exp = now + Duration::seconds(cfg.ttl_seconds);
    let claims = Claims {
        sub: format!("user:{}", identity.user_id.0),
        name: identity.name.clone(),
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.secret.as_bytes()),
    )
}

/// Returns the user id carried by a well-signed, unexpired token.
pub fn decode_session_token(cfg: &SessionConfig, token: &str) -> Option<UserId> {
    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(cfg.secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;
    decoded
        .claims
        .sub
        .strip_prefix("user:")
        .and_then(|id| id.parse::<i64>().ok())
        .map(UserId)
}

/// The `session` cookie wins over an `Authorization: Bearer` header.
pub fn extract_credential(headers: &HeaderMap) -> Option<String> {
    let from_cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty());
    if from_cookie.is_some() {
        return from_cookie;
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

pub fn session_cookie(token: &str, ttl_seconds: i64) -> String {
    format!("{SESSION_COOKIE}={token}; HttpOnly; Path=/; SameSite=Lax; Max-Age={ttl_seconds}")
}

/// Validates JWT session credentials and confirms the subject still exists.
#[derive(Clone)]
pub struct JwtSessionValidator {
    config: SessionConfig,
    storage: Storage,
}

impl JwtSessionValidator {
    pub fn new(config: SessionConfig, storage: Storage) -> Self {
        Self { config, storage }
    }
}

#[async_trait]
impl SessionValidator for JwtSessionValidator {
    async fn validate(&self, headers: &HeaderMap) -> Option<Identity> {
        let token = extract_credential(headers)?;
        let user_id = decode_session_token(&self.config, &token)?;
        match self.storage.find_user(user_id).await {
            Ok(Some(user)) => Some(Identity {
                user_id: user.user_id,
                name: user.username,
            }),
            Ok(None) => None,
            Err(error) => {
                warn!(user_id = user_id.0, %error, "session lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
