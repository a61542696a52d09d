use crate::model::Identity;
use anyhow::Result;
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// WebSocket close code for a missing or unverifiable credential.
pub const CLOSE_INVALID_CREDENTIAL: u16 = 4001;
/// WebSocket close code for a well-formed but expired credential.
pub const CLOSE_EXPIRED_CREDENTIAL: u16 = 4002;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,
    #[error("credential expired")]
    Expired,
    #[error("invalid credential")]
    Invalid,
}

impl AuthError {
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Expired => CLOSE_EXPIRED_CREDENTIAL,
            Self::Missing | Self::Invalid => CLOSE_INVALID_CREDENTIAL,
        }
    }
}

/// Turns an opaque bearer credential into an identity.
pub trait AuthResolver: Send + Sync + 'static {
    fn resolve(&self, credential: &str) -> Result<Identity, AuthError>;
}

/// Claims stored within issued JWTs.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub exp: usize,
}

/// Issue an HS256 JWT for `sub`. Used by the `mint-token` command and tests;
/// production tokens come from the platform's identity service.
pub fn issue_jwt(secret: &[u8], sub: &str, name: Option<&str>, valid_for: Duration) -> Result<String> {
    let exp = (OffsetDateTime::now_utc() + valid_for).unix_timestamp().max(0) as usize;
    let claims = Claims {
        sub: sub.into(),
        name: name.map(str::to_string),
        exp,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )?;
    Ok(token)
}

/// Verify a JWT and return its claims if valid.
pub fn verify_jwt(secret: &[u8], token: &str) -> Result<Claims, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.leeway = 0;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::Invalid,
        })?;
    if data.claims.exp < OffsetDateTime::now_utc().unix_timestamp() as usize {
        return Err(AuthError::Expired);
    }
    if data.claims.sub.trim().is_empty() {
        return Err(AuthError::Invalid);
    }
    Ok(data.claims)
}

/// Resolves HS256 bearer tokens signed with a shared secret.
pub struct JwtResolver {
    secret: Vec<u8>,
}

impl JwtResolver {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl AuthResolver for JwtResolver {
    fn resolve(&self, credential: &str) -> Result<Identity, AuthError> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(AuthError::Missing);
        }
        let claims = verify_jwt(&self.secret, credential)?;
        let display_name = claims.name.unwrap_or_else(|| claims.sub.clone());
        Ok(Identity {
            user_id: claims.sub,
            display_name,
        })
    }
}
