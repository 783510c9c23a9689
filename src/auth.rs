//! Token validation for the websocket auth handshake.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    pub fn new(user_id: Uuid, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: user_id.to_string(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        }
    }

    pub fn user_id(&self) -> Result<Uuid> {
        self.sub
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid user ID in token: {}", e))
    }
}

/// The identity a validated token grants a connection.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext {
    pub user_id: Uuid,
}

/// Auth collaborator consumed by the connection's `auth` handler.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<AuthContext>;
}

pub type DynTokenValidator = Arc<dyn TokenValidator>;

/// HS256 JWT validation.
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_ref()),
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
        }
    }

    pub fn generate_token(&self, user_id: Uuid) -> Result<String> {
        let claims = Claims::new(user_id, Duration::days(7));
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to generate token: {}", e))
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| anyhow::anyhow!("Failed to verify token: {}", e))
    }
}

#[async_trait]
impl TokenValidator for JwtService {
    async fn validate(&self, token: &str) -> Result<AuthContext> {
        let claims = self.verify_token(token)?;
        Ok(AuthContext {
            user_id: claims.user_id()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_token() {
        let service = JwtService::new("test-secret");
        let user_id = Uuid::new_v4();
        let token = service.generate_token(user_id).unwrap();
        let ctx = service.validate(&token).await.unwrap();
        assert_eq!(ctx.user_id, user_id);
    }

    #[tokio::test]
    async fn wrong_secret_rejected() {
        let service = JwtService::new("secret-a");
        let token = service.generate_token(Uuid::new_v4()).unwrap();
        let other = JwtService::new("secret-b");
        assert!(other.validate(&token).await.is_err());
    }

    #[tokio::test]
    async fn garbage_token_rejected() {
        let service = JwtService::new("secret");
        assert!(service.validate("not-a-jwt").await.is_err());
    }
}
