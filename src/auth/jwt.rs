//! JWT token handling for the push-fabric handshake.
//!
//! The REST surface that issues these tokens (login, refresh) lives outside
//! this crate; here we only validate the bearer a client presents on
//! connect and mint tokens for tests/bootstrap tooling.

use crate::auth::models::Claims;
use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use tracing::debug;

pub struct JwtHandler {
    secret: String,
    expiration_hours: i64,
}

impl JwtHandler {
    pub fn new(secret: String) -> Self {
        Self {
            secret,
            expiration_hours: 24,
        }
    }

    /// Mint a token for `user_id`. Used by bootstrap tooling and tests;
    /// the real issuance path is the external auth REST surface.
    pub fn generate_token(&self, user_id: &str) -> Result<(String, usize)> {
        let now = Utc::now();
        let expiration = now
            .checked_add_signed(chrono::Duration::hours(self.expiration_hours))
            .context("invalid timestamp")?
            .timestamp() as usize;
        let expires_in = (self.expiration_hours * 3600) as usize;

        let claims = Claims {
            sub: user_id.to_string(),
            exp: expiration,
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .context("failed to generate JWT")?;

        Ok((token, expires_in))
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .context("invalid or expired token")?;

        debug!(user_id = %decoded.claims.sub, "validated push-fabric token");

        Ok(decoded.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_validates_a_token() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string());

        let (token, expires_in) = handler.generate_token("user-1").unwrap();
        assert!(!token.is_empty());
        assert_eq!(expires_in, 24 * 3600);

        let claims = handler.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "user-1");
    }

    #[test]
    fn rejects_garbage_tokens() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string());
        assert!(handler.validate_token("invalid.token.here").is_err());
    }

    #[test]
    fn rejects_tokens_signed_with_a_different_secret() {
        let handler1 = JwtHandler::new("secret1".to_string());
        let handler2 = JwtHandler::new("secret2".to_string());

        let (token, _) = handler1.generate_token("user-1").unwrap();
        assert!(handler2.validate_token(&token).is_err());
    }

    #[test]
    fn expiry_is_in_the_future_at_mint_time() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string());
        let (token, _) = handler.generate_token("user-1").unwrap();
        let claims = handler.validate_token(&token).unwrap();
        assert!(claims.exp > Utc::now().timestamp() as usize);
    }
}
