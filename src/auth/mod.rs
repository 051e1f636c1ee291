mod auth_service;
mod extract;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::config::JwtSettings;
use crate::error::{AppError, AppResult};
use crate::model::AuthContext;

pub use auth_service::{AuthService, role_codes};
pub use extract::RequestContext;

/// JWT Claims structure that will be encoded in the token
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: i32,
    /// Login handle at issue time
    pub username: String,
    /// Role codes assigned to the user
    pub roles: Vec<String>,
    /// Issued at timestamp
    pub iat: i64,
    /// Expiration timestamp
    pub exp: i64,
    /// Issuer
    pub iss: String,
}

/// Configuration for JWT tokens
pub struct JwtConfig {
    /// Secret key for signing tokens
    encoding_key: EncodingKey,
    /// Key for verifying token signatures
    decoding_key: DecodingKey,
    /// Token expiration time in seconds
    expiration: i64,
    /// Issuer claim value
    issuer: String,
}

impl JwtConfig {
    /// Initialize JWT configuration from loaded settings
    pub fn from_settings(settings: &JwtSettings) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(settings.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(settings.secret.as_bytes()),
            expiration: settings.expiration_seconds,
            issuer: settings.issuer.clone(),
        }
    }

    /// Generate a JWT token for a user
    pub fn generate_token(&self, auth_context: &AuthContext) -> AppResult<String> {
        let now = OffsetDateTime::now_utc();
        let expiration = now + Duration::seconds(self.expiration);

        let claims = Claims {
            sub: auth_context.user_id,
            username: auth_context.username.clone(),
            roles: auth_context.roles.clone(),
            iat: now.unix_timestamp(),
            exp: expiration.unix_timestamp(),
            iss: self.issuer.clone(),
        };

        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(format!("Failed to generate JWT token: {e}")))?;

        debug!("Generated JWT token for user_id: {}", auth_context.user_id);
        Ok(token)
    }

    /// Validate a JWT token and extract the claims
    pub fn validate_token(&self, token: &str) -> AppResult<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.issuer.as_str()]);

        let token_data = decode::<Claims>(token, &self.decoding_key, &validation)?;

        debug!("Validated JWT token for user_id: {}", token_data.claims.sub);
        Ok(token_data.claims)
    }

    /// Convert JWT claims to AuthContext
    pub fn claims_to_auth_context(claims: Claims) -> AuthContext {
        AuthContext {
            user_id: claims.sub,
            username: claims.username,
            roles: claims.roles,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(issuer: &str) -> JwtConfig {
        JwtConfig::from_settings(&JwtSettings {
            secret: "test_secret_key_for_jwt_token_testing".to_string(),
            expiration_seconds: 3600,
            issuer: issuer.to_string(),
        })
    }

    #[test]
    fn test_jwt_token_lifecycle() {
        let jwt_config = test_config("test_issuer");

        let auth_context = AuthContext {
            user_id: 123,
            username: "alice".to_string(),
            roles: vec!["admin".to_string(), "developer".to_string()],
        };

        let token = jwt_config.generate_token(&auth_context).unwrap();
        assert!(!token.is_empty());

        let claims = jwt_config.validate_token(&token).unwrap();
        assert_eq!(claims.sub, 123);
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.roles, vec!["admin", "developer"]);
        assert_eq!(claims.iss, "test_issuer");
        assert!(claims.exp > claims.iat);

        let decoded_context = JwtConfig::claims_to_auth_context(claims);
        assert_eq!(decoded_context, auth_context);
    }

    #[test]
    fn test_foreign_issuer_is_rejected() {
        let token = test_config("someone_else")
            .generate_token(&AuthContext {
                user_id: 1,
                username: "bob".to_string(),
                roles: vec![],
            })
            .unwrap();

        let err = test_config("test_issuer").validate_token(&token).unwrap_err();
        assert!(matches!(err, AppError::Unauthenticated(_)));
    }

    #[test]
    fn test_garbage_token_is_unauthenticated() {
        let err = test_config("test_issuer").validate_token("not.a.jwt").unwrap_err();
        assert!(matches!(err, AppError::Unauthenticated(_)));
    }
}
