use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use sqlx::{PgConnection, PgPool};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::JwtConfig;
use crate::error::{AppError, AppResult};
use crate::model::{AuthContext, Session, User, UserProfile};

const MIN_PASSWORD_LEN: usize = 6;

/// Role codes of a user's enabled, live roles
pub async fn role_codes(conn: &mut PgConnection, user_id: i32) -> AppResult<Vec<String>> {
    let codes = sqlx::query_scalar::<_, String>(
        "SELECT r.code FROM roles r
         JOIN user_roles ur ON ur.role_id = r.id
         WHERE ur.user_id = $1 AND r.status = 1 AND r.deleted_at IS NULL
         ORDER BY r.code",
    )
    .bind(user_id)
    .fetch_all(conn)
    .await?;

    Ok(codes)
}

/// Authentication service for password login and session minting
#[derive(Clone)]
pub struct AuthService {
    /// Database connection pool
    db_pool: PgPool,
    /// JWT configuration
    jwt_config: Arc<JwtConfig>,
}

impl AuthService {
    /// Create a new authentication service
    pub fn new(db_pool: PgPool, jwt_config: Arc<JwtConfig>) -> Self {
        Self { db_pool, jwt_config }
    }

    /// Hash a password using Argon2
    pub fn hash_password(password: &str) -> AppResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        let password_hash = argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AppError::Internal(format!("Password hashing error: {e}")))?
            .to_string();
        Ok(password_hash)
    }

    /// Verify a password against a hash using Argon2
    pub fn verify_password(password: &str, password_hash: &str) -> AppResult<bool> {
        let parsed_hash = PasswordHash::new(password_hash)
            .map_err(|e| AppError::Internal(format!("Password hash parsing error: {e}")))?;
        let result = Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok();
        Ok(result)
    }

    /// Record a login and mint a session token for `user`.
    /// Runs on the caller's connection so it can share a transaction.
    pub async fn issue_session(&self, conn: &mut PgConnection, user: &User) -> AppResult<Session> {
        sqlx::query("UPDATE users SET login_count = login_count + 1, updated_at = now() WHERE id = $1")
            .bind(user.id)
            .execute(&mut *conn)
            .await?;

        let roles = role_codes(conn, user.id).await?;

        let auth_context = AuthContext {
            user_id: user.id,
            username: user.username.clone(),
            roles: roles.clone(),
        };
        let token = self.jwt_config.generate_token(&auth_context)?;

        debug!("Session issued for user_id: {}", user.id);
        Ok(Session {
            token,
            user: UserProfile::from_user(user, roles),
        })
    }

    /// Authenticate a user with username and password
    pub async fn authenticate(&self, username: &str, password: &str) -> AppResult<Session> {
        let invalid = || AppError::Unauthenticated("invalid username or password".to_string());

        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE username = $1 AND deleted_at IS NULL",
        )
        .bind(username)
        .fetch_optional(&self.db_pool)
        .await?
        .ok_or_else(invalid)?;

        if user.password_hash.is_empty() || !Self::verify_password(password, &user.password_hash)? {
            warn!("Password verification failed for user: {}", username);
            return Err(invalid());
        }

        if !user.is_enabled() {
            return Err(AppError::Forbidden("account is disabled".to_string()));
        }

        let mut conn = self.db_pool.acquire().await?;
        let session = self.issue_session(&mut conn, &user).await?;

        info!("User authenticated successfully: {}", username);
        Ok(session)
    }

    /// Replace a user's password, verifying the old one when a password is already set
    pub async fn change_password(&self, user_id: i32, old_password: &str, new_password: &str) -> AppResult<()> {
        if new_password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AppError::InvalidArgument(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }

        let current_hash: String = sqlx::query_scalar(
            "SELECT password_hash FROM users WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .fetch_optional(&self.db_pool)
        .await?
        .ok_or_else(|| AppError::not_found("user"))?;

        if !current_hash.is_empty() && !Self::verify_password(old_password, &current_hash)? {
            return Err(AppError::InvalidArgument("old password is incorrect".to_string()));
        }

        let new_hash = Self::hash_password(new_password)?;
        sqlx::query("UPDATE users SET password_hash = $1, updated_at = now() WHERE id = $2")
            .bind(new_hash)
            .bind(user_id)
            .execute(&self.db_pool)
            .await?;

        info!("Password changed for user_id: {}", user_id);
        Ok(())
    }

    /// Profile and role codes of a live user
    pub async fn profile(&self, user_id: i32) -> AppResult<UserProfile> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1 AND deleted_at IS NULL")
            .bind(user_id)
            .fetch_optional(&self.db_pool)
            .await?
            .ok_or_else(|| AppError::not_found("user"))?;

        let mut conn = self.db_pool.acquire().await?;
        let roles = role_codes(&mut conn, user.id).await?;
        Ok(UserProfile::from_user(&user, roles))
    }
}
