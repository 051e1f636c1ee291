use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use super::JwtConfig;
use crate::access::{PermissionSet, Viewer, effective_permissions, has_permission};
use crate::api::AppState;
use crate::error::{AppError, AppResult};
use crate::model::AuthContext;

/// Authenticated caller with a freshly resolved permission set
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub auth: AuthContext,
    pub permissions: PermissionSet,
}

impl RequestContext {
    pub fn user_id(&self) -> i32 {
        self.auth.user_id
    }

    pub fn is_admin(&self) -> bool {
        self.permissions.is_all()
    }

    pub fn viewer(&self) -> Viewer {
        Viewer {
            user_id: self.auth.user_id,
            is_admin: self.is_admin(),
        }
    }

    /// Fail with `Forbidden` unless the caller holds `code`
    pub fn require(&self, code: &str) -> AppResult<()> {
        if has_permission(&self.permissions, code) {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!("missing permission '{code}'")))
        }
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header
pub(crate) fn bearer_token(parts: &Parts) -> AppResult<&str> {
    let header = parts
        .headers
        .get(AUTHORIZATION)
        .ok_or_else(|| AppError::Unauthenticated("missing authorization header".to_string()))?;

    let value = header
        .to_str()
        .map_err(|_| AppError::Unauthenticated("malformed authorization header".to_string()))?;

    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AppError::Unauthenticated("expected a bearer token".to_string()))
}

#[async_trait]
impl FromRequestParts<AppState> for RequestContext {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let claims = state.jwt_config.validate_token(token)?;
        let auth = JwtConfig::claims_to_auth_context(claims);

        let mut conn = state.db_pool.acquire().await?;
        let permissions = effective_permissions(&mut conn, auth.user_id).await?;

        Ok(Self { auth, permissions })
    }
}
