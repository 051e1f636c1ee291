use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub type AppResult<T> = Result<T, AppError>;

/// Domain error taxonomy shared by every subsystem
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    QuotaExceeded(String),

    #[error("{0}")]
    Dependency(String),

    #[error("upstream provider error: {0}")]
    Upstream(String),

    #[error("{0}")]
    Expired(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn not_found(what: &str) -> Self {
        Self::NotFound(format!("{what} not found"))
    }

    pub fn forbidden() -> Self {
        Self::Forbidden("permission denied".to_string())
    }

    /// Integer code carried in the response envelope
    pub const fn code(&self) -> i32 {
        match self {
            Self::Unauthenticated(_) => 40100,
            Self::Forbidden(_) => 40300,
            Self::NotFound(_) => 40400,
            Self::InvalidArgument(_) => 40000,
            Self::Conflict(_) => 40900,
            Self::QuotaExceeded(_) => 42900,
            Self::Dependency(_) => 42300,
            Self::Upstream(_) => 50200,
            Self::Expired(_) => 41000,
            Self::Internal(_) => 50000,
        }
    }

    /// Transport status. Only the pre-handler classes leave 200.
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::OK,
        }
    }

    /// Message safe to show a client
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("record not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::Conflict(format!("duplicate record: {}", db_err.message()))
            }
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::Dependency(format!("record is still referenced: {}", db_err.message()))
            }
            other => Self::Internal(format!("database error: {other}")),
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Unauthenticated(format!("invalid token: {err}"))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<minijinja::Error> for AppError {
    fn from(err: minijinja::Error) -> Self {
        Self::Internal(format!("template error: {err}"))
    }
}

/// Uniform `{code, message, data}` response envelope
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub code: i32,
    pub message: String,
    pub data: Option<T>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: 0,
            message: "success".to_string(),
            data: Some(data),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Self::Internal(detail) = &self {
            error!("Request failed: {}", detail);
        }

        let status = self.status_code();
        let body = Envelope::<()> {
            code: self.code(),
            message: self.public_message(),
            data: None,
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::Unauthenticated("x".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(AppError::forbidden().status_code(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::not_found("task").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::QuotaExceeded("x".into()).status_code(),
            StatusCode::OK
        );
        assert_eq!(AppError::Conflict("x".into()).status_code(), StatusCode::OK);
    }

    #[test]
    fn test_internal_message_is_generic() {
        let err = AppError::Internal("connection reset by peer".into());
        assert_eq!(err.public_message(), "internal server error");
        assert_eq!(err.code(), 50000);

        let err = AppError::QuotaExceeded("daily hours would reach 25".into());
        assert_eq!(err.public_message(), "daily hours would reach 25");
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: AppError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
