//! Request-level error type shared by the service modules.
//!
//! Service functions return [`ServiceResult`]; the HTTP layer maps each
//! variant onto a status code and a machine-readable error code (see
//! `server.rs`). Infrastructure failures (SQLite, filesystem) are wrapped
//! in [`ServiceError::Internal`] via `?`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    /// An AI provider or remote download failed.
    #[error("{0}")]
    Upstream(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<sqlx::Error> for ServiceError {
    fn from(e: sqlx::Error) -> Self {
        ServiceError::Internal(e.into())
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(e: std::io::Error) -> Self {
        ServiceError::Internal(e.into())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        ServiceError::Internal(e.into())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

pub fn bad_request(message: impl Into<String>) -> ServiceError {
    ServiceError::BadRequest(message.into())
}

pub fn not_found(message: impl Into<String>) -> ServiceError {
    ServiceError::NotFound(message.into())
}

/// Map a UNIQUE constraint failure to `Conflict(message)`; anything else
/// stays internal.
pub fn conflict_on_unique(e: sqlx::Error, message: &str) -> ServiceError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            ServiceError::Conflict(message.to_string())
        }
        _ => e.into(),
    }
}
