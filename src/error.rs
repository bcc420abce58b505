use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// The engine's error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// The referenced license, CEK or job does not exist.
    #[error("Resource not found")]
    NotFound,

    /// An active license or a CEK already exists for the binding.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The license is past its expiry and its grace period.
    #[error("License expired")]
    Expired,

    /// The license has been revoked. Terminal.
    #[error("License revoked")]
    Revoked,

    /// The presented nonce is not the license's current nonce.
    #[error("Stale license nonce")]
    StaleNonce,

    /// A state machine precondition did not hold.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Caller supplied an argument the engine cannot accept.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Wrapping or unwrapping key material failed.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// A database error.
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// The connection pool could not hand out a client.
    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// The connection pool could not be built.
    #[error("Pool creation error: {0}")]
    CreatePool(#[from] deadpool_postgres::CreatePoolError),

    /// An internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A `Result` type that uses `AppError` as the error type.
pub type Result<T> = std::result::Result<T, AppError>;

/// SQLSTATE for `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

impl AppError {
    /// Stable reason code, used in audit records.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Expired => "LICENSE_EXPIRED",
            AppError::Revoked => "LICENSE_REVOKED",
            AppError::StaleNonce => "INVALID_NONCE",
            AppError::InvalidTransition(_) => "INVALID_TRANSITION",
            AppError::Validation(_) => "INVALID_REQUEST",
            AppError::Encryption(_) => "ENCRYPTION_FAILED",
            AppError::Database(_) | AppError::Pool(_) | AppError::CreatePool(_) => "STORAGE_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this error is one of the license-validation denials that must
    /// look identical to an end user.
    pub fn is_access_denial(&self) -> bool {
        matches!(
            self,
            AppError::NotFound | AppError::Expired | AppError::Revoked | AppError::StaleNonce
        )
    }

    /// Maps a unique violation to `Conflict`, everything else to `Database`.
    pub fn from_insert(e: tokio_postgres::Error, what: &str) -> Self {
        match e.code() {
            Some(state) if state.code() == UNIQUE_VIOLATION => {
                AppError::Conflict(format!("{} already exists for this binding", what))
            }
            _ => AppError::Database(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::NotFound | AppError::Expired | AppError::Revoked | AppError::StaleNonce => {
                tracing::debug!(reason = self.code(), "Access denied");
                (StatusCode::FORBIDDEN, "access denied".to_string())
            }

            AppError::Conflict(ref msg) => {
                tracing::debug!("Conflict: {}", msg);
                (StatusCode::CONFLICT, msg.clone())
            }

            AppError::InvalidTransition(ref msg) => {
                tracing::debug!("Invalid transition: {}", msg);
                (StatusCode::CONFLICT, msg.clone())
            }

            AppError::Validation(ref msg) => {
                tracing::debug!("Validation error: {}", msg);
                (StatusCode::BAD_REQUEST, msg.clone())
            }

            AppError::Encryption(ref msg) => {
                tracing::error!("Encryption error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Encryption error".to_string())
            }

            AppError::Database(ref e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }

            AppError::Pool(ref e) => {
                tracing::error!("Pool error: {}", e);
                (StatusCode::SERVICE_UNAVAILABLE, "Database unavailable".to_string())
            }

            AppError::CreatePool(ref e) => {
                tracing::error!("Pool creation error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }

            AppError::Internal(ref msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = sonic_rs::to_string(&sonic_rs::json!({
            "error": message
        }))
        .unwrap_or_else(|_| r#"{"error":"Internal server error"}"#.to_string());

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denials_share_one_response() {
        for e in [AppError::NotFound, AppError::Expired, AppError::Revoked, AppError::StaleNonce] {
            assert!(e.is_access_denial());
            let response = e.into_response();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
        }
    }

    #[test]
    fn transitions_are_not_denials() {
        let e = AppError::InvalidTransition("job is pending".into());
        assert!(!e.is_access_denial());
        assert_eq!(e.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn reason_codes_are_distinct_internally() {
        assert_eq!(AppError::Expired.code(), "LICENSE_EXPIRED");
        assert_eq!(AppError::Revoked.code(), "LICENSE_REVOKED");
        assert_ne!(AppError::NotFound.code(), AppError::StaleNonce.code());
    }
}
