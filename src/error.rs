use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-level error taxonomy.
///
/// Subsystems keep their own typed errors (`FetchError`, `VaultError`, …);
/// this enum is what crosses the HTTP boundary. The conversion rules live
/// here so handlers can simply `?` their way up.
#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed request parameter or body
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Entity does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// State conflict (e.g. duplicate feed URL)
    #[error("conflict: {0}")]
    Conflict(String),
    /// Operation is feature-gated and the gate is closed
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Remote service or network failure
    #[error("upstream error: {0}")]
    Upstream(String),
    /// Response or feed payload could not be decoded
    #[error("decode error: {0}")]
    Decode(String),
    /// Ciphertext problems (bad blob, wrong machine)
    #[error("crypto error: {0}")]
    Crypto(String),
    /// Retention/cleanup conflict
    #[error("retention error: {0}")]
    Retention(String),
    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) | AppError::Decode(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Upstream(_)
            | AppError::Crypto(_)
            | AppError::Retention(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        // Short plain-text body; the UI shows its own friendly message
        (status, self.to_string()).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound("row not found".to_owned()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Upstream(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::InvalidInput("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Forbidden("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(AppError::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(
            AppError::Upstream("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_sqlx_row_not_found_maps_to_not_found() {
        let err: AppError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
