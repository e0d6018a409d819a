use thiserror::Error;
use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde::Serialize;

/// Machine-readable codes carried in every error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TokenMissing,
    TokenInvalid,
    TokenExpired,
    TokenMalformed,
    TokenStale,
    TokenReused,
    UserInvalid,
    RateLimitExceeded,
    CsrfTokenMissing,
    CsrfTokenLengthMismatch,
    CsrfTokenInvalid,
    InsufficientRole,
    AccountInactive,
    ConfigurationError,
    ValidationError,
    StorageError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::TokenMissing => "TOKEN_MISSING",
            ErrorCode::TokenInvalid => "TOKEN_INVALID",
            ErrorCode::TokenExpired => "TOKEN_EXPIRED",
            ErrorCode::TokenMalformed => "TOKEN_MALFORMED",
            ErrorCode::TokenStale => "TOKEN_STALE",
            ErrorCode::TokenReused => "TOKEN_REUSED",
            ErrorCode::UserInvalid => "USER_INVALID",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::CsrfTokenMissing => "CSRF_TOKEN_MISSING",
            ErrorCode::CsrfTokenLengthMismatch => "CSRF_TOKEN_LENGTH_MISMATCH",
            ErrorCode::CsrfTokenInvalid => "CSRF_TOKEN_INVALID",
            ErrorCode::InsufficientRole => "INSUFFICIENT_ROLE",
            ErrorCode::AccountInactive => "ACCOUNT_INACTIVE",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::StorageError => "STORAGE_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Client-facing message for the code.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::TokenMissing => "Authentication token required",
            ErrorCode::TokenInvalid => "Invalid token",
            ErrorCode::TokenExpired => "Token has expired",
            ErrorCode::TokenMalformed => "Malformed token",
            ErrorCode::TokenStale => "Token no longer matches account, please log in again",
            ErrorCode::TokenReused => "Refresh token reuse detected, session revoked",
            ErrorCode::UserInvalid => "User not found or inactive",
            ErrorCode::RateLimitExceeded => "Too many requests, please try again later",
            ErrorCode::CsrfTokenMissing => "CSRF token required",
            ErrorCode::CsrfTokenLengthMismatch => "Invalid CSRF token",
            ErrorCode::CsrfTokenInvalid => "Invalid CSRF token",
            ErrorCode::InsufficientRole => "Insufficient permissions",
            ErrorCode::AccountInactive => "Account is inactive",
            ErrorCode::ConfigurationError => "Server configuration error",
            ErrorCode::ValidationError => "Invalid request",
            ErrorCode::StorageError => "Database error occurred",
            ErrorCode::InternalError => "Internal server error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire shape of every error response: `{ "error": ..., "code": ... }`.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub code: ErrorCode,
}

impl ErrorEnvelope {
    pub fn new(code: ErrorCode) -> Self {
        Self { error: code.message().to_string(), code }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Authentication error: {0}")]
    Auth(ErrorCode),

    #[error("Forbidden: {0}")]
    Forbidden(ErrorCode),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Database error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Bcrypt error: {0}")]
    PasswordHash(#[from] bcrypt::BcryptError),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Configuration(_) => ErrorCode::ConfigurationError,
            AppError::Auth(code) | AppError::Forbidden(code) => *code,
            AppError::Validation(_) => ErrorCode::ValidationError,
            AppError::RateLimited => ErrorCode::RateLimitExceeded,
            AppError::Storage(_) => ErrorCode::StorageError,
            AppError::PasswordHash(_) | AppError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Configuration(_)
            | AppError::Storage(_)
            | AppError::PasswordHash(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let envelope = match self {
            // Validation messages describe the caller's own input and are safe to echo.
            AppError::Validation(msg) => ErrorEnvelope {
                error: msg.clone(),
                code: ErrorCode::ValidationError,
            },
            _ => ErrorEnvelope::new(self.code()),
        };

        HttpResponse::build(self.status_code()).json(envelope)
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[actix_rt::test]
    async fn test_storage_error_is_sanitized() {
        let err = AppError::Storage(sqlx::Error::Protocol("relation refresh_tokens is locked".into()));
        let resp = err.error_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = to_bytes(resp.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "STORAGE_ERROR");
        assert_eq!(json["error"], "Database error occurred");
        assert!(!String::from_utf8_lossy(&body).contains("refresh_tokens"));
    }

    #[actix_rt::test]
    async fn test_csrf_failure_envelope() {
        let resp = AppError::Forbidden(ErrorCode::CsrfTokenMissing).error_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let body = to_bytes(resp.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "CSRF_TOKEN_MISSING");
        assert_eq!(json["error"], "CSRF token required");
    }

    #[test]
    fn test_code_serialization_matches_as_str() {
        for code in [
            ErrorCode::TokenReused,
            ErrorCode::CsrfTokenLengthMismatch,
            ErrorCode::RateLimitExceeded,
            ErrorCode::AccountInactive,
        ] {
            let json = serde_json::to_value(code).unwrap();
            assert_eq!(json, code.as_str());
        }
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::Auth(ErrorCode::TokenReused).status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::RateLimited.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            AppError::Configuration("JWT_SECRET not set".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(AppError::Validation("bad".into()).status_code(), StatusCode::BAD_REQUEST);
    }
}
