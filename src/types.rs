//! Error types for usher

use thiserror::Error;

/// Errors surfaced by the gateway.
///
/// Route handlers map these onto HTTP responses; the split between
/// `AuthenticationRequired` and `CredentialInvalid` is deliberate so clients
/// can distinguish "log in again" from "re-link your media server account".
#[derive(Debug, Error)]
pub enum UsherError {
    /// No valid session cookie or bearer token on the request
    #[error("Authentication required")]
    AuthenticationRequired,

    /// Stored upstream credential could not be decrypted or was rejected upstream
    #[error("Credential invalid: {0}")]
    CredentialInvalid(String),

    /// Upstream media server unreachable or failing; retryable
    #[error("Upstream unavailable: {0}")]
    Upstream(String),

    /// Authentication processing error (hashing, token generation)
    #[error("Authentication error: {0}")]
    Auth(String),

    /// MongoDB error
    #[error("Database error: {0}")]
    Database(String),

    /// HTTP-level error (bad body, oversized payload)
    #[error("HTTP error: {0}")]
    Http(String),

    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl UsherError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            UsherError::AuthenticationRequired => "AUTH_REQUIRED",
            UsherError::CredentialInvalid(_) => "CREDENTIAL_INVALID",
            UsherError::Upstream(_) => "UPSTREAM_UNAVAILABLE",
            UsherError::Auth(_) => "AUTH_ERROR",
            UsherError::Database(_) => "DB_ERROR",
            UsherError::Http(_) => "BAD_REQUEST",
            UsherError::Io(_) => "IO_ERROR",
            UsherError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, UsherError>;
