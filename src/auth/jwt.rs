//! JWT generation and validation for bearer clients
//!
//! Tokens are HS256, signed with the process secret, and carry everything a
//! request needs so no database trip happens on the bearer path. There is no
//! revocation list: tokens die by expiry, and compromise is handled by
//! rotating the process secret, which invalidates every outstanding token at
//! once.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::types::{Result, UsherError};

/// Claims embedded in a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user id
    pub sub: String,
    /// Login name, for logging and display
    pub username: String,
    /// Upstream account id, once the user has linked one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_id: Option<String>,
    /// Issued at (unix seconds)
    pub iat: u64,
    /// Expiry (unix seconds)
    pub exp: u64,
}

/// Input for token generation.
#[derive(Debug, Clone)]
pub struct TokenInput {
    pub user_id: String,
    pub username: String,
    pub upstream_id: Option<String>,
}

/// Result of token verification.
///
/// An expired token and a garbage token look the same to callers: `claims`
/// is None and the request is unauthenticated.
#[derive(Debug)]
pub struct TokenValidationResult {
    pub valid: bool,
    pub claims: Option<Claims>,
    pub error: Option<String>,
}

/// HS256 validator keyed by the process secret.
#[derive(Clone)]
pub struct JwtValidator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiry_seconds: u64,
}

impl JwtValidator {
    pub fn new(secret: &[u8], expiry_seconds: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            expiry_seconds,
        }
    }

    /// Generate a signed token for the given user.
    pub fn generate_token(&self, input: TokenInput) -> Result<String> {
        let now = Utc::now().timestamp() as u64;
        let claims = Claims {
            sub: input.user_id,
            username: input.username,
            upstream_id: input.upstream_id,
            iat: now,
            exp: now + self.expiry_seconds,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| UsherError::Auth(format!("Failed to generate token: {e}")))
    }

    /// Verify a token's signature and expiry.
    pub fn verify_token(&self, token: &str) -> TokenValidationResult {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        match decode::<Claims>(token, &self.decoding_key, &validation) {
            Ok(data) => TokenValidationResult {
                valid: true,
                claims: Some(data.claims),
                error: None,
            },
            Err(e) => TokenValidationResult {
                valid: false,
                claims: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub fn expiry_seconds(&self) -> u64 {
        self.expiry_seconds
    }
}

/// Extract the bearer token from an Authorization header value.
pub fn extract_token_from_header(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
