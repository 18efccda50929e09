//! Authentication for usher
//!
//! Provides:
//! - JWT token generation and validation for bearer clients
//! - Server-side browser sessions carried by an HttpOnly cookie
//! - Password hashing with Argon2
//! - Identity resolution that collapses both channels into one type

pub mod identity;
pub mod jwt;
pub mod password;
pub mod session;

pub use identity::{resolve_identity, Identity};
pub use jwt::{extract_token_from_header, Claims, JwtValidator, TokenInput, TokenValidationResult};
pub use password::{hash_password, verify_password};
pub use session::{
    clear_session_cookie, session_cookie, session_id_from_request, SESSION_COOKIE,
};
