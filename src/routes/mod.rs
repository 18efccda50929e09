//! HTTP routes for usher

pub mod account;
pub mod auth_routes;
pub mod health;
pub mod media;

pub use account::handle_account_request;
pub use auth_routes::handle_auth_request;
pub use health::{cache_stats, health_check, readiness_check, version_info};
pub use media::handle_media_request;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::types::UsherError;

pub(crate) type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

// =============================================================================
// Shared Response Types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
    pub message: String,
}

// =============================================================================
// Response Helpers
// =============================================================================

pub(crate) fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<BoxBody> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, PUT, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type, Authorization")
        .body(full_body(json))
        .unwrap()
}

pub(crate) fn cors_preflight() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, PUT, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type, Authorization")
        .header("Access-Control-Max-Age", "86400")
        .body(empty_body())
        .unwrap()
}

pub(crate) fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Map a gateway error onto an HTTP response with a stable code.
///
/// The status split matters to clients: 401 means "log in to usher again",
/// 409 with CREDENTIAL_INVALID means "your media account link is dead,
/// re-link it", 502 means "try again later".
pub(crate) fn error_response(err: &UsherError) -> Response<BoxBody> {
    let status = match err {
        UsherError::AuthenticationRequired => StatusCode::UNAUTHORIZED,
        UsherError::CredentialInvalid(_) => StatusCode::CONFLICT,
        UsherError::Upstream(_) => StatusCode::BAD_GATEWAY,
        UsherError::Http(_) => StatusCode::BAD_REQUEST,
        UsherError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
        UsherError::Auth(_) | UsherError::Io(_) | UsherError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    json_response(
        status,
        &ErrorResponse {
            error: err.to_string(),
            code: Some(err.code().to_string()),
        },
    )
}

pub(crate) async fn parse_json_body<T: for<'de> Deserialize<'de>>(
    req: Request<hyper::body::Incoming>,
) -> Result<T, UsherError> {
    let body = req
        .collect()
        .await
        .map_err(|e| UsherError::Http(format!("Failed to read body: {}", e)))?;

    let bytes = body.to_bytes();
    if bytes.len() > 10240 {
        return Err(UsherError::Http("Request body too large".into()));
    }

    serde_json::from_slice(&bytes)
        .map_err(|e| UsherError::Http(format!("Invalid JSON: {}", e)))
}
