//! HTTP Routes for Authentication
//!
//! REST endpoints for gateway accounts:
//! - POST /auth/register - Create an account; starts a session and returns a JWT
//! - POST /auth/login    - Authenticate; starts a session and returns a JWT
//! - POST /auth/logout   - Retire the current session and clear the cookie
//! - POST /auth/refresh  - Re-issue a JWT for a still-valid identity
//! - GET  /auth/me       - Current user info
//! - GET  /auth/sessions - The caller's active sessions
//!
//! Every successful register/login answers on both channels at once: the
//! session cookie for browsers and the bearer token for native clients.

use bson::doc;
use hyper::header::{HeaderValue, SET_COOKIE};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::session::{create_session, delete_session};
use crate::auth::{
    clear_session_cookie, hash_password, resolve_identity, session_cookie,
    session_id_from_request, verify_password, TokenInput,
};
use crate::db::schemas::{SessionDoc, UserDoc, SESSION_COLLECTION, USER_COLLECTION};
use crate::db::MongoClient;
use crate::routes::{
    cors_preflight, error_response, json_response, parse_json_body, BoxBody, ErrorResponse,
    SuccessResponse,
};
use crate::server::AppState;
use crate::types::Result;

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    /// Display name; defaults to the username when omitted
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub token: String,
    pub user_id: String,
    pub username: String,
    pub display_name: String,
    /// Token expiry, seconds since the Unix epoch
    pub expires_at: u64,
    pub subscriber: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub user_id: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_account_id: Option<String>,
    /// How this request authenticated: "session" or "bearer"
    pub channel: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// First characters of the session id. Enough to correlate with logs,
    /// useless to replay.
    pub session_id: String,
    pub issued_at: String,
    pub expires_at: String,
    /// True for the session that made this request
    pub current: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListResponse {
    pub sessions: Vec<SessionInfo>,
}

// =============================================================================
// Route Handlers
// =============================================================================

/// POST /auth/register
///
/// Create gateway credentials and log the caller straight in.
///
/// Flow:
/// 1. Validate required fields and password length
/// 2. Check the username is free
/// 3. Hash the password with argon2
/// 4. Insert the user row
/// 5. Start a session; answer with cookie + JWT
async fn handle_register(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> Response<BoxBody> {
    let body: RegisterRequest = match parse_json_body(req).await {
        Ok(b) => b,
        Err(e) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                &ErrorResponse {
                    error: format!("Invalid JSON body: {}", e),
                    code: None,
                },
            )
        }
    };

    if body.username.is_empty() || body.password.is_empty() {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ErrorResponse {
                error: "Missing required fields: username, password".into(),
                code: None,
            },
        );
    }

    // Validate password strength (minimum 8 characters)
    if body.password.len() < 8 {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ErrorResponse {
                error: "Password must be at least 8 characters".into(),
                code: Some("WEAK_PASSWORD".into()),
            },
        );
    }

    let display_name = if body.display_name.is_empty() {
        body.username.clone()
    } else {
        body.display_name.clone()
    };

    let mongo = match &state.mongo {
        Some(m) => m,
        None => {
            return json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &ErrorResponse {
                    error: "Database not available".into(),
                    code: Some("DB_UNAVAILABLE".into()),
                },
            )
        }
    };

    let users = match mongo.collection::<UserDoc>(USER_COLLECTION).await {
        Ok(c) => c,
        Err(e) => return error_response(&e),
    };

    // Check if the username is taken
    match users.find_one(doc! { "username": &body.username }).await {
        Ok(Some(_)) => {
            return json_response(
                StatusCode::CONFLICT,
                &ErrorResponse {
                    error: "An account with this username already exists".into(),
                    code: Some("USER_EXISTS".into()),
                },
            )
        }
        Ok(None) => {}
        Err(e) => return error_response(&e),
    }

    let password_hash = match hash_password(&body.password) {
        Ok(h) => h,
        Err(e) => return error_response(&e),
    };

    let user = UserDoc::new(body.username.clone(), display_name, Some(password_hash));

    if let Err(e) = users.insert_one(user.clone()).await {
        // The unique index wins races the find_one check loses
        let error_str = e.to_string();
        if error_str.contains("duplicate key") || error_str.contains("E11000") {
            return json_response(
                StatusCode::CONFLICT,
                &ErrorResponse {
                    error: "An account with this username already exists".into(),
                    code: Some("USER_EXISTS".into()),
                },
            );
        }
        return error_response(&e);
    }

    let session_id = match start_session(&state, mongo, &user.user_id).await {
        Ok(s) => s,
        Err(e) => return error_response(&e),
    };

    info!("Registered new user: {}", body.username);

    auth_success_response(&state, &user, Some(&session_id), StatusCode::CREATED)
}

/// POST /auth/login
///
/// Authenticate with username and password.
///
/// Every failure path answers the same "Invalid credentials" so callers
/// cannot probe which usernames exist.
async fn handle_login(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> Response<BoxBody> {
    let body: LoginRequest = match parse_json_body(req).await {
        Ok(b) => b,
        Err(e) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                &ErrorResponse {
                    error: format!("Invalid JSON body: {}", e),
                    code: None,
                },
            )
        }
    };

    if body.username.is_empty() || body.password.is_empty() {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ErrorResponse {
                error: "Missing required fields: username, password".into(),
                code: None,
            },
        );
    }

    let mongo = match &state.mongo {
        Some(m) => m,
        None => {
            return json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &ErrorResponse {
                    error: "Database not available".into(),
                    code: Some("DB_UNAVAILABLE".into()),
                },
            )
        }
    };

    let users = match mongo.collection::<UserDoc>(USER_COLLECTION).await {
        Ok(c) => c,
        Err(e) => return error_response(&e),
    };

    let user = match users
        .find_one(doc! { "username": &body.username, "is_active": true })
        .await
    {
        Ok(Some(u)) => u,
        Ok(None) => {
            warn!("Login failed - user not found: {}", body.username);
            return invalid_credentials();
        }
        Err(e) => return error_response(&e),
    };

    // Accounts linked through the upstream service may have no local password
    let Some(password_hash) = user.password_hash.as_deref() else {
        warn!("Login failed - no local password: {}", body.username);
        return invalid_credentials();
    };

    let password_valid = match verify_password(&body.password, password_hash) {
        Ok(valid) => valid,
        Err(e) => {
            warn!("Password verification error: {}", e);
            return json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &ErrorResponse {
                    error: "Authentication error".into(),
                    code: Some("AUTH_ERROR".into()),
                },
            );
        }
    };

    if !password_valid {
        warn!("Login failed - invalid password: {}", body.username);
        return invalid_credentials();
    }

    let session_id = match start_session(&state, mongo, &user.user_id).await {
        Ok(s) => s,
        Err(e) => return error_response(&e),
    };

    info!("Login successful: {}", body.username);

    auth_success_response(&state, &user, Some(&session_id), StatusCode::OK)
}

/// POST /auth/logout
///
/// Retire the caller's session row and clear the cookie. Succeeds even when
/// there is no session to retire, so a stale client can always reset itself.
/// Bearer tokens cannot be revoked; they simply expire.
async fn handle_logout(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> Response<BoxBody> {
    if let Some(session_id) = session_id_from_request(&req) {
        if let Some(mongo) = &state.mongo {
            match mongo.collection::<SessionDoc>(SESSION_COLLECTION).await {
                Ok(sessions) => {
                    if let Err(e) = delete_session(&sessions, &session_id).await {
                        warn!("Session delete failed during logout: {}", e);
                    }
                }
                Err(e) => warn!("Sessions collection unavailable during logout: {}", e),
            }
        }
    }

    let mut response = json_response(
        StatusCode::OK,
        &SuccessResponse {
            success: true,
            message: "Logged out successfully".into(),
        },
    );
    let cookie = clear_session_cookie(state.args.cookie_samesite(), state.args.https_fronted);
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response.headers_mut().insert(SET_COOKIE, value);
    }

    response
}

/// POST /auth/refresh
///
/// Re-issue a bearer token for a valid identity (either channel). The user
/// row is re-checked so a deactivated account cannot keep minting tokens.
async fn handle_refresh(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> Response<BoxBody> {
    let identity = match resolve_identity(&req, &state).await {
        Ok(i) => i,
        Err(e) => return error_response(&e),
    };

    let mongo = match &state.mongo {
        Some(m) => m,
        None => {
            return json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &ErrorResponse {
                    error: "Database not available".into(),
                    code: Some("DB_UNAVAILABLE".into()),
                },
            )
        }
    };

    let users = match mongo.collection::<UserDoc>(USER_COLLECTION).await {
        Ok(c) => c,
        Err(e) => return error_response(&e),
    };

    let user = match users
        .find_one(doc! { "user_id": identity.user_id(), "is_active": true })
        .await
    {
        Ok(Some(u)) => u,
        Ok(None) => {
            warn!("Refresh rejected - account gone or inactive: {}", identity.user_id());
            return error_response(&crate::types::UsherError::AuthenticationRequired);
        }
        Err(e) => return error_response(&e),
    };

    auth_success_response(&state, &user, None, StatusCode::OK)
}

/// GET /auth/me
///
/// Identity info for the caller, from whichever channel authenticated them.
async fn handle_me(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> Response<BoxBody> {
    let identity = match resolve_identity(&req, &state).await {
        Ok(i) => i,
        Err(e) => return error_response(&e),
    };

    json_response(
        StatusCode::OK,
        &MeResponse {
            user_id: identity.user_id().to_string(),
            username: identity.username().to_string(),
            upstream_account_id: identity.upstream_account_id().map(str::to_string),
            channel: identity.channel(),
        },
    )
}

/// GET /auth/sessions
///
/// List the caller's live sessions so they can spot a browser they forgot
/// to log out of. Ids are truncated; the full value never leaves the server.
async fn handle_sessions(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> Response<BoxBody> {
    let identity = match resolve_identity(&req, &state).await {
        Ok(i) => i,
        Err(e) => return error_response(&e),
    };

    let mongo = match &state.mongo {
        Some(m) => m,
        None => {
            return json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &ErrorResponse {
                    error: "Database not available".into(),
                    code: Some("DB_UNAVAILABLE".into()),
                },
            )
        }
    };

    let sessions = match mongo.collection::<SessionDoc>(SESSION_COLLECTION).await {
        Ok(c) => c,
        Err(e) => return error_response(&e),
    };

    let rows = match sessions
        .find_many(doc! { "user_id": identity.user_id() })
        .await
    {
        Ok(rows) => rows,
        Err(e) => return error_response(&e),
    };

    let current_id = identity.session_id();
    let sessions: Vec<SessionInfo> = rows
        .into_iter()
        .filter(|s| s.is_valid())
        .map(|s| SessionInfo {
            session_id: short_session_id(&s.session_id).to_string(),
            issued_at: s.issued_at.to_rfc3339(),
            expires_at: s.expires_at.to_rfc3339(),
            current: current_id == Some(s.session_id.as_str()),
        })
        .collect();

    json_response(StatusCode::OK, &SessionListResponse { sessions })
}

// =============================================================================
// Helper Functions
// =============================================================================

async fn start_session(state: &AppState, mongo: &MongoClient, user_id: &str) -> Result<String> {
    let sessions = mongo.collection::<SessionDoc>(SESSION_COLLECTION).await?;
    create_session(&sessions, user_id, state.args.session_ttl()).await
}

fn invalid_credentials() -> Response<BoxBody> {
    json_response(
        StatusCode::UNAUTHORIZED,
        &ErrorResponse {
            error: "Invalid credentials".into(),
            code: Some("INVALID_CREDENTIALS".into()),
        },
    )
}

fn short_session_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Answer a successful register/login/refresh on both channels: JWT in the
/// body, session cookie in the headers when a session was started.
fn auth_success_response(
    state: &AppState,
    user: &UserDoc,
    session_id: Option<&str>,
    status: StatusCode,
) -> Response<BoxBody> {
    let input = TokenInput {
        user_id: user.user_id.clone(),
        username: user.username.clone(),
        upstream_id: user.upstream_account_id.clone(),
    };

    let token = match state.jwt.generate_token(input) {
        Ok(t) => t,
        Err(e) => {
            return json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &ErrorResponse {
                    error: format!("Failed to generate token: {}", e),
                    code: Some("TOKEN_ERROR".into()),
                },
            )
        }
    };

    let expires_at = state
        .jwt
        .verify_token(&token)
        .claims
        .map(|c| c.exp)
        .unwrap_or(0);

    let mut response = json_response(
        status,
        &AuthResponse {
            token,
            user_id: user.user_id.clone(),
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            expires_at,
            subscriber: user.is_subscriber,
        },
    );

    if let Some(session_id) = session_id {
        let cookie = session_cookie(
            session_id,
            state.args.cookie_samesite(),
            state.args.https_fronted,
            state.args.session_ttl_days,
        );
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                response.headers_mut().insert(SET_COOKIE, value);
            }
            Err(e) => warn!("Session cookie not header-safe: {}", e),
        }
    }

    response
}

// =============================================================================
// Main Router
// =============================================================================

/// Handle auth-related HTTP requests.
///
/// Returns Some(response) if request was handled, None if not an auth route.
pub async fn handle_auth_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> Option<Response<BoxBody>> {
    let path = req.uri().path();
    let method = req.method();

    // Only handle /auth/* routes
    if !path.starts_with("/auth") {
        return None;
    }

    // Handle CORS preflight
    if method == Method::OPTIONS {
        return Some(cors_preflight());
    }

    // Remove query string for matching
    let path = path.split('?').next().unwrap_or(path);

    let response = match (method, path) {
        (&Method::POST, "/auth/register") => handle_register(req, state).await,
        (&Method::POST, "/auth/login") => handle_login(req, state).await,
        (&Method::POST, "/auth/logout") => handle_logout(req, state).await,
        (&Method::POST, "/auth/refresh") => handle_refresh(req, state).await,
        (&Method::GET, "/auth/me") => handle_me(req, state).await,
        (&Method::GET, "/auth/sessions") => handle_sessions(req, state).await,

        // Method not allowed
        (_, "/auth/register")
        | (_, "/auth/login")
        | (_, "/auth/logout")
        | (_, "/auth/refresh")
        | (_, "/auth/me")
        | (_, "/auth/sessions") => json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            &ErrorResponse {
                error: "Method not allowed".into(),
                code: None,
            },
        ),

        // Auth endpoint not found
        _ => json_response(
            StatusCode::NOT_FOUND,
            &ErrorResponse {
                error: "Auth endpoint not found".into(),
                code: None,
            },
        ),
    };

    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Args;
    use clap::Parser;
    use http_body_util::BodyExt;

    fn test_state() -> Arc<AppState> {
        let dir =
            std::env::temp_dir().join(format!("usher-auth-routes-test-{}", uuid::Uuid::new_v4()));
        let secret = hex::encode([9u8; crate::secret::SECRET_LEN]);
        let args = Args::parse_from([
            "usher",
            "--secret",
            &secret,
            "--data-dir",
            dir.to_str().unwrap_or("/tmp/usher-auth-routes-test"),
        ]);
        Arc::new(AppState::new(args).unwrap())
    }

    fn test_user() -> UserDoc {
        UserDoc::new("frodo".to_string(), "Frodo".to_string(), None)
    }

    #[tokio::test]
    async fn test_auth_success_response_sets_cookie_and_token() {
        let state = test_state();
        let user = test_user();

        let response = auth_success_response(&state, &user, Some("sid-1"), StatusCode::OK);
        assert_eq!(response.status(), StatusCode::OK);

        let cookie = response
            .headers()
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        assert!(cookie.starts_with("usher_session=sid-1"));
        assert!(cookie.contains("HttpOnly"));

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["username"], "frodo");
        assert_eq!(json["displayName"], "Frodo");

        let token = json["token"].as_str().unwrap();
        let result = state.jwt.verify_token(token);
        assert!(result.valid);
        assert_eq!(result.claims.unwrap().sub, user.user_id);
    }

    #[tokio::test]
    async fn test_auth_success_response_without_session_omits_cookie() {
        let state = test_state();
        let user = test_user();

        let response = auth_success_response(&state, &user, None, StatusCode::OK);
        assert!(response.headers().get(SET_COOKIE).is_none());
    }

    #[test]
    fn test_short_session_id() {
        assert_eq!(short_session_id("0123456789abcdef"), "01234567");
        assert_eq!(short_session_id("abc"), "abc");
    }
}
