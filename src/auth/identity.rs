//! Request identity resolution
//!
//! Two authentication channels produce one identity:
//!
//! - browser clients carry the `usher_session` cookie, resolved against the
//!   server-side session row
//! - mobile and CLI clients carry `Authorization: Bearer <jwt>`, resolved
//!   from the token claims alone
//!
//! The cookie path is tried first; a present-but-invalid cookie falls
//! through to the bearer path rather than failing the request. Handlers
//! downstream never care which channel authenticated the caller.

use bson::doc;
use hyper::header::AUTHORIZATION;
use hyper::Request;
use tracing::debug;

use crate::auth::jwt::extract_token_from_header;
use crate::auth::session::{find_valid_session, session_id_from_request};
use crate::db::schemas::{SessionDoc, UserDoc, SESSION_COLLECTION, USER_COLLECTION};
use crate::server::AppState;
use crate::types::{Result, UsherError};

/// Authenticated caller, tagged by channel.
#[derive(Debug, Clone)]
pub enum Identity {
    /// Cookie-authenticated browser client
    Session {
        user_id: String,
        username: String,
        upstream_account_id: Option<String>,
        session_id: String,
    },
    /// Token-authenticated bearer client
    Bearer {
        user_id: String,
        username: String,
        upstream_account_id: Option<String>,
    },
}

impl Identity {
    pub fn user_id(&self) -> &str {
        match self {
            Identity::Session { user_id, .. } => user_id,
            Identity::Bearer { user_id, .. } => user_id,
        }
    }

    pub fn username(&self) -> &str {
        match self {
            Identity::Session { username, .. } => username,
            Identity::Bearer { username, .. } => username,
        }
    }

    pub fn upstream_account_id(&self) -> Option<&str> {
        match self {
            Identity::Session {
                upstream_account_id,
                ..
            }
            | Identity::Bearer {
                upstream_account_id,
                ..
            } => upstream_account_id.as_deref(),
        }
    }

    /// Session id when cookie-authenticated. Logout needs it; nothing else
    /// should.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Identity::Session { session_id, .. } => Some(session_id),
            Identity::Bearer { .. } => None,
        }
    }

    /// Channel label for logging.
    pub fn channel(&self) -> &'static str {
        match self {
            Identity::Session { .. } => "session",
            Identity::Bearer { .. } => "bearer",
        }
    }
}

/// Resolve the caller's identity or fail with `AuthenticationRequired`.
///
/// Database trouble on the session path surfaces as a database error, not
/// as a missing identity: "we could not check" and "you are not logged in"
/// demand different responses.
pub async fn resolve_identity<B>(req: &Request<B>, state: &AppState) -> Result<Identity> {
    if let Some(session_id) = session_id_from_request(req) {
        if let Some(identity) = resolve_session(&session_id, state).await? {
            return Ok(identity);
        }
        debug!("Session cookie present but not valid; trying bearer path");
    }

    if let Some(header) = req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = extract_token_from_header(header) {
            let result = state.jwt.verify_token(token);
            if let Some(claims) = result.claims {
                return Ok(Identity::Bearer {
                    user_id: claims.sub,
                    username: claims.username,
                    upstream_account_id: claims.upstream_id,
                });
            }
            debug!(error = ?result.error, "Bearer token rejected");
        }
    }

    Err(UsherError::AuthenticationRequired)
}

/// Resolve a session id to an identity, or None when the session or its
/// user is gone.
async fn resolve_session(session_id: &str, state: &AppState) -> Result<Option<Identity>> {
    let Some(mongo) = &state.mongo else {
        return Ok(None);
    };

    let sessions = mongo.collection::<SessionDoc>(SESSION_COLLECTION).await?;
    let Some(session) = find_valid_session(&sessions, session_id).await? else {
        return Ok(None);
    };

    let users = mongo.collection::<UserDoc>(USER_COLLECTION).await?;
    let Some(user) = users
        .find_one(doc! { "user_id": &session.user_id, "is_active": true })
        .await?
    else {
        debug!(user_id = %session.user_id, "Session points at a missing or inactive user");
        return Ok(None);
    };

    Ok(Some(Identity::Session {
        user_id: user.user_id,
        username: user.username,
        upstream_account_id: user.upstream_account_id,
        session_id: session.session_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{JwtValidator, TokenInput};
    use crate::config::Args;
    use clap::Parser;

    fn test_state() -> AppState {
        // No MongoDB: the session path is a no-op and the bearer path does
        // all the work, which is exactly what these tests exercise.
        let dir = std::env::temp_dir().join(format!("usher-identity-test-{}", uuid::Uuid::new_v4()));
        let secret = hex::encode([5u8; crate::secret::SECRET_LEN]);
        let args = Args::parse_from([
            "usher",
            "--secret",
            &secret,
            "--data-dir",
            dir.to_str().unwrap_or("/tmp/usher-identity-test"),
        ]);
        AppState::new(args).unwrap()
    }

    fn bearer_request(token: &str) -> Request<()> {
        Request::builder()
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .body(())
            .unwrap()
    }

    #[tokio::test]
    async fn test_no_credentials_is_authentication_required() {
        let state = test_state();
        let req = Request::builder().body(()).unwrap();
        let err = resolve_identity(&req, &state).await.unwrap_err();
        assert!(matches!(err, UsherError::AuthenticationRequired));
    }

    #[tokio::test]
    async fn test_valid_bearer_token_resolves() {
        let state = test_state();
        let token = state
            .jwt
            .generate_token(TokenInput {
                user_id: "user-1".to_string(),
                username: "alice".to_string(),
                upstream_id: Some("up-9".to_string()),
            })
            .unwrap();

        let identity = resolve_identity(&bearer_request(&token), &state)
            .await
            .unwrap();
        assert_eq!(identity.user_id(), "user-1");
        assert_eq!(identity.username(), "alice");
        assert_eq!(identity.upstream_account_id(), Some("up-9"));
        assert_eq!(identity.channel(), "bearer");
        assert!(identity.session_id().is_none());
    }

    #[tokio::test]
    async fn test_foreign_token_rejected() {
        let state = test_state();
        let foreign = JwtValidator::new(b"some-other-process-secret-entirely", 3600);
        let token = foreign
            .generate_token(TokenInput {
                user_id: "user-1".to_string(),
                username: "alice".to_string(),
                upstream_id: None,
            })
            .unwrap();

        let err = resolve_identity(&bearer_request(&token), &state)
            .await
            .unwrap_err();
        assert!(matches!(err, UsherError::AuthenticationRequired));
    }

    #[tokio::test]
    async fn test_malformed_authorization_header_rejected() {
        let state = test_state();
        let req = Request::builder()
            .header(AUTHORIZATION, "Token abc")
            .body(())
            .unwrap();
        let err = resolve_identity(&req, &state).await.unwrap_err();
        assert!(matches!(err, UsherError::AuthenticationRequired));
    }

    #[tokio::test]
    async fn test_invalid_cookie_falls_through_to_bearer() {
        let state = test_state();
        let token = state
            .jwt
            .generate_token(TokenInput {
                user_id: "user-2".to_string(),
                username: "bob".to_string(),
                upstream_id: None,
            })
            .unwrap();

        let req = Request::builder()
            .header(hyper::header::COOKIE, "usher_session=stale-session-id")
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .body(())
            .unwrap();

        let identity = resolve_identity(&req, &state).await.unwrap();
        assert_eq!(identity.user_id(), "user-2");
        assert_eq!(identity.channel(), "bearer");
    }
}
