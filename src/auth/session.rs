//! Browser session management
//!
//! Sessions bind an opaque UUID to a user id in MongoDB. The cookie carries
//! only the UUID, HttpOnly so page scripts never see it. A session that is
//! missing, expired, or soft-deleted is indistinguishable from no session:
//! the caller just is not authenticated.

use bson::doc;
use chrono::Duration;
use cookie::{Cookie, SameSite};
use hyper::header::COOKIE;
use hyper::Request;

use crate::db::schemas::SessionDoc;
use crate::db::MongoCollection;
use crate::types::Result;

/// Session cookie name. Deliberately not a framework default so the gateway
/// can sit behind shared reverse proxies without collisions.
pub const SESSION_COOKIE: &str = "usher_session";

/// Create a session row for the user and return its id.
pub async fn create_session(
    sessions: &MongoCollection<SessionDoc>,
    user_id: &str,
    ttl: Duration,
) -> Result<String> {
    let session = SessionDoc::new(user_id.to_string(), ttl);
    let session_id = session.session_id.clone();
    sessions.insert_one(session).await?;
    Ok(session_id)
}

/// Look up a session by id. Expired and missing rows both come back None.
pub async fn find_valid_session(
    sessions: &MongoCollection<SessionDoc>,
    session_id: &str,
) -> Result<Option<SessionDoc>> {
    let Some(session) = sessions.find_one(doc! { "session_id": session_id }).await? else {
        return Ok(None);
    };
    if !session.is_valid() {
        return Ok(None);
    }
    Ok(Some(session))
}

/// Retire a session (logout). The TTL index reaps the row later.
pub async fn delete_session(
    sessions: &MongoCollection<SessionDoc>,
    session_id: &str,
) -> Result<()> {
    sessions
        .soft_delete(doc! { "session_id": session_id })
        .await?;
    Ok(())
}

/// Build the Set-Cookie value for a fresh session.
pub fn session_cookie(
    session_id: &str,
    samesite: SameSite,
    secure: bool,
    max_age_days: i64,
) -> String {
    Cookie::build((SESSION_COOKIE, session_id))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(samesite)
        .max_age(cookie::time::Duration::days(max_age_days))
        .build()
        .to_string()
}

/// Build a Set-Cookie value that clears the session cookie.
pub fn clear_session_cookie(samesite: SameSite, secure: bool) -> String {
    Cookie::build((SESSION_COOKIE, ""))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(samesite)
        .max_age(cookie::time::Duration::ZERO)
        .build()
        .to_string()
}

/// Extract the session id from a request's Cookie headers, if any.
pub fn session_id_from_request<B>(req: &Request<B>) -> Option<String> {
    for value in req.headers().get_all(COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for cookie in Cookie::split_parse(raw).flatten() {
            if cookie.name() == SESSION_COOKIE && !cookie.value().is_empty() {
                return Some(cookie.value().to_string());
            }
        }
    }
    None
}
