//! HTTP Routes for Upstream Account Linking
//!
//! - POST /api/account/connect    - Validate and store an upstream credential
//! - GET  /api/account/credential - Reveal the caller's own credential
//! - PUT  /api/account/settings   - Update display name / subscriber flag
//!
//! Connect is the only way a credential enters the system: the token is
//! validated against the upstream server first, then sealed with the
//! caller's per-user key before it touches MongoDB. The reveal endpoint
//! returns the decrypted material to its owner and nobody else; a stored
//! credential that no longer decrypts answers 409 so the client re-runs
//! the connect flow.

use bson::doc;
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::resolve_identity;
use crate::cache::user_scope;
use crate::credentials::{is_encrypted, UpstreamCredential};
use crate::db::schemas::{UserDoc, USER_COLLECTION};
use crate::routes::{
    cors_preflight, error_response, json_response, parse_json_body, BoxBody, ErrorResponse,
    SuccessResponse,
};
use crate::server::AppState;
use crate::types::{Result, UsherError};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    /// Base URL of the user's media server
    pub server_url: String,
    /// API token issued by that server
    pub token: String,
    /// Stable server identifier; derived from the URL when omitted
    #[serde(default)]
    pub server_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub server_id: String,
    pub upstream_account_id: String,
    /// Username as the upstream server knows it
    pub upstream_username: String,
    pub subscriber: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialResponse {
    pub token: String,
    pub server_url: String,
    pub server_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsRequest {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub subscriber: Option<bool>,
}

// =============================================================================
// Route Handlers
// =============================================================================

/// POST /api/account/connect
///
/// Link an upstream account to the caller.
///
/// Flow:
/// 1. Validate the token against the upstream account endpoint
/// 2. Seal token + connection parameters with the caller's per-user key
/// 3. Store envelope, upstream account id, and subscriber flag in the row
/// 4. Invalidate everything cached for this user (old server included)
async fn handle_connect(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> Response<BoxBody> {
    let identity = match resolve_identity(&req, &state).await {
        Ok(i) => i,
        Err(e) => return error_response(&e),
    };

    let body: ConnectRequest = match parse_json_body(req).await {
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

    if body.server_url.is_empty() || body.token.is_empty() {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ErrorResponse {
                error: "Missing required fields: serverUrl, token".into(),
                code: None,
            },
        );
    }

    let server_url = body.server_url.trim_end_matches('/').to_string();
    let server_id = if body.server_id.is_empty() {
        derive_server_id(&server_url)
    } else {
        body.server_id.clone()
    };

    let candidate = UpstreamCredential {
        token: body.token.clone(),
        server_url,
        server_id: server_id.clone(),
    };

    // A token we cannot use is not worth storing
    let account = match state.upstream.validate(&candidate).await {
        Ok(a) => a,
        Err(e) => return error_response(&e),
    };

    let envelope = match state.cipher.seal_credential(identity.user_id(), &candidate) {
        Ok(env) => env,
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

    if let Err(e) = users
        .update_one(
            doc! { "user_id": identity.user_id() },
            doc! {
                "$set": {
                    "credential": &envelope,
                    "upstream_account_id": &account.id,
                    "is_subscriber": account.subscription,
                    "metadata.updated_at": bson::DateTime::now(),
                }
            },
        )
        .await
    {
        return error_response(&e);
    }

    // The server dimension may have changed; drop the whole user scope
    let dropped = state
        .cache
        .invalidate_prefix(&user_scope(identity.user_id()));

    info!(
        user = identity.user_id(),
        server = server_id,
        dropped_entries = dropped,
        "Linked upstream account"
    );

    json_response(
        StatusCode::OK,
        &ConnectResponse {
            server_id,
            upstream_account_id: account.id,
            upstream_username: account.username,
            subscriber: account.subscription,
        },
    )
}

/// GET /api/account/credential
///
/// Decrypt and return the caller's own upstream credential. Clients use
/// this to talk to the media server directly (streaming bypasses the
/// gateway). 404 when nothing is linked; 409 when the stored envelope no
/// longer decrypts.
async fn handle_credential(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> Response<BoxBody> {
    let identity = match resolve_identity(&req, &state).await {
        Ok(i) => i,
        Err(e) => return error_response(&e),
    };

    let credential = match load_upstream_credential(&state, identity.user_id()).await {
        Ok(Some(c)) => c,
        Ok(None) => {
            return json_response(
                StatusCode::NOT_FOUND,
                &ErrorResponse {
                    error: "No upstream account linked".into(),
                    code: Some("NOT_LINKED".into()),
                },
            )
        }
        Err(e) => return error_response(&e),
    };

    json_response(
        StatusCode::OK,
        &CredentialResponse {
            token: credential.token,
            server_url: credential.server_url,
            server_id: credential.server_id,
        },
    )
}

/// PUT /api/account/settings
///
/// Update mutable account fields. Subscriber status can gate what the
/// upstream returns, so the user's cached responses are dropped.
async fn handle_settings(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> Response<BoxBody> {
    let identity = match resolve_identity(&req, &state).await {
        Ok(i) => i,
        Err(e) => return error_response(&e),
    };

    let body: SettingsRequest = match parse_json_body(req).await {
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

    let mut set = bson::Document::new();
    if let Some(name) = &body.display_name {
        if name.is_empty() {
            return json_response(
                StatusCode::BAD_REQUEST,
                &ErrorResponse {
                    error: "displayName must not be empty".into(),
                    code: None,
                },
            );
        }
        set.insert("display_name", name);
    }
    if let Some(subscriber) = body.subscriber {
        set.insert("is_subscriber", subscriber);
    }

    if set.is_empty() {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ErrorResponse {
                error: "No settings provided".into(),
                code: None,
            },
        );
    }
    set.insert("metadata.updated_at", bson::DateTime::now());

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

    if let Err(e) = users
        .update_one(doc! { "user_id": identity.user_id() }, doc! { "$set": set })
        .await
    {
        return error_response(&e);
    }

    state
        .cache
        .invalidate_prefix(&user_scope(identity.user_id()));

    json_response(
        StatusCode::OK,
        &SuccessResponse {
            success: true,
            message: "Settings updated".into(),
        },
    )
}

// =============================================================================
// Credential Loading
// =============================================================================

/// Load and decrypt the stored upstream credential for a user.
///
/// `Ok(None)` means nothing is linked. Rows written before encryption
/// shipped hold a bare token; those are rebuilt against the configured
/// upstream URL and re-sealed in place, so each legacy row is upgraded the
/// first time it is touched.
pub(crate) async fn load_upstream_credential(
    state: &AppState,
    user_id: &str,
) -> Result<Option<UpstreamCredential>> {
    let Some(mongo) = &state.mongo else {
        return Err(UsherError::Database("Database not available".to_string()));
    };
    let users = mongo.collection::<UserDoc>(USER_COLLECTION).await?;

    let user = users
        .find_one(doc! { "user_id": user_id, "is_active": true })
        .await?
        .ok_or(UsherError::AuthenticationRequired)?;

    let Some(stored) = user.credential.as_deref() else {
        return Ok(None);
    };

    if is_encrypted(stored) {
        return state.cipher.open_credential(user_id, stored).map(Some);
    }

    let Some(server_url) = state.args.upstream_url.clone() else {
        return Err(UsherError::CredentialInvalid(
            "Legacy credential present but no upstream URL configured".to_string(),
        ));
    };
    let server_url = server_url.trim_end_matches('/').to_string();
    let credential = UpstreamCredential {
        token: stored.to_string(),
        server_id: derive_server_id(&server_url),
        server_url,
    };

    match state.cipher.seal_credential(user_id, &credential) {
        Ok(envelope) => {
            let result = users
                .update_one(
                    doc! { "user_id": user_id },
                    doc! {
                        "$set": {
                            "credential": &envelope,
                            "metadata.updated_at": bson::DateTime::now(),
                        }
                    },
                )
                .await;
            match result {
                Ok(_) => info!(user = user_id, "Upgraded legacy plaintext credential"),
                Err(e) => warn!(user = user_id, error = %e, "Legacy credential upgrade failed"),
            }
        }
        Err(e) => warn!(user = user_id, error = %e, "Legacy credential seal failed"),
    }

    Ok(Some(credential))
}

/// Stable server identifier derived from the server URL.
pub(crate) fn derive_server_id(server_url: &str) -> String {
    let digest = Sha256::digest(server_url.as_bytes());
    hex::encode(&digest[..6])
}

// =============================================================================
// Main Router
// =============================================================================

/// Handle account-related HTTP requests.
///
/// Returns Some(response) if request was handled, None if not an account
/// route.
pub async fn handle_account_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> Option<Response<BoxBody>> {
    let path = req.uri().path();
    let method = req.method();

    if !path.starts_with("/api/account") {
        return None;
    }

    if method == Method::OPTIONS {
        return Some(cors_preflight());
    }

    let path = path.split('?').next().unwrap_or(path);

    let response = match (method, path) {
        (&Method::POST, "/api/account/connect") => handle_connect(req, state).await,
        (&Method::GET, "/api/account/credential") => handle_credential(req, state).await,
        (&Method::PUT, "/api/account/settings") => handle_settings(req, state).await,

        // Method not allowed
        (_, "/api/account/connect")
        | (_, "/api/account/credential")
        | (_, "/api/account/settings") => json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            &ErrorResponse {
                error: "Method not allowed".into(),
                code: None,
            },
        ),

        // Account endpoint not found
        _ => json_response(
            StatusCode::NOT_FOUND,
            &ErrorResponse {
                error: "Account endpoint not found".into(),
                code: None,
            },
        ),
    };

    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{fingerprint, CacheTtlConfig, CachedResponse, ResourceClass, ResponseCache};
    use bytes::Bytes;

    #[test]
    fn test_derive_server_id_is_stable() {
        let a = derive_server_id("https://media.example.com");
        let b = derive_server_id("https://media.example.com");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_derive_server_id_differs_by_url() {
        assert_ne!(
            derive_server_id("https://media.example.com"),
            derive_server_id("https://backup.example.com")
        );
    }

    /// Connect and settings both drop the caller's whole scope: every
    /// server they were pointed at, nothing belonging to anyone else.
    #[test]
    fn test_user_scope_invalidation_spans_servers() {
        let cache = ResponseCache::memory_only(CacheTtlConfig::default());
        let entry = CachedResponse {
            status: 200,
            content_type: "application/json".to_string(),
            body: Bytes::from_static(b"{}"),
        };

        let mine = [
            fingerprint("u1", "old-server", "/library/sections", None),
            fingerprint("u1", "new-server", "/library/sections", None),
            fingerprint("u1", "old-server", "/search", Some("query=x")),
        ];
        let theirs = fingerprint("u2", "old-server", "/library/sections", None);

        for key in mine.iter().chain(std::iter::once(&theirs)) {
            cache.set(key, entry.clone(), ResourceClass::Default);
        }

        let dropped = cache.invalidate_prefix(&user_scope("u1"));
        assert_eq!(dropped, mine.len());
        for key in &mine {
            assert!(cache.get(key).is_none());
        }
        assert!(cache.get(&theirs).is_some());
    }
}
