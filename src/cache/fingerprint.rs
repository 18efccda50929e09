//! Cache fingerprint construction
//!
//! A fingerprint names one logical upstream response:
//!
//! ```text
//! user:<user id>|server:<server id>|<path>?<normalized query>
//! ```
//!
//! Query parameters are decoded, sorted, and re-encoded so equivalent
//! requests land on the same entry regardless of parameter order or
//! percent-encoding choices. The user and server discriminators keep every
//! user, and every server a user talks to, fully isolated from each other.

use tracing::debug;

/// Build the fingerprint for a request.
pub fn fingerprint(user_id: &str, server_id: &str, path: &str, query: Option<&str>) -> String {
    match query.map(normalize_query).filter(|q| !q.is_empty()) {
        Some(q) => format!("user:{}|server:{}|{}?{}", user_id, server_id, path, q),
        None => format!("user:{}|server:{}|{}", user_id, server_id, path),
    }
}

/// Prefix covering every entry belonging to one user, on any server.
/// Used when the server dimension itself changes (re-link, settings).
pub fn user_scope(user_id: &str) -> String {
    format!("user:{}|", user_id)
}

/// Prefix covering every entry belonging to one user on one server.
pub fn user_prefix(user_id: &str, server_id: &str) -> String {
    format!("user:{}|server:{}|", user_id, server_id)
}

/// Prefix covering one path (any query) for one user on one server.
pub fn path_prefix(user_id: &str, server_id: &str, path: &str) -> String {
    format!("user:{}|server:{}|{}", user_id, server_id, path)
}

/// Decode, sort, and re-encode a query string.
///
/// Client query strings are hostile input: one that fails to parse is used
/// raw rather than rejected, costing at worst a duplicate cache entry.
fn normalize_query(query: &str) -> String {
    match serde_urlencoded::from_str::<Vec<(String, String)>>(query) {
        Ok(mut pairs) => {
            pairs.sort();
            match serde_urlencoded::to_string(&pairs) {
                Ok(normalized) => normalized,
                Err(e) => {
                    debug_assert!(false, "re-encoding parsed query pairs failed: {}", e);
                    query.to_string()
                }
            }
        }
        Err(e) => {
            debug!(query = query, error = %e, "Query string failed to parse; using raw form");
            query.to_string()
        }
    }
}
