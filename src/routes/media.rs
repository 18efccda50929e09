//! HTTP Routes for Cached Media Pass-Through
//!
//! - GET  /api/media/libraries              - library sections
//! - GET  /api/media/libraries/{key}/items  - one section's listing
//! - GET  /api/media/items/{key}            - item metadata
//! - GET  /api/media/now-playing            - live playback state
//! - GET  /api/media/search?query=          - search
//! - POST /api/media/items/{key}/watched    - mark an item watched
//! - POST /api/media/items/{key}/unwatched  - clear the watched flag
//!
//! Reads resolve the caller, load their upstream credential, and serve
//! from the cache under a fingerprint that carries user and server, so no
//! response ever crosses users. Fingerprints use the upstream path, not
//! the gateway path: the cache describes what the media server was asked.
//! Writes go straight upstream and then drop exactly the cached views the
//! change can appear in.

use hyper::header::HeaderValue;
use hyper::{Method, Request, Response, StatusCode};
use std::sync::Arc;
use tracing::info;

use crate::auth::resolve_identity;
use crate::cache::{fingerprint, path_prefix, CachedResponse, ResourceClass, ResponseCache};
use crate::routes::account::load_upstream_credential;
use crate::routes::{
    cors_preflight, error_response, full_body, json_response, BoxBody, ErrorResponse,
    SuccessResponse,
};
use crate::server::AppState;

// =============================================================================
// Upstream Path Mapping
// =============================================================================

const UPSTREAM_LIBRARIES: &str = "/library/sections";
const UPSTREAM_NOW_PLAYING: &str = "/status/now-playing";
const UPSTREAM_SEARCH: &str = "/search";

fn upstream_section_items(section_key: &str) -> String {
    format!("/library/sections/{}/all", section_key)
}

fn upstream_item(item_key: &str) -> String {
    format!("/library/items/{}", item_key)
}

// =============================================================================
// Route Table
// =============================================================================

/// Parsed media route. Keys are borrowed straight from the request path.
#[derive(Debug, PartialEq)]
enum MediaRoute<'a> {
    Libraries,
    LibraryItems(&'a str),
    Item(&'a str),
    NowPlaying,
    Search,
    Watched(&'a str, bool),
}

impl<'a> MediaRoute<'a> {
    fn parse(path: &'a str) -> Option<Self> {
        let rest = path.strip_prefix("/api/media/")?;
        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();

        match segments.as_slice() {
            ["libraries"] => Some(Self::Libraries),
            ["libraries", key, "items"] => Some(Self::LibraryItems(key)),
            ["items", key] => Some(Self::Item(key)),
            ["now-playing"] => Some(Self::NowPlaying),
            ["search"] => Some(Self::Search),
            ["items", key, "watched"] => Some(Self::Watched(key, true)),
            ["items", key, "unwatched"] => Some(Self::Watched(key, false)),
            _ => None,
        }
    }
}

// =============================================================================
// Cached Relay
// =============================================================================

/// Serve a GET through the cache, fetching from the caller's media server
/// on a miss. Upstream status and content type are relayed as-is; only 2xx
/// responses get remembered (the cache enforces that).
async fn relay_cached(
    req: &Request<hyper::body::Incoming>,
    state: &AppState,
    upstream_path: &str,
    class: ResourceClass,
) -> Response<BoxBody> {
    let identity = match resolve_identity(req, state).await {
        Ok(i) => i,
        Err(e) => return error_response(&e),
    };

    let credential = match load_upstream_credential(state, identity.user_id()).await {
        Ok(Some(c)) => c,
        Ok(None) => return not_linked_response(),
        Err(e) => return error_response(&e),
    };

    let query = req.uri().query();
    let key = fingerprint(
        identity.user_id(),
        &credential.server_id,
        upstream_path,
        query,
    );

    let result = state
        .cache
        .get_or_fetch(&key, class, || async {
            let upstream = state.upstream.fetch(&credential, upstream_path, query).await?;
            Ok(CachedResponse {
                status: upstream.status,
                content_type: upstream.content_type,
                body: upstream.body,
            })
        })
        .await;

    match result {
        Ok(cached) => relay_response(cached),
        Err(e) => error_response(&e),
    }
}

/// Turn a cached upstream response back into an HTTP response.
fn relay_response(cached: CachedResponse) -> Response<BoxBody> {
    let status = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = HeaderValue::from_str(&cached.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/json"));

    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .header("Access-Control-Allow-Origin", "*")
        .body(full_body(cached.body))
        .unwrap()
}

fn not_linked_response() -> Response<BoxBody> {
    json_response(
        StatusCode::NOT_FOUND,
        &ErrorResponse {
            error: "No upstream account linked".into(),
            code: Some("NOT_LINKED".into()),
        },
    )
}

// =============================================================================
// Route Handlers
// =============================================================================

/// GET /api/media/search?query=
///
/// The search term is required; an empty search would fan out across the
/// whole upstream library for nothing.
async fn handle_search(
    req: &Request<hyper::body::Incoming>,
    state: &AppState,
) -> Response<BoxBody> {
    if !has_search_term(req.uri().query()) {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ErrorResponse {
                error: "Missing required parameter: query".into(),
                code: None,
            },
        );
    }

    relay_cached(req, state, UPSTREAM_SEARCH, ResourceClass::Search).await
}

fn has_search_term(query: Option<&str>) -> bool {
    let Some(raw) = query else {
        return false;
    };
    serde_urlencoded::from_str::<Vec<(String, String)>>(raw)
        .map(|pairs| pairs.iter().any(|(k, v)| k == "query" && !v.is_empty()))
        .unwrap_or(false)
}

/// POST /api/media/items/{key}/watched and .../unwatched
///
/// The flag is written upstream first; the cache is only touched once the
/// media server accepted the change. Failures leave the cache alone so a
/// retry still sees consistent data.
async fn handle_watched(
    req: &Request<hyper::body::Incoming>,
    state: &AppState,
    item_key: &str,
    watched: bool,
) -> Response<BoxBody> {
    let identity = match resolve_identity(req, state).await {
        Ok(i) => i,
        Err(e) => return error_response(&e),
    };

    let credential = match load_upstream_credential(state, identity.user_id()).await {
        Ok(Some(c)) => c,
        Ok(None) => return not_linked_response(),
        Err(e) => return error_response(&e),
    };

    if let Err(e) = state.upstream.set_watched(&credential, item_key, watched).await {
        return error_response(&e);
    }

    let dropped = invalidate_after_watch(
        &state.cache,
        identity.user_id(),
        &credential.server_id,
        item_key,
    );

    info!(
        user = identity.user_id(),
        item = item_key,
        watched = watched,
        dropped_entries = dropped,
        "Updated watched state"
    );

    json_response(
        StatusCode::OK,
        &SuccessResponse {
            success: true,
            message: if watched {
                format!("Item {} marked watched", item_key)
            } else {
                format!("Item {} marked unwatched", item_key)
            },
        },
    )
}

/// Drop every cached view a watched-flag change can appear in: library
/// listings (watched counts), the item's own metadata, and now-playing.
/// Search results and other items keep their TTL.
fn invalidate_after_watch(
    cache: &ResponseCache,
    user_id: &str,
    server_id: &str,
    item_key: &str,
) -> usize {
    let mut dropped = cache.invalidate_prefix(&path_prefix(user_id, server_id, UPSTREAM_LIBRARIES));
    dropped += invalidate_path(cache, user_id, server_id, &upstream_item(item_key));
    dropped += cache.invalidate_prefix(&path_prefix(user_id, server_id, UPSTREAM_NOW_PLAYING));
    dropped
}

/// Drop one path's entry and its query variants. A plain prefix match
/// would also catch longer keys (item 10 swallowing item 105), so the
/// bare path and the "?" variants are dropped separately.
fn invalidate_path(cache: &ResponseCache, user_id: &str, server_id: &str, path: &str) -> usize {
    let exact = cache.invalidate(&fingerprint(user_id, server_id, path, None)) as usize;
    exact + cache.invalidate_prefix(&format!("{}?", path_prefix(user_id, server_id, path)))
}

// =============================================================================
// Main Router
// =============================================================================

/// Handle media HTTP requests.
///
/// Returns Some(response) if request was handled, None if not a media
/// route.
pub async fn handle_media_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> Option<Response<BoxBody>> {
    let path = req.uri().path();

    if !path.starts_with("/api/media") {
        return None;
    }

    if req.method() == Method::OPTIONS {
        return Some(cors_preflight());
    }

    let response = match (req.method(), MediaRoute::parse(path)) {
        (&Method::GET, Some(MediaRoute::Libraries)) => {
            relay_cached(&req, &state, UPSTREAM_LIBRARIES, ResourceClass::Library).await
        }
        (&Method::GET, Some(MediaRoute::LibraryItems(key))) => {
            let upstream_path = upstream_section_items(key);
            relay_cached(&req, &state, &upstream_path, ResourceClass::Library).await
        }
        (&Method::GET, Some(MediaRoute::Item(key))) => {
            let upstream_path = upstream_item(key);
            relay_cached(&req, &state, &upstream_path, ResourceClass::Metadata).await
        }
        (&Method::GET, Some(MediaRoute::NowPlaying)) => {
            relay_cached(&req, &state, UPSTREAM_NOW_PLAYING, ResourceClass::NowPlaying).await
        }
        (&Method::GET, Some(MediaRoute::Search)) => handle_search(&req, &state).await,
        (&Method::POST, Some(MediaRoute::Watched(key, watched))) => {
            handle_watched(&req, &state, key, watched).await
        }

        // Method not allowed
        (_, Some(_)) => json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            &ErrorResponse {
                error: "Method not allowed".into(),
                code: None,
            },
        ),

        // Media endpoint not found
        (_, None) => json_response(
            StatusCode::NOT_FOUND,
            &ErrorResponse {
                error: "Media endpoint not found".into(),
                code: None,
            },
        ),
    };

    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheTtlConfig;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(body: &str) -> CachedResponse {
        CachedResponse {
            status: 200,
            content_type: "application/json".to_string(),
            body: Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn test_media_route_parse() {
        assert_eq!(
            MediaRoute::parse("/api/media/libraries"),
            Some(MediaRoute::Libraries)
        );
        assert_eq!(
            MediaRoute::parse("/api/media/libraries/3/items"),
            Some(MediaRoute::LibraryItems("3"))
        );
        assert_eq!(
            MediaRoute::parse("/api/media/items/42"),
            Some(MediaRoute::Item("42"))
        );
        assert_eq!(
            MediaRoute::parse("/api/media/now-playing"),
            Some(MediaRoute::NowPlaying)
        );
        assert_eq!(
            MediaRoute::parse("/api/media/search"),
            Some(MediaRoute::Search)
        );
        assert_eq!(
            MediaRoute::parse("/api/media/items/42/watched"),
            Some(MediaRoute::Watched("42", true))
        );
        assert_eq!(
            MediaRoute::parse("/api/media/items/42/unwatched"),
            Some(MediaRoute::Watched("42", false))
        );
    }

    #[test]
    fn test_media_route_parse_rejects_unknown() {
        assert_eq!(MediaRoute::parse("/api/media"), None);
        assert_eq!(MediaRoute::parse("/api/media/"), None);
        assert_eq!(MediaRoute::parse("/api/media/libraries/3"), None);
        assert_eq!(MediaRoute::parse("/api/media/items"), None);
        assert_eq!(MediaRoute::parse("/api/media/items/42/extra/deep"), None);
        assert_eq!(MediaRoute::parse("/api/other/libraries"), None);
    }

    #[test]
    fn test_has_search_term() {
        assert!(has_search_term(Some("query=batman")));
        assert!(has_search_term(Some("limit=5&query=batman")));
        assert!(!has_search_term(Some("query=")));
        assert!(!has_search_term(Some("q=batman")));
        assert!(!has_search_term(None));
    }

    #[test]
    fn test_relay_response_preserves_status_and_content_type() {
        let response = relay_response(CachedResponse {
            status: 404,
            content_type: "application/xml".to_string(),
            body: Bytes::from("<nope/>"),
        });
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/xml"
        );
    }

    #[test]
    fn test_relay_response_survives_bogus_cached_values() {
        let response = relay_response(CachedResponse {
            status: 9999,
            content_type: "bad\nvalue".to_string(),
            body: Bytes::new(),
        });
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_watch_invalidation_drops_exactly_the_paired_views() {
        let cache = ResponseCache::memory_only(CacheTtlConfig::default());

        let stale = [
            fingerprint("u1", "s1", UPSTREAM_LIBRARIES, None),
            fingerprint("u1", "s1", "/library/sections/3/all", Some("sort=title")),
            fingerprint("u1", "s1", "/library/items/10", None),
            fingerprint("u1", "s1", "/library/items/10", Some("detail=full")),
            fingerprint("u1", "s1", UPSTREAM_NOW_PLAYING, None),
        ];
        let kept = [
            // Other items, including one whose key extends the changed one
            fingerprint("u1", "s1", "/library/items/105", None),
            fingerprint("u1", "s1", "/search", Some("query=batman")),
            // Other users and servers
            fingerprint("u2", "s1", UPSTREAM_LIBRARIES, None),
            fingerprint("u1", "s2", UPSTREAM_LIBRARIES, None),
        ];

        for key in stale.iter().chain(kept.iter()) {
            cache.set(key, entry("cached"), ResourceClass::Default);
        }

        let dropped = invalidate_after_watch(&cache, "u1", "s1", "10");
        assert_eq!(dropped, stale.len());

        for key in &stale {
            assert!(cache.get(key).is_none(), "should be dropped: {}", key);
        }
        for key in &kept {
            assert!(cache.get(key).is_some(), "should survive: {}", key);
        }
    }

    /// Two users asking for the same upstream path never share an entry:
    /// the second user's request goes upstream even though the first
    /// user's response is still fresh.
    #[tokio::test]
    async fn test_users_never_share_cache_entries() {
        let cache = ResponseCache::memory_only(CacheTtlConfig::default());
        let fetches = AtomicUsize::new(0);

        let fetch_for = |body: &'static str| {
            let fetches = &fetches;
            move || async move {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok(entry(body))
            }
        };

        let key_a = fingerprint("user-a", "s1", UPSTREAM_LIBRARIES, None);
        let key_b = fingerprint("user-b", "s1", UPSTREAM_LIBRARIES, None);

        let first = cache
            .get_or_fetch(&key_a, ResourceClass::Library, fetch_for("a-data"))
            .await
            .unwrap();
        let second = cache
            .get_or_fetch(&key_a, ResourceClass::Library, fetch_for("never"))
            .await
            .unwrap();
        let other = cache
            .get_or_fetch(&key_b, ResourceClass::Library, fetch_for("b-data"))
            .await
            .unwrap();

        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        assert_eq!(first.body, Bytes::from("a-data"));
        assert_eq!(second.body, Bytes::from("a-data"));
        assert_eq!(other.body, Bytes::from("b-data"));
    }
}
