//! Health check endpoints
//!
//! Kubernetes-style probes plus cache introspection:
//! - /health, /healthz - liveness (is the process up?)
//! - /ready, /readyz   - readiness (can it serve traffic?)
//! - /version          - build identification
//! - /api/cache/stats  - cache counters (authenticated)
//!
//! Liveness always answers 200 while the process runs; a degraded process
//! secret shows up in the body, not in the status code. Readiness answers
//! 503 until MongoDB responds, unless dev mode made the database optional.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;

use crate::auth::resolve_identity;
use crate::routes::{error_response, json_response, BoxBody};
use crate::server::AppState;

/// Health response for operators and the client's connection screen.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Overall health status (true if service is running)
    pub healthy: bool,
    /// Service status for UI display: 'online' or 'degraded'
    pub status: &'static str,
    /// Service version
    pub version: &'static str,
    /// Uptime in seconds
    pub uptime: u64,
    /// Current timestamp
    pub timestamp: String,
    /// Operating mode
    pub mode: String,
    /// True when the process secret could not be persisted; sessions and
    /// stored credentials will not survive a restart
    pub secret_degraded: bool,
    /// Where the active secret came from
    pub secret_source: &'static str,
    /// Database state
    pub database: DatabaseHealth,
    /// Response cache state
    pub cache: CacheHealth,
    /// Explanation when degraded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Database health details
#[derive(Serialize)]
pub struct DatabaseHealth {
    /// Whether a MongoDB client is held. Liveness reports the client,
    /// readiness overwrites this with a real ping result.
    pub connected: bool,
}

/// Response cache health details
#[derive(Serialize)]
pub struct CacheHealth {
    /// Whether entries also persist to disk
    pub enabled: bool,
    /// Live entry count
    pub entries: usize,
}

/// Build health response with current state
fn build_health_response(state: &AppState) -> HealthResponse {
    let degraded = state.secrets.is_degraded();

    let error = if degraded {
        Some(
            "Process secret is not persisted; sessions and encrypted credentials die with this process"
                .to_string(),
        )
    } else {
        None
    };

    HealthResponse {
        healthy: true,
        status: if degraded { "degraded" } else { "online" },
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.uptime_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        mode: if state.args.dev_mode {
            "development".to_string()
        } else {
            "production".to_string()
        },
        secret_degraded: degraded,
        secret_source: state.secrets.source().as_str(),
        database: DatabaseHealth {
            connected: state.mongo.is_some(),
        },
        cache: CacheHealth {
            enabled: state.cache.persistent(),
            entries: state.cache.stats().entries,
        },
        error,
    }
}

/// Handle liveness probe (/health, /healthz)
///
/// Returns 200 OK whenever the service is running; degraded state is
/// reported in the body so monitoring can alert without restarting us.
pub fn health_check(state: Arc<AppState>) -> Response<Full<Bytes>> {
    let response = build_health_response(&state);

    let body = serde_json::to_string(&response)
        .unwrap_or_else(|_| r#"{"healthy":true,"error":"Serialization failed"}"#.to_string());

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

/// Handle readiness probe (/ready, /readyz)
///
/// Returns 200 OK only when the database answers (or dev mode waived it).
/// Use this for load balancer checks; liveness stays green either way.
pub async fn readiness_check(state: Arc<AppState>) -> Response<Full<Bytes>> {
    let mut response = build_health_response(&state);

    let db_ok = match &state.mongo {
        Some(mongo) => mongo.ping().await.is_ok(),
        None => false,
    };
    response.database.connected = db_ok;

    let is_ready = db_ok || state.args.dev_mode;

    let body = serde_json::to_string(&response)
        .unwrap_or_else(|_| r#"{"healthy":false,"error":"Serialization failed"}"#.to_string());

    let status = if is_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

/// Version information for deployment verification
#[derive(Serialize)]
pub struct VersionResponse {
    /// Cargo package version
    pub version: &'static str,
    /// Git commit hash (short)
    pub commit: &'static str,
    /// Git commit hash (full)
    pub commit_full: &'static str,
    /// Build timestamp
    pub build_time: &'static str,
    /// Service name
    pub service: &'static str,
}

/// Handle version endpoint (/version)
///
/// Returns build information for deployment verification.
pub fn version_info() -> Response<Full<Bytes>> {
    let response = VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
        commit_full: option_env!("GIT_COMMIT_FULL").unwrap_or("unknown"),
        build_time: option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
        service: "usher",
    };

    let body = serde_json::to_string(&response)
        .unwrap_or_else(|_| r#"{"version":"unknown","commit":"unknown"}"#.to_string());

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

/// GET /api/cache/stats
///
/// Cache counters for the authenticated caller. Entry keys never leave the
/// process; these are aggregates only.
pub async fn cache_stats(req: Request<Incoming>, state: Arc<AppState>) -> Response<BoxBody> {
    if let Err(e) = resolve_identity(&req, &state).await {
        return error_response(&e);
    }

    json_response(StatusCode::OK, &state.cache.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Args;
    use clap::Parser;
    use http_body_util::BodyExt;

    fn healthy_state() -> Arc<AppState> {
        let dir = std::env::temp_dir().join(format!("usher-health-test-{}", uuid::Uuid::new_v4()));
        let secret = hex::encode([5u8; crate::secret::SECRET_LEN]);
        let args = Args::parse_from([
            "usher",
            "--secret",
            &secret,
            "--data-dir",
            dir.to_str().unwrap_or("/tmp/usher-health-test"),
        ]);
        Arc::new(AppState::new(args).unwrap())
    }

    fn degraded_state() -> Arc<AppState> {
        // data_dir is a file, so the generated secret cannot be persisted
        let dir = std::env::temp_dir().join(format!("usher-health-test-{}", uuid::Uuid::new_v4()));
        std::fs::write(&dir, "occupied").unwrap();
        let args = Args::parse_from([
            "usher",
            "--data-dir",
            dir.to_str().unwrap_or("/tmp/usher-health-test"),
        ]);
        Arc::new(AppState::new(args).unwrap())
    }

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_online() {
        let response = health_check(healthy_state());
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["healthy"], true);
        assert_eq!(json["status"], "online");
        assert_eq!(json["secretDegraded"], false);
        assert_eq!(json["secretSource"], "override");
        assert_eq!(json["database"]["connected"], false);
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn test_health_exposes_degraded_secret() {
        let response = health_check(degraded_state());
        // Liveness stays 200; the body carries the bad news
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["secretDegraded"], true);
        assert_eq!(json["secretSource"], "memory");
        assert!(json["error"].as_str().unwrap().contains("not persisted"));
    }

    #[tokio::test]
    async fn test_readiness_without_database() {
        let response = readiness_check(healthy_state()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readiness_in_dev_mode() {
        let dir = std::env::temp_dir().join(format!("usher-health-test-{}", uuid::Uuid::new_v4()));
        let secret = hex::encode([5u8; crate::secret::SECRET_LEN]);
        let args = Args::parse_from([
            "usher",
            "--secret",
            &secret,
            "--data-dir",
            dir.to_str().unwrap_or("/tmp/usher-health-test"),
            "--dev-mode",
        ]);
        let state = Arc::new(AppState::new(args).unwrap());

        let response = readiness_check(state).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_version_reports_package_version() {
        let json = body_json(version_info()).await;
        assert_eq!(json["service"], "usher");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }
}
