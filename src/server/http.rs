//! HTTP server and request routing
//!
//! One hyper http1 server; every request runs through [`handle_request`].
//! Route families:
//! - `/auth/*`    - register, login, logout, refresh, me, sessions
//! - `/api/account/*` - upstream account linking and credential management
//! - `/api/media/*`   - cached pass-through to the upstream media server
//! - `/health`, `/ready`, `/version`, `/api/cache/stats` - operations

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::auth::JwtValidator;
use crate::cache::{CachePersistence, CacheTtlConfig, ResponseCache};
use crate::config::Args;
use crate::credentials::CredentialCipher;
use crate::db::MongoClient;
use crate::routes;
use crate::secret::SecretStore;
use crate::types::Result;
use crate::upstream::MediaServerClient;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Shared application state
pub struct AppState {
    pub args: Args,
    /// MongoDB connection; None in dev mode without a database
    pub mongo: Option<MongoClient>,
    /// Process secret, resolved once at startup
    pub secrets: Arc<SecretStore>,
    /// Token validator keyed by the process secret
    pub jwt: JwtValidator,
    /// Per-user credential encryption
    pub cipher: CredentialCipher,
    /// Fingerprint-keyed upstream response cache
    pub cache: Arc<ResponseCache>,
    /// Upstream media server client
    pub upstream: MediaServerClient,
    /// Process start, for uptime reporting
    pub started_at: Instant,
}

impl AppState {
    /// Create AppState without a database (dev mode, unit tests).
    pub fn new(args: Args) -> Result<Self> {
        Self::build(args, None)
    }

    /// Create AppState with a MongoDB connection.
    pub fn with_mongo(args: Args, mongo: MongoClient) -> Result<Self> {
        Self::build(args, Some(mongo))
    }

    fn build(args: Args, mongo: Option<MongoClient>) -> Result<Self> {
        let secrets = Arc::new(SecretStore::load(
            args.secret.as_deref(),
            &args.secret_file(),
        )?);

        let jwt = JwtValidator::new(secrets.secret(), args.token_expiry_seconds);
        let cipher = CredentialCipher::new(Arc::clone(&secrets));

        let ttls = CacheTtlConfig {
            library_secs: args.cache_ttl_library_secs,
            metadata_secs: args.cache_ttl_metadata_secs,
            now_playing_secs: args.cache_ttl_now_playing_secs,
            search_secs: args.cache_ttl_search_secs,
            default_secs: args.cache_ttl_default_secs,
        };
        let cache = Arc::new(ResponseCache::with_persistence(
            ttls,
            CachePersistence::new(args.cache_dir()),
        ));

        let upstream = MediaServerClient::new(args.upstream_timeout())?;

        Ok(Self {
            args,
            mongo,
            secrets,
            jwt,
            cipher,
            cache,
            upstream,
            started_at: Instant::now(),
        })
    }

    /// Uptime in whole seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Start the HTTP server
pub async fn run(state: Arc<AppState>) -> Result<()> {
    // Reload surviving cache entries before accepting traffic
    state.cache.rehydrate().await;

    let listener = TcpListener::bind(state.args.listen).await?;

    info!("Usher listening on {}", state.args.listen);

    if state.args.dev_mode {
        warn!("Development mode enabled - MongoDB is optional");
    }
    if state.secrets.is_degraded() {
        warn!("Running with an in-memory process secret - see startup log for details");
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(io, service)
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    info!("[{}] {} {}", addr, method, path);

    // Auth routes (/auth/*) - these consume the request
    if path.starts_with("/auth") {
        if let Some(response) = routes::handle_auth_request(req, Arc::clone(&state)).await {
            return Ok(response);
        }
        return Ok(to_boxed(not_found_response(&path)));
    }

    // Account linking and settings (/api/account/*)
    if path.starts_with("/api/account") {
        if let Some(response) = routes::handle_account_request(req, Arc::clone(&state)).await {
            return Ok(response);
        }
        return Ok(to_boxed(not_found_response(&path)));
    }

    // Cached media pass-through (/api/media/*)
    if path.starts_with("/api/media") {
        if let Some(response) = routes::handle_media_request(req, Arc::clone(&state)).await {
            return Ok(response);
        }
        return Ok(to_boxed(not_found_response(&path)));
    }

    let response = match (method, path.as_str()) {
        // Liveness probe - returns 200 if usher is running
        (Method::GET, "/health") | (Method::GET, "/healthz") => {
            to_boxed(routes::health_check(Arc::clone(&state)))
        }

        // Readiness probe - returns 200 only when dependencies answer
        (Method::GET, "/ready") | (Method::GET, "/readyz") => {
            to_boxed(routes::readiness_check(Arc::clone(&state)).await)
        }

        // Version info for deployment verification
        (Method::GET, "/version") => to_boxed(routes::version_info()),

        // Cache statistics (authenticated)
        (Method::GET, "/api/cache/stats") => {
            return Ok(routes::cache_stats(req, Arc::clone(&state)).await);
        }

        // CORS preflight
        (Method::OPTIONS, _) => to_boxed(preflight_response()),

        (_, p) => to_boxed(not_found_response(p)),
    };

    Ok(response)
}

/// Convert a Full<Bytes> body to BoxBody
fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}

/// CORS preflight response
fn preflight_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Headers", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, PUT, OPTIONS")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// Not found response
fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": "Not Found",
        "path": path,
    });

    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
