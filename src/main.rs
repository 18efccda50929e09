//! Usher - credential and cache gateway for media clients

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use usher::{config::Args, db::MongoClient, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("usher={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Validate configuration
    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Print startup banner
    info!("======================================");
    info!("  Usher - Media Client Gateway");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!(
        "Mode: {}",
        if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" }
    );
    info!("Data dir: {}", args.data_dir.display());
    info!("MongoDB: {}", args.mongodb_uri);
    match &args.upstream_url {
        Some(url) => info!("Upstream fallback: {}", url),
        None => info!("Upstream fallback: none (per-user server URLs only)"),
    }
    info!("Upstream timeout: {}s", args.upstream_timeout_secs);
    info!("Session TTL: {} days", args.session_ttl_days);
    info!("Token expiry: {}s", args.token_expiry_seconds);
    info!(
        "Cookie SameSite: {} (Secure: {})",
        args.cookie_samesite, args.https_fronted
    );
    info!("======================================");

    // Connect to MongoDB (optional in dev mode)
    let mongo = match MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await {
        Ok(client) => {
            info!("MongoDB connected successfully");
            Some(client)
        }
        Err(e) => {
            if args.dev_mode {
                warn!("MongoDB connection failed (dev mode, continuing without): {}", e);
                None
            } else {
                error!("MongoDB connection failed: {}", e);
                std::process::exit(1);
            }
        }
    };

    // Resolve the process secret and assemble shared state
    let state = match mongo {
        Some(client) => server::AppState::with_mongo(args, client)?,
        None => server::AppState::new(args)?,
    };

    // Run the server
    if let Err(e) = server::run(Arc::new(state)).await {
        error!("Server error: {:?}", e);
        std::process::exit(1);
    }

    Ok(())
}
