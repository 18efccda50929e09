//! Configuration for usher
//!
//! All settings come from CLI arguments or environment variables, with CLI
//! taking precedence. Run with `--help` for the full list.

use clap::Parser;
use cookie::SameSite;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "usher")]
#[command(about = "Credential and cache gateway for media clients", version)]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:3923")]
    pub listen: SocketAddr,

    /// Directory for persistent state (process secret, response cache)
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Process secret override (hex or base64). When set, the persisted
    /// secret file is neither read nor written.
    #[arg(long, env = "USHER_SECRET")]
    pub secret: Option<String>,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "usher")]
    pub mongodb_db: String,

    /// Fallback upstream media server URL, used when a stored credential
    /// predates server URLs being recorded per user
    #[arg(long, env = "UPSTREAM_URL")]
    pub upstream_url: Option<String>,

    /// Upstream request timeout in seconds
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value = "20")]
    pub upstream_timeout_secs: u64,

    /// Browser session lifetime in days
    #[arg(long, env = "SESSION_TTL_DAYS", default_value = "7")]
    pub session_ttl_days: i64,

    /// Bearer token lifetime in seconds
    #[arg(long, env = "TOKEN_EXPIRY_SECONDS", default_value = "604800")]
    pub token_expiry_seconds: u64,

    /// SameSite policy for the session cookie: lax, strict, or none
    #[arg(long, env = "COOKIE_SAMESITE", default_value = "lax")]
    pub cookie_samesite: String,

    /// Whether the deployment terminates TLS in front of usher. Controls the
    /// Secure flag on the session cookie.
    #[arg(long, env = "HTTPS_FRONTED", default_value = "false")]
    pub https_fronted: bool,

    /// Cache TTL for library listings, in seconds
    #[arg(long, env = "CACHE_TTL_LIBRARY_SECS", default_value = "43200")]
    pub cache_ttl_library_secs: u64,

    /// Cache TTL for item metadata, in seconds
    #[arg(long, env = "CACHE_TTL_METADATA_SECS", default_value = "86400")]
    pub cache_ttl_metadata_secs: u64,

    /// Cache TTL for now-playing state, in seconds
    #[arg(long, env = "CACHE_TTL_NOW_PLAYING_SECS", default_value = "10")]
    pub cache_ttl_now_playing_secs: u64,

    /// Cache TTL for search results, in seconds
    #[arg(long, env = "CACHE_TTL_SEARCH_SECS", default_value = "300")]
    pub cache_ttl_search_secs: u64,

    /// Cache TTL for everything else, in seconds
    #[arg(long, env = "CACHE_TTL_DEFAULT_SECS", default_value = "60")]
    pub cache_ttl_default_secs: u64,

    /// Development mode: MongoDB becomes optional and auth endpoints that
    /// need it return 503 instead of aborting startup
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Path of the persisted process secret.
    pub fn secret_file(&self) -> PathBuf {
        self.data_dir.join("secret.key")
    }

    /// Directory holding persisted cache entries.
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    /// Parsed SameSite policy. `validate` has already rejected unknown values.
    pub fn cookie_samesite(&self) -> SameSite {
        match self.cookie_samesite.as_str() {
            "strict" => SameSite::Strict,
            "none" => SameSite::None,
            _ => SameSite::Lax,
        }
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.session_ttl_days)
    }

    pub fn upstream_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.upstream_timeout_secs)
    }

    /// Validate configuration beyond what clap can express.
    pub fn validate(&self) -> Result<(), String> {
        match self.cookie_samesite.as_str() {
            "lax" | "strict" | "none" => {}
            other => {
                return Err(format!(
                    "COOKIE_SAMESITE must be lax, strict, or none (got '{}')",
                    other
                ))
            }
        }

        // Browsers drop SameSite=None cookies without the Secure flag.
        if self.cookie_samesite == "none" && !self.https_fronted {
            return Err("COOKIE_SAMESITE=none requires HTTPS_FRONTED=true".to_string());
        }

        if self.session_ttl_days <= 0 {
            return Err("SESSION_TTL_DAYS must be positive".to_string());
        }

        if self.token_expiry_seconds == 0 {
            return Err("TOKEN_EXPIRY_SECONDS must be positive".to_string());
        }

        if self.upstream_timeout_secs == 0 {
            return Err("UPSTREAM_TIMEOUT_SECS must be positive".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args::parse_from(["usher"])
    }

    #[test]
    fn test_defaults_validate() {
        let args = base_args();
        assert!(args.validate().is_ok());
        assert_eq!(args.cookie_samesite(), SameSite::Lax);
    }

    #[test]
    fn test_samesite_none_requires_https() {
        let mut args = base_args();
        args.cookie_samesite = "none".to_string();
        assert!(args.validate().is_err());

        args.https_fronted = true;
        assert!(args.validate().is_ok());
        assert_eq!(args.cookie_samesite(), SameSite::None);
    }

    #[test]
    fn test_unknown_samesite_rejected() {
        let mut args = base_args();
        args.cookie_samesite = "sideways".to_string();
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_derived_paths() {
        let mut args = base_args();
        args.data_dir = PathBuf::from("/var/lib/usher");
        assert_eq!(args.secret_file(), PathBuf::from("/var/lib/usher/secret.key"));
        assert_eq!(args.cache_dir(), PathBuf::from("/var/lib/usher/cache"));
    }
}
