//! Usher - credential and cache gateway for media clients
//!
//! Usher sits between media client apps and each user's upstream media
//! server, owning the three things clients must never get wrong:
//!
//! ## Services
//!
//! - **Identity**: browser cookie sessions and mobile bearer tokens
//!   resolve to one identity, backed by the same user record
//! - **Credentials**: upstream API tokens encrypted at rest, one key per
//!   user, derived from a durable process secret
//! - **Cache**: fingerprint-keyed upstream response cache with per-class
//!   TTLs, paired invalidation on writes, and disk persistence

pub mod auth;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod db;
pub mod routes;
pub mod secret;
pub mod server;
pub mod types;
pub mod upstream;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{Result, UsherError};
