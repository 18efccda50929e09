//! Upstream media server access

pub mod client;

pub use client::{MediaServerClient, UpstreamAccount, UpstreamResponse};
