//! Response caching for upstream calls
//!
//! The cache exists because the upstream media server is slow and often
//! remote: a hit must cost a map lookup, not a network trip. Entries are
//! keyed by [`fingerprint`] values, expire lazily per resource class, and
//! survive restarts through [`persist`].

pub mod fingerprint;
pub mod persist;
pub mod response;

pub use fingerprint::{fingerprint, path_prefix, user_prefix, user_scope};
pub use persist::CachePersistence;
pub use response::{CacheStats, CacheTtlConfig, CachedResponse, ResourceClass, ResponseCache};
