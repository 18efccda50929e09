//! Credential handling
//!
//! Users link their media-server account once; the upstream token they get
//! back lives inside their user row, encrypted with a key only this process
//! can derive. See [`cipher`] for the envelope format and key derivation.

pub mod cipher;

pub use cipher::{is_encrypted, CredentialCipher};

use serde::{Deserialize, Serialize};

/// Upstream connection material stored (encrypted) in the user row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamCredential {
    /// API token issued by the media server
    pub token: String,
    /// Base URL of the user's server instance
    pub server_url: String,
    /// Stable server identifier, part of every cache fingerprint
    pub server_id: String,
}
