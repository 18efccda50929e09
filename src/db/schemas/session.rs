//! Browser session document schema
//!
//! One row per live cookie session. The cookie carries only the opaque
//! `session_id`; everything else stays server-side. A TTL index reaps
//! expired rows, and reads treat expired-but-not-yet-reaped rows as missing.

use bson::{doc, oid::ObjectId, Document};
use chrono::{DateTime, Duration, Utc};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::metadata::Metadata;
use crate::db::mongo::{IntoIndexes, MutMetadata};

/// Collection name for browser sessions
pub const SESSION_COLLECTION: &str = "sessions";

/// Browser session stored in MongoDB.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionDoc {
    /// MongoDB document ID
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    /// Standard metadata (created_at, updated_at, is_deleted)
    #[serde(default)]
    pub metadata: Metadata,

    /// Opaque session identifier carried by the cookie
    #[serde(default)]
    pub session_id: String,

    /// Owning user id
    #[serde(default)]
    pub user_id: String,

    /// When the session was issued
    #[serde(
        default = "default_now",
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime"
    )]
    pub issued_at: DateTime<Utc>,

    /// When the session stops being accepted. Stored as a BSON date so the
    /// TTL index can see it; a string timestamp would never be reaped.
    #[serde(
        default = "default_now",
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime"
    )]
    pub expires_at: DateTime<Utc>,
}

fn default_now() -> DateTime<Utc> {
    Utc::now()
}

impl SessionDoc {
    /// Create a new session for the user with the given lifetime.
    pub fn new(user_id: String, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            metadata: Metadata::new(),
            session_id: Uuid::new_v4().to_string(),
            user_id,
            issued_at: now,
            expires_at: now + ttl,
        }
    }

    /// Whether the session is still acceptable. Expired and soft-deleted
    /// rows answer false, same as a row that never existed.
    pub fn is_valid(&self) -> bool {
        !self.metadata.is_deleted && Utc::now() < self.expires_at
    }
}

impl IntoIndexes for SessionDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // Unique index on session_id
            (
                doc! { "session_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("session_id_unique".to_string())
                        .build(),
                ),
            ),
            // TTL index for automatic expiration cleanup
            (
                doc! { "expires_at": 1 },
                Some(
                    IndexOptions::builder()
                        .expire_after(std::time::Duration::from_secs(0))
                        .name("expires_at_ttl".to_string())
                        .build(),
                ),
            ),
            // Index on user_id for per-user session listing
            (
                doc! { "user_id": 1 },
                Some(
                    IndexOptions::builder()
                        .name("user_id_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for SessionDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_valid() {
        let session = SessionDoc::new("user-1".to_string(), Duration::days(7));
        assert!(session.is_valid());
        assert!(!session.session_id.is_empty());
        assert!(session.expires_at > session.issued_at);
    }

    #[test]
    fn test_expired_session_is_invalid() {
        let mut session = SessionDoc::new("user-1".to_string(), Duration::days(7));
        session.expires_at = Utc::now() - Duration::seconds(1);
        assert!(!session.is_valid());
    }

    #[test]
    fn test_soft_deleted_session_is_invalid() {
        let mut session = SessionDoc::new("user-1".to_string(), Duration::days(7));
        session.metadata.is_deleted = true;
        assert!(!session.is_valid());
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionDoc::new("user-1".to_string(), Duration::days(7));
        let b = SessionDoc::new("user-1".to_string(), Duration::days(7));
        assert_ne!(a.session_id, b.session_id);
    }
}
