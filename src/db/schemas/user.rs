//! User document schema
//!
//! Stores gateway accounts and their encrypted upstream credentials.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for users
pub const USER_COLLECTION: &str = "users";

/// User document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct UserDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata (created_at, updated_at, is_deleted)
    #[serde(default)]
    pub metadata: Metadata,

    /// Opaque user identifier (UUID), stable across renames
    #[serde(default)]
    pub user_id: String,

    /// Login name, unique
    pub username: String,

    /// Name shown by clients
    #[serde(default)]
    pub display_name: String,

    /// Argon2 password hash; absent for accounts that only ever
    /// authenticate through the upstream service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,

    /// Account id on the upstream media server, once linked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_account_id: Option<String>,

    /// Encrypted upstream credential envelope (`uenc:v1:...`). Rows written
    /// before encryption shipped hold the bare token here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,

    /// Whether the upstream account reported an active subscription
    #[serde(default)]
    pub is_subscriber: bool,

    /// Whether the user account is active
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl UserDoc {
    /// Create a new user document
    pub fn new(username: String, display_name: String, password_hash: Option<String>) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            user_id: Uuid::new_v4().to_string(),
            username,
            display_name,
            password_hash,
            upstream_account_id: None,
            credential: None,
            is_subscriber: false,
            is_active: true,
        }
    }
}

impl IntoIndexes for UserDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // Unique index on username
            (
                doc! { "username": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("username_unique".to_string())
                        .build(),
                ),
            ),
            // Unique index on user_id
            (
                doc! { "user_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("user_id_unique".to_string())
                        .build(),
                ),
            ),
            // Index on upstream_account_id for lookups
            (
                doc! { "upstream_account_id": 1 },
                Some(
                    IndexOptions::builder()
                        .name("upstream_account_id_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for UserDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_user_defaults() {
        let user = UserDoc::new(
            "alice".to_string(),
            "Alice".to_string(),
            Some("$argon2id$...".to_string()),
        );
        assert!(!user.user_id.is_empty());
        assert!(user.is_active);
        assert!(!user.is_subscriber);
        assert!(user.credential.is_none());
        assert!(user.upstream_account_id.is_none());
    }

    #[test]
    fn test_user_ids_are_unique() {
        let a = UserDoc::new("a".to_string(), "A".to_string(), None);
        let b = UserDoc::new("b".to_string(), "B".to_string(), None);
        assert_ne!(a.user_id, b.user_id);
    }
}
