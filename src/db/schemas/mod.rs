//! Database schemas for usher
//!
//! Defines MongoDB document structures for users and browser sessions.

mod metadata;
mod session;
mod user;

pub use metadata::Metadata;
pub use session::{SessionDoc, SESSION_COLLECTION};
pub use user::{UserDoc, USER_COLLECTION};
