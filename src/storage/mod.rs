pub mod memory;
pub mod mongo;

pub use memory::*;
pub use mongo::*;

use async_trait::async_trait;
use mongodb::bson::{oid::ObjectId, DateTime as BsonDateTime};
use serde_json::Value;

use crate::models::*;
use crate::processing::TempArtifact;

/// Meta key under which the raw additional-images string is kept.
pub const ADDITIONAL_IMAGES_KEY: &str = "additional_images";

/// Persistence for imported posts and their custom fields.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn find_by_slug(&self, slug: &str, post_type: &str) -> Result<Option<ObjectId>>;

    /// Insert a post; a taken slug is disambiguated rather than rejected.
    async fn insert(&self, post: &NewPost) -> Result<ObjectId>;

    async fn set_primary_image(&self, entry: ObjectId, attachment: ObjectId) -> Result<()>;

    async fn set_custom_field(&self, entry: ObjectId, key: &str, value: &Value) -> Result<()>;

    async fn set_additional_images_ref(&self, entry: ObjectId, raw: &str) -> Result<()> {
        self.set_custom_field(entry, ADDITIONAL_IMAGES_KEY, &Value::String(raw.to_string()))
            .await
    }
}

/// Media library the sideloaded images end up in.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn attach(&self, artifact: &TempArtifact, owner: ObjectId, filename: &str) -> Result<ObjectId>;

    async fn set_accessible_text(&self, attachment: ObjectId, text: &str) -> Result<()>;
}

/// Durable, per-token storage of import sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &ImportSession) -> Result<()>;

    /// Fails with [`ImportError::SessionNotFound`] for unknown tokens.
    async fn load(&self, token: &str) -> Result<ImportSession>;

    /// Replace the stored session only if its version is still
    /// `expected_version`; otherwise fail with [`ImportError::Conflict`].
    async fn compare_and_swap(&self, expected_version: u64, session: &ImportSession) -> Result<()>;

    /// Remove and return sessions not updated since `older_than`.
    async fn evict_stale(&self, older_than: BsonDateTime) -> Result<Vec<ImportSession>>;
}

/// Slug a new post starts from: its own, else one derived from the title,
/// else the entry id.
pub(crate) fn base_slug(post: &NewPost, id: ObjectId) -> String {
    let slug = post
        .slug
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| crate::mapping::sanitize::sanitize_title(&post.title));
    if slug.is_empty() {
        id.to_hex()
    } else {
        slug
    }
}

pub(crate) fn numbered_slug(base: &str, n: u32) -> String {
    format!("{}-{}", base, n)
}
