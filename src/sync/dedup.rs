use mongodb::bson::oid::ObjectId;
use std::sync::Arc;

use crate::mapping::sanitize::sanitize_title;
use crate::models::*;
use crate::storage::ContentStore;

/// Slug a row would be published under: its mapped slug, else one derived
/// from the title. `None` when neither gives anything to compare.
pub fn slug_candidate(post: &NewPost) -> Option<String> {
    if let Some(slug) = post.slug.as_deref().filter(|s| !s.is_empty()) {
        return Some(slug.to_string());
    }
    let from_title = sanitize_title(&post.title);
    (!from_title.is_empty()).then_some(from_title)
}

#[derive(Clone)]
pub struct DedupChecker {
    content: Arc<dyn ContentStore>,
}

impl DedupChecker {
    pub fn new(content: Arc<dyn ContentStore>) -> Self {
        Self { content }
    }

    /// Id of an existing post of the same type and slug, if any.
    pub async fn find_existing(&self, post: &NewPost) -> Result<Option<ObjectId>> {
        match slug_candidate(post) {
            Some(slug) => self.content.find_by_slug(&slug, &post.post_type).await,
            None => Ok(None),
        }
    }
}
