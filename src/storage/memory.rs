//! In-process stores, selected with `STORE_BACKEND=memory` and used by the
//! integration tests.

use async_trait::async_trait;
use mongodb::bson::{oid::ObjectId, DateTime as BsonDateTime};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{Mutex, RwLock};

use super::{base_slug, numbered_slug, AttachmentStore, ContentStore, SessionStore};
use crate::models::*;
use crate::processing::TempArtifact;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredPost {
    pub id: ObjectId,
    pub post: NewPost,
    pub slug: String,
    pub featured_image: Option<ObjectId>,
    pub meta: Vec<CustomField>,
}

impl StoredPost {
    pub fn meta_value(&self, key: &str) -> Option<&Value> {
        self.meta.iter().find(|f| f.key == key).map(|f| &f.value)
    }
}

#[derive(Default)]
pub struct MemoryContentStore {
    posts: RwLock<Vec<StoredPost>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Posts in insertion order.
    pub async fn posts(&self) -> Vec<StoredPost> {
        self.posts.read().await.clone()
    }

    pub async fn post(&self, id: ObjectId) -> Option<StoredPost> {
        self.posts.read().await.iter().find(|p| p.id == id).cloned()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn find_by_slug(&self, slug: &str, post_type: &str) -> Result<Option<ObjectId>> {
        let posts = self.posts.read().await;
        Ok(posts
            .iter()
            .find(|p| p.slug == slug && p.post.post_type == post_type)
            .map(|p| p.id))
    }

    async fn insert(&self, post: &NewPost) -> Result<ObjectId> {
        post.ensure_insertable()?;

        let mut posts = self.posts.write().await;
        let id = ObjectId::new();
        let base = base_slug(post, id);
        let taken = |slug: &str| posts.iter().any(|p| p.slug == slug && p.post.post_type == post.post_type);
        let mut slug = base.clone();
        let mut n = 2;
        while taken(&slug) {
            slug = numbered_slug(&base, n);
            n += 1;
        }

        posts.push(StoredPost {
            id,
            post: post.clone(),
            slug,
            featured_image: None,
            meta: Vec::new(),
        });
        Ok(id)
    }

    async fn set_primary_image(&self, entry: ObjectId, attachment: ObjectId) -> Result<()> {
        let mut posts = self.posts.write().await;
        let post = posts
            .iter_mut()
            .find(|p| p.id == entry)
            .ok_or_else(|| ImportError::Storage(format!("No post {}", entry)))?;
        post.featured_image = Some(attachment);
        Ok(())
    }

    async fn set_custom_field(&self, entry: ObjectId, key: &str, value: &Value) -> Result<()> {
        let mut posts = self.posts.write().await;
        let post = posts
            .iter_mut()
            .find(|p| p.id == entry)
            .ok_or_else(|| ImportError::Storage(format!("No post {}", entry)))?;
        match post.meta.iter_mut().find(|f| f.key == key) {
            Some(field) => field.value = value.clone(),
            None => post.meta.push(CustomField { key: key.to_string(), value: value.clone() }),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredAttachment {
    pub id: ObjectId,
    pub owner: ObjectId,
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub alt_text: Option<String>,
}

#[derive(Default)]
pub struct MemoryAttachmentStore {
    attachments: Mutex<Vec<StoredAttachment>>,
}

impl MemoryAttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attachments(&self) -> Vec<StoredAttachment> {
        self.attachments.lock().await.clone()
    }
}

#[async_trait]
impl AttachmentStore for MemoryAttachmentStore {
    async fn attach(&self, artifact: &TempArtifact, owner: ObjectId, filename: &str) -> Result<ObjectId> {
        let bytes = tokio::fs::read(artifact.path()).await?;
        let id = ObjectId::new();
        self.attachments.lock().await.push(StoredAttachment {
            id,
            owner,
            filename: filename.to_string(),
            mime_type: artifact.mime_type().to_string(),
            bytes,
            alt_text: None,
        });
        Ok(id)
    }

    async fn set_accessible_text(&self, attachment: ObjectId, text: &str) -> Result<()> {
        let mut attachments = self.attachments.lock().await;
        let stored = attachments
            .iter_mut()
            .find(|a| a.id == attachment)
            .ok_or_else(|| ImportError::Storage(format!("No attachment {}", attachment)))?;
        stored.alt_text = Some(text.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, ImportSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a session unconditionally, bypassing version checks.
    pub async fn overwrite(&self, session: ImportSession) {
        self.sessions.lock().await.insert(session.token.clone(), session);
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: &ImportSession) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&session.token) {
            return Err(ImportError::Conflict(session.token.clone()));
        }
        sessions.insert(session.token.clone(), session.clone());
        Ok(())
    }

    async fn load(&self, token: &str) -> Result<ImportSession> {
        self.sessions
            .lock()
            .await
            .get(token)
            .cloned()
            .ok_or_else(|| ImportError::SessionNotFound(token.to_string()))
    }

    async fn compare_and_swap(&self, expected_version: u64, session: &ImportSession) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&session.token) {
            Some(stored) if stored.version == expected_version => {
                *stored = session.clone();
                Ok(())
            }
            _ => Err(ImportError::Conflict(session.token.clone())),
        }
    }

    async fn evict_stale(&self, older_than: BsonDateTime) -> Result<Vec<ImportSession>> {
        let mut sessions = self.sessions.lock().await;
        let stale: Vec<String> = sessions
            .values()
            .filter(|s| s.updated_at < older_than)
            .map(|s| s.token.clone())
            .collect();
        Ok(stale.iter().filter_map(|t| sessions.remove(t)).collect())
    }
}
