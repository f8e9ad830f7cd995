use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::{doc, oid::ObjectId, DateTime as BsonDateTime};
use mongodb::options::UpdateOptions;
use mongodb::{Collection, Database};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{base_slug, numbered_slug, ContentStore, SessionStore};
use crate::models::*;

pub const POSTS_COLLECTION: &str = "posts";
pub const POST_META_COLLECTION: &str = "post_meta";
pub const SESSIONS_COLLECTION: &str = "import_sessions";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostDocument {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub post_type: String,
    pub status: String,
    pub title: String,
    pub content: String,
    pub excerpt: String,
    pub slug: String,
    pub date_local: Option<String>,
    pub date_gmt: Option<BsonDateTime>,
    pub featured_image_id: Option<ObjectId>,
    pub created_at: BsonDateTime,
}

#[derive(Clone)]
pub struct MongoContentStore {
    db: Database,
}

impl MongoContentStore {
    pub fn with_db(db: Database) -> Self {
        Self { db }
    }

    fn posts(&self) -> Collection<PostDocument> {
        self.db.collection(POSTS_COLLECTION)
    }
}

#[async_trait]
impl ContentStore for MongoContentStore {
    async fn find_by_slug(&self, slug: &str, post_type: &str) -> Result<Option<ObjectId>> {
        let found = self
            .posts()
            .find_one(doc! { "slug": slug, "post_type": post_type }, None)
            .await?;
        Ok(found.map(|p| p.id))
    }

    async fn insert(&self, post: &NewPost) -> Result<ObjectId> {
        post.ensure_insertable()?;

        let id = ObjectId::new();
        let base = base_slug(post, id);
        let mut slug = base.clone();
        let mut n = 2;
        while self.find_by_slug(&slug, &post.post_type).await?.is_some() {
            slug = numbered_slug(&base, n);
            n += 1;
        }

        let document = PostDocument {
            id,
            post_type: post.post_type.clone(),
            status: post.status.clone(),
            title: post.title.clone(),
            content: post.content.clone(),
            excerpt: post.excerpt.clone(),
            slug,
            date_local: post.date.as_ref().map(|d| d.local.format("%Y-%m-%d %H:%M:%S").to_string()),
            date_gmt: post.date.as_ref().map(|d| BsonDateTime::from_chrono(d.gmt)),
            featured_image_id: None,
            created_at: BsonDateTime::now(),
        };
        self.posts().insert_one(&document, None).await?;

        tracing::debug!(post_id = %id, slug = %document.slug, "Inserted post");
        Ok(id)
    }

    async fn set_primary_image(&self, entry: ObjectId, attachment: ObjectId) -> Result<()> {
        self.posts()
            .update_one(
                doc! { "_id": entry },
                doc! { "$set": { "featured_image_id": attachment } },
                None,
            )
            .await?;
        Ok(())
    }

    async fn set_custom_field(&self, entry: ObjectId, key: &str, value: &Value) -> Result<()> {
        let collection: Collection<mongodb::bson::Document> = self.db.collection(POST_META_COLLECTION);
        let meta_value = mongodb::bson::to_bson(value)?;
        let options = UpdateOptions::builder().upsert(true).build();
        collection
            .update_one(
                doc! { "post_id": entry, "meta_key": key },
                doc! { "$set": { "meta_value": meta_value, "updated_at": BsonDateTime::now() } },
                options,
            )
            .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct MongoSessionStore {
    db: Database,
}

impl MongoSessionStore {
    pub fn with_db(db: Database) -> Self {
        Self { db }
    }

    fn sessions(&self) -> Collection<ImportSession> {
        self.db.collection(SESSIONS_COLLECTION)
    }
}

#[async_trait]
impl SessionStore for MongoSessionStore {
    async fn create(&self, session: &ImportSession) -> Result<()> {
        self.sessions().insert_one(session, None).await?;
        Ok(())
    }

    async fn load(&self, token: &str) -> Result<ImportSession> {
        self.sessions()
            .find_one(doc! { "_id": token }, None)
            .await?
            .ok_or_else(|| ImportError::SessionNotFound(token.to_string()))
    }

    async fn compare_and_swap(&self, expected_version: u64, session: &ImportSession) -> Result<()> {
        let filter = doc! { "_id": session.token.as_str(), "version": expected_version as i64 };
        let result = self.sessions().replace_one(filter, session, None).await?;
        if result.matched_count == 0 {
            return Err(ImportError::Conflict(session.token.clone()));
        }
        Ok(())
    }

    async fn evict_stale(&self, older_than: BsonDateTime) -> Result<Vec<ImportSession>> {
        let filter = doc! { "updated_at": { "$lt": older_than } };
        let mut cursor = self.sessions().find(filter, None).await?;

        let mut stale = Vec::new();
        while let Some(session) = cursor.next().await {
            stale.push(session?);
        }

        if !stale.is_empty() {
            let tokens: Vec<&str> = stale.iter().map(|s| s.token.as_str()).collect();
            self.sessions()
                .delete_many(doc! { "_id": { "$in": tokens } }, None)
                .await?;
        }
        Ok(stale)
    }
}
