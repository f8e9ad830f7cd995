use anyhow::Result;
use mongodb::bson::{doc, Document};
use mongodb::options::IndexOptions;
use mongodb::{Database, IndexModel};

use crate::processing::ATTACHMENTS_COLLECTION;
use crate::storage::{POSTS_COLLECTION, POST_META_COLLECTION, SESSIONS_COLLECTION};

/// Create the indexes the importer relies on. Safe to run repeatedly.
pub async fn ensure_indexes(db: &Database) -> Result<()> {
    tracing::info!(database = %db.name(), "Ensuring post import indexes");

    // posts: slug lookups for dedup and slug disambiguation
    let posts = db.collection::<Document>(POSTS_COLLECTION);
    posts.create_index(IndexModel::builder().keys(doc!{"post_type":1, "slug":1}).build(), None).await?;

    // post_meta: one value per (post, key)
    let meta = db.collection::<Document>(POST_META_COLLECTION);
    meta.create_index(
        IndexModel::builder()
            .keys(doc!{"post_id":1, "meta_key":1})
            .options(IndexOptions::builder().unique(true).build())
            .build(),
        None
    ).await?;

    // import_sessions: eviction scans by last update
    let sessions = db.collection::<Document>(SESSIONS_COLLECTION);
    sessions.create_index(IndexModel::builder().keys(doc!{"updated_at":1}).build(), None).await?;

    let attachments = db.collection::<Document>(ATTACHMENTS_COLLECTION);
    attachments.create_index(IndexModel::builder().keys(doc!{"owner_id":1}).build(), None).await?;

    Ok(())
}
