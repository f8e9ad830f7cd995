use chrono::{DateTime, NaiveDateTime, Utc};
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use crate::models::{ImportError, Result};

/// Publish date of a post in the site's local time plus its UTC equivalent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostDate {
    pub local: NaiveDateTime,
    pub gmt: DateTime<Utc>,
}

/// Content fields of a post about to be inserted into the content store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewPost {
    pub post_type: String,
    pub status: String,
    pub title: String,
    pub content: String,
    pub excerpt: String,
    pub slug: Option<String>,
    pub date: Option<PostDate>,
}

impl NewPost {
    pub fn new(post_type: &str, status: &str) -> Self {
        Self {
            post_type: post_type.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    /// Stores refuse posts that carry no text at all.
    pub fn ensure_insertable(&self) -> Result<()> {
        if self.title.trim().is_empty()
            && self.content.trim().is_empty()
            && self.excerpt.trim().is_empty()
        {
            return Err(ImportError::Storage(
                "Content, title, and excerpt are empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomField {
    pub key: String,
    pub value: serde_json::Value,
}

/// Structured result of mapping one CSV row. Lives only for the duration of
/// a single row import.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedRecord {
    pub post: NewPost,
    pub image_url: Option<String>,
    pub image_alt: Option<String>,
    pub additional_images: Option<String>,
    pub custom_fields: Vec<CustomField>,
}

impl ImportedRecord {
    pub fn new(post: NewPost) -> Self {
        Self {
            post,
            image_url: None,
            image_alt: None,
            additional_images: None,
            custom_fields: Vec::new(),
        }
    }

    /// Set or replace a custom field, keeping first-seen key order.
    pub fn set_custom_field(&mut self, key: String, value: serde_json::Value) {
        if let Some(existing) = self.custom_fields.iter_mut().find(|f| f.key == key) {
            existing.value = value;
        } else {
            self.custom_fields.push(CustomField { key, value });
        }
    }
}

/// Result of importing one row.
#[derive(Debug)]
pub enum RowOutcome {
    Imported(ObjectId),
    /// A post with the same slug already exists
    Skipped(ObjectId),
    Failed(ImportError),
}
