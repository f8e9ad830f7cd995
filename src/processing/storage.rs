use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{primitives::ByteStream, types::ObjectCannedAcl, Client as S3Client};
use mongodb::bson::{doc, oid::ObjectId, DateTime as BsonDateTime};
use mongodb::{Collection, Database};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::models::{ImportError, Result};
use crate::processing::TempArtifact;
use crate::storage::AttachmentStore;

pub const ATTACHMENTS_COLLECTION: &str = "attachments";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentDocument {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub owner_id: ObjectId,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub bucket: String,
    pub key: String,
    pub url: String,
    pub alt_text: Option<String>,
    pub created_at: BsonDateTime,
}

/// Attachments backed by an S3 bucket for the bytes and a Mongo collection
/// for the metadata.
pub struct S3AttachmentStore {
    client: S3Client,
    db: Database,
    bucket: String,
    region: String,
    public_base_url: Option<String>,
}

impl S3AttachmentStore {
    pub async fn new(config: &Config, db: Database) -> Result<Self> {
        let base_loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.aws_region.clone()));

        let loader = if let (Some(access_key), Some(secret_key)) =
            (&config.aws_access_key_id, &config.aws_secret_access_key) {
            let creds = aws_sdk_s3::config::Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "post-import-service",
            );
            base_loader.credentials_provider(creds)
        } else {
            base_loader
        };

        let shared_config = loader.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&shared_config);
        if let Some(endpoint) = &config.aws_endpoint {
            s3_config_builder = s3_config_builder
                .endpoint_url(endpoint)
                .force_path_style(true); // path-style is typical for MinIO
        }
        let client = S3Client::from_conf(s3_config_builder.build());

        Ok(Self {
            client,
            db,
            bucket: config.default_image_bucket.clone(),
            region: config.aws_region.clone(),
            public_base_url: config.aws_public_base_url.clone(),
        })
    }

    fn attachments(&self) -> Collection<AttachmentDocument> {
        self.db.collection(ATTACHMENTS_COLLECTION)
    }

    fn object_key(owner: ObjectId, id: ObjectId, filename: &str) -> String {
        format!("attachments/{}/{}-{}", owner.to_hex(), id.to_hex(), filename)
    }

    pub fn public_url(&self, key: &str) -> String {
        if let Some(base) = &self.public_base_url {
            let base = base.trim_end_matches('/');
            let sep = if base.ends_with('=') || base.contains('?') { "" } else { "/" };
            return format!("{}{}{}", base, sep, key);
        }
        if self.region == "us-east-1" {
            format!("https://{}.s3.amazonaws.com/{}", self.bucket, key)
        } else {
            format!("https://{}.s3.{}.amazonaws.com/{}", self.bucket, self.region, key)
        }
    }
}

#[async_trait]
impl AttachmentStore for S3AttachmentStore {
    async fn attach(&self, artifact: &TempArtifact, owner: ObjectId, filename: &str) -> Result<ObjectId> {
        let id = ObjectId::new();
        let key = Self::object_key(owner, id, filename);
        let body = ByteStream::from_path(artifact.path())
            .await
            .map_err(|e| ImportError::Storage(format!("Failed to read downloaded image: {}", e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .content_type(artifact.mime_type())
            .acl(ObjectCannedAcl::PublicRead)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, bucket = %self.bucket, key = %key, "Failed to upload image to S3");
                ImportError::Storage(format!("S3 upload failed: {}", e))
            })?;

        let document = AttachmentDocument {
            id,
            owner_id: owner,
            filename: filename.to_string(),
            mime_type: artifact.mime_type().to_string(),
            size_bytes: artifact.len() as i64,
            bucket: self.bucket.clone(),
            url: self.public_url(&key),
            key,
            alt_text: None,
            created_at: BsonDateTime::now(),
        };
        self.attachments().insert_one(&document, None).await?;

        tracing::debug!(
            attachment_id = %id,
            post_id = %owner,
            url = %document.url,
            size_bytes = document.size_bytes,
            "Stored attachment"
        );
        Ok(id)
    }

    async fn set_accessible_text(&self, attachment: ObjectId, text: &str) -> Result<()> {
        self.attachments()
            .update_one(
                doc! { "_id": attachment },
                doc! { "$set": { "alt_text": text } },
                None,
            )
            .await?;
        Ok(())
    }
}
