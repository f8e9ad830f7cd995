use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::models::{ImportError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Mongodb,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    pub store_backend: StoreBackend,
    pub mongodb_uri: String,
    pub mongodb_retry_writes: bool,
    pub database_name: String,
    pub auto_migrate: bool,
    pub upload_dir: PathBuf,
    pub default_batch_size: usize,
    pub batch_lease_secs: u64,
    pub session_ttl_hours: u64,
    pub enable_scheduler: bool,
    // e.g. "+02:00"; dates without an explicit offset are read in this zone
    pub site_utc_offset: String,
    pub post_type: String,
    pub post_status: String,
    pub http_timeout_ms: u64,
    pub http_user_agent: String,
    // Featured image storage
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_region: String,
    // Optional custom S3 endpoint (e.g., for MinIO: http://localhost:9000)
    pub aws_endpoint: Option<String>,
    pub aws_public_base_url: Option<String>,
    pub default_image_bucket: String,
    pub image_processing_timeout_ms: u64,
    pub max_image_size_mb: u64,
}

impl Config {
    pub fn from_env() -> Self {
    let get = |k: &str| std::env::var(k).ok();

    let port: u16 = get("PORT").and_then(|s| s.parse().ok()).unwrap_or(8089);
    let store_backend = match get("STORE_BACKEND").as_deref().map(str::trim) {
        Some("memory") => StoreBackend::Memory,
        _ => StoreBackend::Mongodb,
    };
    let mongodb_uri = get("MONGODB_URI").unwrap_or_else(|| "mongodb://localhost:27017".to_string());
    let mongodb_retry_writes: bool = get("MONGODB_RETRY_WRITES").and_then(|s| s.parse().ok()).unwrap_or(false);
    let database_name = get("DATABASE_NAME").unwrap_or_else(|| "post_import".to_string());
    let auto_migrate: bool = get("AUTO_MIGRATE").and_then(|s| s.parse().ok()).unwrap_or(false);
    let upload_dir = get("UPLOAD_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./uploads"));
    let default_batch_size: usize = get("DEFAULT_BATCH_SIZE").and_then(|s| s.parse().ok()).unwrap_or(10);
    let batch_lease_secs: u64 = get("BATCH_LEASE_SECS").and_then(|s| s.parse().ok()).unwrap_or(300);
    let session_ttl_hours: u64 = get("SESSION_TTL_HOURS").and_then(|s| s.parse().ok()).unwrap_or(72);
    let enable_scheduler: bool = get("ENABLE_SCHEDULER").and_then(|s| s.parse().ok()).unwrap_or(true);
    let site_utc_offset = get("SITE_UTC_OFFSET").unwrap_or_else(|| "+00:00".to_string());
    let post_type = get("POST_TYPE").unwrap_or_else(|| "post".to_string());
    let post_status = get("POST_STATUS").unwrap_or_else(|| "publish".to_string());
    let http_timeout_ms: u64 = get("HTTP_TIMEOUT_MS").and_then(|s| s.parse().ok()).unwrap_or(60000);
    let http_user_agent = get("HTTP_USER_AGENT").unwrap_or_else(|| "post-import-service/1.0".to_string());

    let aws_access_key_id = get("AWS_ACCESS_KEY_ID");
    let aws_secret_access_key = get("AWS_SECRET_ACCESS_KEY");
    let aws_region = get("AWS_REGION").unwrap_or_else(|| "eu-central-1".to_string());
    // Support both env var names
    let aws_endpoint = get("AWS_S3_ENDPOINT").or_else(|| get("AWS_ENDPOINT"));
    let aws_public_base_url = get("AWS_S3_PUBLIC_BASE_URL");
    let default_image_bucket = get("DEFAULT_IMAGE_BUCKET").unwrap_or_else(|| "post-images".to_string());
    let image_processing_timeout_ms: u64 = get("IMAGE_PROCESSING_TIMEOUT_MS").and_then(|s| s.parse().ok()).unwrap_or(30000);
    let max_image_size_mb: u64 = get("MAX_IMAGE_SIZE_MB").and_then(|s| s.parse().ok()).unwrap_or(50);

        Self {
            port,
            store_backend,
            mongodb_uri,
            mongodb_retry_writes,
            database_name,
            auto_migrate,
            upload_dir,
            default_batch_size: default_batch_size.max(1),
            batch_lease_secs,
            session_ttl_hours,
            enable_scheduler,
            site_utc_offset,
            post_type,
            post_status,
            http_timeout_ms,
            http_user_agent,
            aws_access_key_id,
            aws_secret_access_key,
            aws_region,
            aws_endpoint,
            aws_public_base_url,
            default_image_bucket,
            image_processing_timeout_ms,
            max_image_size_mb,
        }
    }

    pub fn site_offset(&self) -> Result<FixedOffset> {
        self.site_utc_offset.trim().parse::<FixedOffset>().map_err(|e| {
            ImportError::Configuration(format!("SITE_UTC_OFFSET '{}': {}", self.site_utc_offset, e))
        })
    }

    pub fn batch_lease(&self) -> Duration {
        Duration::from_secs(self.batch_lease_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_hours * 3600)
    }
}
