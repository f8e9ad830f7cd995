use async_trait::async_trait;
use image::ImageFormat;
use mongodb::bson::oid::ObjectId;
use reqwest::Client as HttpClient;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::AsyncReadExt;
use tokio::time::timeout;
use url::Url;

use crate::config::Config;
use crate::mapping::sanitize::{sanitize_file_name, sanitize_text_field};
use crate::models::{ImportError, Result};
use crate::storage::AttachmentStore;

/// Downloaded payload held in a temporary file. The file is removed when the
/// artifact is dropped, whichever way the sideload ends.
#[derive(Debug)]
pub struct TempArtifact {
    file: NamedTempFile,
    len: u64,
    mime_type: String,
}

impl TempArtifact {
    pub async fn from_bytes(bytes: &[u8], mime_type: &str) -> Result<Self> {
        let file = NamedTempFile::new()?;
        tokio::fs::write(file.path(), bytes).await?;
        Ok(Self {
            file,
            len: bytes.len() as u64,
            mime_type: mime_type.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn set_mime_type(&mut self, mime_type: impl Into<String>) {
        self.mime_type = mime_type.into();
    }

    async fn head(&self, n: usize) -> Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(self.path()).await?;
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let read = file.read(&mut buf[filled..]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<TempArtifact>;
}

/// Fetches images over HTTP(S) with a bounded time and size.
pub struct HttpImageFetcher {
    http_client: HttpClient,
    download_timeout: Duration,
    max_bytes: u64,
}

impl HttpImageFetcher {
    pub fn new(config: &Config) -> Result<Self> {
        let http_client = HttpClient::builder()
            .user_agent(&config.http_user_agent)
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .build()
            .map_err(|e| ImportError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            download_timeout: Duration::from_millis(config.image_processing_timeout_ms),
            max_bytes: config.max_image_size_mb * 1024 * 1024,
        })
    }

    async fn download(&self, url: &Url) -> Result<(Vec<u8>, String)> {
        let response = self
            .http_client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ImportError::Download(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(ImportError::Download(format!(
                "{}: HTTP {} {}",
                url,
                response.status().as_u16(),
                response.status().canonical_reason().unwrap_or("Unknown")
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        if !content_type.starts_with("image/") {
            tracing::warn!(url = %url, content_type = %content_type, "URL does not appear to be an image");
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ImportError::Download(format!("{}: {}", url, e)))?;
        if bytes.len() as u64 > self.max_bytes {
            return Err(ImportError::Download(format!(
                "{}: image too large ({} bytes)",
                url,
                bytes.len()
            )));
        }
        Ok((bytes.to_vec(), content_type))
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &Url) -> Result<TempArtifact> {
        tracing::debug!(url = %url, "Downloading image");
        let (bytes, content_type) = timeout(self.download_timeout, self.download(url))
            .await
            .map_err(|_| ImportError::Download(format!("{}: timed out", url)))??;
        TempArtifact::from_bytes(&bytes, &content_type).await
    }
}

/// Only absolute http(s) URLs with a host are fetched.
pub fn validate_image_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|_| ImportError::InvalidUrl(raw.to_string()))?;
    let web = matches!(url.scheme(), "http" | "https");
    let has_host = url.host_str().map(|h| !h.is_empty()).unwrap_or(false);
    if !web || !has_host {
        return Err(ImportError::InvalidUrl(raw.to_string()));
    }
    Ok(url)
}

/// Attachment file name: the last path segment, or a timestamped fallback.
pub fn attachment_filename(url: &Url) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(sanitize_file_name)
        .unwrap_or_default();
    if segment.is_empty() {
        format!("image_{}.jpg", chrono::Utc::now().timestamp())
    } else {
        segment
    }
}

fn sniff_mime(head: &[u8]) -> Option<String> {
    let mime = match image::guess_format(head).ok()? {
        ImageFormat::Png => mime::IMAGE_PNG.to_string(),
        ImageFormat::Jpeg => mime::IMAGE_JPEG.to_string(),
        ImageFormat::Gif => mime::IMAGE_GIF.to_string(),
        ImageFormat::Bmp => mime::IMAGE_BMP.to_string(),
        ImageFormat::WebP => "image/webp".to_string(),
        ImageFormat::Tiff => "image/tiff".to_string(),
        ImageFormat::Ico => "image/x-icon".to_string(),
        ImageFormat::Avif => "image/avif".to_string(),
        _ => return None,
    };
    Some(mime)
}

/// Downloads a remote image and registers it as an attachment owned by a post.
#[derive(Clone)]
pub struct ImageSideloader {
    fetcher: Arc<dyn ImageFetcher>,
    attachments: Arc<dyn AttachmentStore>,
}

impl ImageSideloader {
    pub fn new(fetcher: Arc<dyn ImageFetcher>, attachments: Arc<dyn AttachmentStore>) -> Self {
        Self { fetcher, attachments }
    }

    pub async fn sideload(&self, raw_url: &str, owner: ObjectId, alt_text: Option<&str>) -> Result<ObjectId> {
        let url = validate_image_url(raw_url)?;
        let mut artifact = self.fetcher.fetch(&url).await.map_err(|e| match e {
            ImportError::Download(_) => e,
            other => ImportError::Download(other.to_string()),
        })?;

        if artifact.is_empty() {
            return Err(ImportError::EmptyPayload(url.to_string()));
        }

        let head = artifact.head(32).await?;
        let mime_type = sniff_mime(&head)
            .ok_or_else(|| ImportError::Sideload(format!("{} is not a recognised image", url)))?;
        artifact.set_mime_type(mime_type);

        let filename = attachment_filename(&url);
        let attachment = self
            .attachments
            .attach(&artifact, owner, &filename)
            .await
            .map_err(|e| ImportError::Sideload(e.to_string()))?;

        let alt = alt_text.map(sanitize_text_field).unwrap_or_default();
        if !alt.is_empty() {
            self.attachments
                .set_accessible_text(attachment, &alt)
                .await
                .map_err(|e| ImportError::Sideload(e.to_string()))?;
        }

        tracing::debug!(
            url = %url,
            attachment_id = %attachment,
            post_id = %owner,
            bytes = artifact.len(),
            "Sideloaded image"
        );
        Ok(attachment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_validation() {
        assert!(validate_image_url("https://cdn.example.com/a.png").is_ok());
        assert!(validate_image_url(" http://example.com/x ").is_ok());
        for bad in ["not a url", "ftp://example.com/a.png", "file:///etc/passwd", "/relative.png"] {
            assert!(matches!(validate_image_url(bad), Err(ImportError::InvalidUrl(_))), "{}", bad);
        }
    }

    #[test]
    fn filenames_come_from_last_segment() {
        let url = Url::parse("https://example.com/media/My%20Photo.png?w=200").unwrap();
        assert_eq!(attachment_filename(&url), "My20Photo.png");

        let bare = Url::parse("https://example.com/").unwrap();
        let name = attachment_filename(&bare);
        assert!(name.starts_with("image_") && name.ends_with(".jpg"), "{}", name);
    }

    #[test]
    fn sniffs_common_formats() {
        assert_eq!(sniff_mime(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR").as_deref(), Some("image/png"));
        assert_eq!(sniff_mime(b"\xff\xd8\xff\xe0\0\x10JFIF").as_deref(), Some("image/jpeg"));
        assert_eq!(sniff_mime(b"GIF89a......").as_deref(), Some("image/gif"));
        assert!(sniff_mime(b"<html><body>404</body></html>").is_none());
    }

    #[tokio::test]
    async fn artifact_file_is_removed_on_drop() {
        let artifact = TempArtifact::from_bytes(b"abc", "image/png").await.unwrap();
        let path = artifact.path().to_path_buf();
        assert!(path.exists());
        assert_eq!(artifact.len(), 3);
        assert_eq!(artifact.head(2).await.unwrap(), b"ab");
        drop(artifact);
        assert!(!path.exists());
    }
}
