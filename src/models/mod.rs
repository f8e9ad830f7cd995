pub mod record;
pub mod session;

pub use record::*;
pub use session::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Semantic slot a CSV column can be mapped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldType {
    Title,
    Content,
    Excerpt,
    Slug,
    Date,
    ImageUrl,
    ImageAlt,
    AdditionalImages,
    CustomField,
}

impl FieldType {
    pub const ALL: [FieldType; 9] = [
        FieldType::Title,
        FieldType::Content,
        FieldType::Excerpt,
        FieldType::Slug,
        FieldType::Date,
        FieldType::ImageUrl,
        FieldType::ImageAlt,
        FieldType::AdditionalImages,
        FieldType::CustomField,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Title => "title",
            FieldType::Content => "content",
            FieldType::Excerpt => "excerpt",
            FieldType::Slug => "slug",
            FieldType::Date => "date",
            FieldType::ImageUrl => "image-url",
            FieldType::ImageAlt => "image-alt",
            FieldType::AdditionalImages => "additional-images",
            FieldType::CustomField => "custom-field",
        }
    }

    /// Human readable label shown next to the mapping dropdown
    pub fn label(&self) -> &'static str {
        match self {
            FieldType::Title => "Post Title",
            FieldType::Content => "Post Content",
            FieldType::Excerpt => "Post Excerpt",
            FieldType::Slug => "Slug",
            FieldType::Date => "Post Date",
            FieldType::ImageUrl => "Featured Image URL",
            FieldType::ImageAlt => "Featured Image Alt Text",
            FieldType::AdditionalImages => "Additional Image URLs (comma separated)",
            FieldType::CustomField => "Custom Field (specify key)",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self> {
        // Older clients still send the post_* column names
        let field = match s.trim() {
            "title" | "post_title" => FieldType::Title,
            "content" | "post_content" => FieldType::Content,
            "excerpt" | "post_excerpt" => FieldType::Excerpt,
            "slug" | "post_name" => FieldType::Slug,
            "date" | "post_date" => FieldType::Date,
            "image-url" | "image_url" => FieldType::ImageUrl,
            "image-alt" | "image_alt" => FieldType::ImageAlt,
            "additional-images" | "additional_images" => FieldType::AdditionalImages,
            "custom-field" | "custom_field" => FieldType::CustomField,
            other => {
                return Err(ImportError::Validation(format!("Unknown field type '{}'", other)))
            }
        };
        Ok(field)
    }
}

/// Coarse classification of an [`ImportError`], used to decide whether a
/// failure is surfaced to the driver, counted against a row, or aborts a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Row,
    Transport,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("The uploaded CSV appears to be empty or corrupted: {0}")]
    EmptyOrUnreadableFile(String),

    #[error("Invalid import session: {0}")]
    SessionNotFound(String),

    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    #[error("Please map at least one column")]
    MappingRequired,

    #[error("A batch is already running for import session {0}")]
    BatchInProgress(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid date '{0}'")]
    InvalidDate(String),

    #[error("Invalid URL provided for image download: {0}")]
    InvalidUrl(String),

    #[error("Image download failed: {0}")]
    Download(String),

    #[error("Downloaded file is empty: {0}")]
    EmptyPayload(String),

    #[error("Image sideload failed: {0}")]
    Sideload(String),

    #[error("Unable to read CSV source: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    CsvParsing(#[from] csv::Error),

    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("BSON serialization error: {0}")]
    Bson(#[from] mongodb::bson::ser::Error),

    #[error("Concurrent update of import session {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ImportError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ImportError::EmptyOrUnreadableFile(_)
            | ImportError::SessionNotFound(_)
            | ImportError::InvalidUpload(_)
            | ImportError::MappingRequired
            | ImportError::BatchInProgress(_)
            | ImportError::Validation(_) => ErrorClass::Validation,
            ImportError::Storage(_)
            | ImportError::InvalidDate(_)
            | ImportError::InvalidUrl(_)
            | ImportError::Download(_)
            | ImportError::EmptyPayload(_)
            | ImportError::Sideload(_) => ErrorClass::Row,
            ImportError::Transport(_) | ImportError::Io(_) | ImportError::CsvParsing(_) => {
                ErrorClass::Transport
            }
            ImportError::Database(_)
            | ImportError::Http(_)
            | ImportError::Serialization(_)
            | ImportError::Bson(_)
            | ImportError::Conflict(_)
            | ImportError::Configuration(_) => ErrorClass::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, ImportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_current_and_legacy_field_names() {
        assert_eq!("image-url".parse::<FieldType>().unwrap(), FieldType::ImageUrl);
        assert_eq!("post_name".parse::<FieldType>().unwrap(), FieldType::Slug);
        assert_eq!(" custom_field ".parse::<FieldType>().unwrap(), FieldType::CustomField);
        assert!("thumbnail".parse::<FieldType>().is_err());
    }

    #[test]
    fn error_classes() {
        assert_eq!(ImportError::SessionNotFound("x".into()).class(), ErrorClass::Validation);
        assert_eq!(ImportError::EmptyPayload("u".into()).class(), ErrorClass::Row);
        assert_eq!(ImportError::Transport("gone".into()).class(), ErrorClass::Transport);
        assert_eq!(ImportError::Conflict("t".into()).class(), ErrorClass::Internal);
    }
}
