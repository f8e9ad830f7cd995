pub mod sanitize;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use crate::models::*;
use sanitize::{filter_html, sanitize_key, sanitize_text_field, sanitize_title};

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%b %d, %Y", "%B %d, %Y"];

/// Turns raw CSV rows into [`ImportedRecord`]s according to a frozen mapping.
#[derive(Debug, Clone)]
pub struct FieldMapper {
    site_offset: FixedOffset,
    post_type: String,
    post_status: String,
}

impl FieldMapper {
    pub fn new(site_offset: FixedOffset, post_type: &str, post_status: &str) -> Self {
        Self {
            site_offset,
            post_type: post_type.to_string(),
            post_status: post_status.to_string(),
        }
    }

    pub fn map_row(&self, mapping: &FrozenMapping, headers: &[String], row: &[String]) -> Result<ImportedRecord> {
        let mut record = ImportedRecord::new(NewPost::new(&self.post_type, &self.post_status));

        for column in &mapping.columns {
            let value = cell(headers, row, &column.header);
            match column.field_type {
                FieldType::Title => record.post.title = filter_html(value),
                FieldType::Content => record.post.content = filter_html(value),
                FieldType::Excerpt => record.post.excerpt = filter_html(value),
                FieldType::Slug => {
                    let slug = sanitize_title(value);
                    record.post.slug = (!slug.is_empty()).then_some(slug);
                }
                FieldType::Date => record.post.date = self.parse_date(value)?,
                FieldType::ImageUrl => record.image_url = non_empty(value.trim().to_string()),
                FieldType::ImageAlt => record.image_alt = non_empty(sanitize_text_field(value)),
                FieldType::AdditionalImages => {
                    record.additional_images = non_empty(sanitize_text_field(value))
                }
                FieldType::CustomField => {
                    if let Some(key) = column.meta_key.as_deref().filter(|k| !k.is_empty()) {
                        record.set_custom_field(key.to_string(), custom_value(value));
                    }
                }
            }
        }

        Ok(record)
    }

    /// Empty input leaves the date unset so the store picks its own default.
    pub fn parse_date(&self, raw: &str) -> Result<Option<PostDate>> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }

        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Ok(Some(PostDate {
                local: parsed.with_timezone(&self.site_offset).naive_local(),
                gmt: parsed.with_timezone(&Utc),
            }));
        }

        let local = DATETIME_FORMATS
            .iter()
            .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
            .or_else(|| {
                DATE_FORMATS
                    .iter()
                    .find_map(|f| NaiveDate::parse_from_str(raw, f).ok())
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })
            .ok_or_else(|| ImportError::InvalidDate(raw.to_string()))?;

        let gmt = self
            .site_offset
            .from_local_datetime(&local)
            .single()
            .ok_or_else(|| ImportError::InvalidDate(raw.to_string()))?
            .with_timezone(&Utc);

        Ok(Some(PostDate { local, gmt }))
    }
}

/// Validate client supplied column assignments against the session headers.
/// Unknown headers and field types are dropped; the result follows CSV
/// header order with one entry per distinct header.
pub fn resolve_columns(headers: &[String], inputs: &[ColumnMappingInput]) -> Vec<ColumnMapping> {
    let mut columns: Vec<ColumnMapping> = Vec::new();

    for header in headers {
        if columns.iter().any(|c| &c.header == header) {
            continue;
        }
        let Some(input) = inputs.iter().rev().find(|i| &i.header == header) else {
            continue;
        };
        let Ok(field_type) = input.field_type.parse::<FieldType>() else {
            tracing::debug!(header = %header, field_type = %input.field_type, "Dropping unknown field type");
            continue;
        };
        let meta_key = input
            .meta_key
            .as_deref()
            .map(sanitize_key)
            .filter(|k| !k.is_empty());
        columns.push(ColumnMapping { header: header.clone(), field_type, meta_key });
    }

    columns
}

/// Normalise a raw header row: trim, strip a leading BOM, plain-text sanitize.
pub fn normalize_headers<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .enumerate()
        .map(|(i, h)| {
            let h = h.as_ref();
            let h = if i == 0 { sanitize::strip_bom(h) } else { h };
            sanitize_text_field(h.trim())
        })
        .collect()
}

fn cell<'a>(headers: &[String], row: &'a [String], header: &str) -> &'a str {
    headers
        .iter()
        .rposition(|h| h == header)
        .and_then(|i| row.get(i))
        .map(String::as_str)
        .unwrap_or("")
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

fn custom_value(raw: &str) -> Value {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(v @ (Value::Object(_) | Value::Array(_))) = serde_json::from_str::<Value>(raw) {
            return v;
        }
    }
    Value::String(raw.to_string())
}
