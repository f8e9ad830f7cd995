use csv::{ByteRecord, ReaderBuilder};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::mapping::{normalize_headers, sanitize::sanitize_file_name};
use crate::models::*;

/// Sequential reader over an uploaded CSV file.
///
/// Nothing is cached between calls: every operation opens the file and scans
/// from the top, so a session only needs to persist the path.
#[derive(Debug, Clone)]
pub struct CsvSource {
    path: PathBuf,
}

impl CsvSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn reader(&self) -> Result<csv::Reader<File>> {
        let file = File::open(&self.path)?;
        Ok(ReaderBuilder::new().has_headers(true).flexible(true).from_reader(file))
    }

    /// Column names from the first row.
    pub fn read_headers(&self) -> Result<Vec<String>> {
        let unreadable = |e: &dyn std::fmt::Display| {
            ImportError::EmptyOrUnreadableFile(format!("{}: {}", self.path.display(), e))
        };
        let mut reader = self.reader().map_err(|e| unreadable(&e))?;
        let raw = reader.byte_headers().map_err(|e| unreadable(&e))?;
        if raw.is_empty() {
            return Err(ImportError::EmptyOrUnreadableFile(format!(
                "{} has no header row",
                self.path.display()
            )));
        }
        let headers = normalize_headers(raw.iter().map(|f| String::from_utf8_lossy(f)));
        tracing::debug!(path = %self.path.display(), columns = headers.len(), "Read CSV header row");
        Ok(headers)
    }

    /// Number of data rows, header excluded.
    pub fn count_rows(&self) -> Result<u64> {
        let mut reader = self.reader()?;
        let mut record = ByteRecord::new();
        let mut total = 0u64;
        while reader.read_byte_record(&mut record)? {
            total += 1;
        }
        Ok(total)
    }

    /// Re-derive the rows at `wanted` (zero-based, header excluded) by
    /// scanning from the top, stopping after the highest wanted index.
    /// Every wanted row must exist.
    pub fn read_rows(&self, wanted: &BTreeSet<u64>) -> Result<BTreeMap<u64, Vec<String>>> {
        let mut rows = BTreeMap::new();
        let Some(&last) = wanted.iter().next_back() else {
            return Ok(rows);
        };

        let mut reader = self.reader()?;
        let mut record = ByteRecord::new();
        let mut index = 0u64;
        while index <= last && reader.read_byte_record(&mut record)? {
            if wanted.contains(&index) {
                let cells = record.iter().map(|f| String::from_utf8_lossy(f).into_owned()).collect();
                rows.insert(index, cells);
            }
            index += 1;
        }

        if rows.len() != wanted.len() {
            return Err(ImportError::Transport(format!(
                "{} ended after {} rows, expected row {}",
                self.path.display(),
                index,
                last
            )));
        }
        Ok(rows)
    }
}

/// Store an uploaded CSV under `upload_dir` with a collision-free name.
pub async fn persist_upload(upload_dir: &Path, original_name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let is_csv = Path::new(original_name)
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);
    if !is_csv {
        return Err(ImportError::InvalidUpload(format!(
            "'{}' is not a .csv file",
            original_name
        )));
    }

    tokio::fs::create_dir_all(upload_dir).await?;
    let mut name = sanitize_file_name(original_name);
    if name.is_empty() {
        name = "upload.csv".to_string();
    }
    let path = upload_dir.join(format!("{}-{}", uuid::Uuid::new_v4().simple(), name));
    tokio::fs::write(&path, bytes).await?;

    tracing::info!(path = %path.display(), bytes = bytes.len(), "Stored uploaded CSV");
    Ok(path)
}
