use mongodb::bson::DateTime as BsonDateTime;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::Config;
use crate::handlers::{persist_upload, CsvSource};
use crate::mapping::{resolve_columns, FieldMapper};
use crate::models::*;
use crate::processing::{ImageFetcher, ImageSideloader};
use crate::storage::{AttachmentStore, ContentStore, SessionStore};
use crate::sync::RowImporter;

/// Saves of a finished batch are retried this many times on version conflicts.
const MAX_SAVE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub batch_size: usize,
    pub lease_ttl: Duration,
    pub upload_dir: PathBuf,
}

impl EngineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            batch_size: cfg.default_batch_size.max(1),
            lease_ttl: cfg.batch_lease(),
            upload_dir: cfg.upload_dir.clone(),
        }
    }
}

/// Result of preparing an import: what the driver needs to build a mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedImport {
    pub token: String,
    pub headers: Vec<String>,
    pub allowed_field_types: Vec<FieldType>,
}

/// Drives resumable CSV imports. Holds no per-session state of its own;
/// everything lives in the session store between calls.
#[derive(Clone)]
pub struct ImportEngine {
    sessions: Arc<dyn SessionStore>,
    importer: RowImporter,
    settings: EngineSettings,
}

impl ImportEngine {
    pub fn new(sessions: Arc<dyn SessionStore>, importer: RowImporter, settings: EngineSettings) -> Self {
        Self { sessions, importer, settings }
    }

    /// Wire an engine from configuration and concrete collaborators.
    pub fn from_config(
        cfg: &Config,
        sessions: Arc<dyn SessionStore>,
        content: Arc<dyn ContentStore>,
        attachments: Arc<dyn AttachmentStore>,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Result<Self> {
        let mapper = FieldMapper::new(cfg.site_offset()?, &cfg.post_type, &cfg.post_status);
        let sideloader = ImageSideloader::new(fetcher, attachments);
        let importer = RowImporter::new(mapper, content, sideloader);
        Ok(Self::new(sessions, importer, EngineSettings::from_config(cfg)))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Read the header row of a stored CSV and open a session for it.
    pub async fn prepare(&self, source_path: &Path, original_filename: Option<&str>) -> Result<PreparedImport> {
        let source = CsvSource::new(source_path);
        let headers = tokio::task::spawn_blocking(move || source.read_headers())
            .await
            .map_err(|e| ImportError::EmptyOrUnreadableFile(e.to_string()))??;

        let token = Uuid::new_v4().simple().to_string();
        let session = ImportSession::new(
            token.clone(),
            source_path.to_string_lossy().into_owned(),
            original_filename.map(str::to_string),
            headers.clone(),
        );
        self.sessions.create(&session).await?;

        tracing::info!(
            token = %token,
            path = %source_path.display(),
            columns = headers.len(),
            "Prepared import session"
        );

        Ok(PreparedImport {
            token,
            headers,
            allowed_field_types: FieldType::ALL.to_vec(),
        })
    }

    /// Store an uploaded file under the upload directory, then prepare it.
    pub async fn prepare_upload(&self, filename: &str, bytes: &[u8]) -> Result<PreparedImport> {
        let path = persist_upload(&self.settings.upload_dir, filename, bytes).await?;
        match self.prepare(&path, Some(filename)).await {
            Ok(prepared) => Ok(prepared),
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(path = %path.display(), error = %rm, "Failed to remove rejected upload");
                }
                Err(e)
            }
        }
    }

    /// Run the next sequential batch. `request` is only read while the
    /// session has no frozen mapping yet.
    pub async fn process_batch(&self, token: &str, request: Option<&BatchRequest>) -> Result<BatchProgress> {
        self.run_batch(token, request, false).await
    }

    /// Re-run exactly the rows whose latest attempt failed.
    pub async fn retry_failed(&self, token: &str) -> Result<BatchProgress> {
        self.run_batch(token, None, true).await
    }

    pub async fn progress(&self, token: &str) -> Result<BatchProgress> {
        let session = self.sessions.load(token).await?;
        Ok(BatchProgress::from(&session))
    }

    /// Drop sessions idle for longer than `ttl` along with their uploads.
    /// Returns the number of sessions removed.
    pub async fn evict_stale_sessions(&self, ttl: Duration) -> Result<usize> {
        let cutoff_ms = BsonDateTime::now().timestamp_millis() - ttl.as_millis() as i64;
        let stale = self.sessions.evict_stale(BsonDateTime::from_millis(cutoff_ms)).await?;

        for session in &stale {
            let path = Path::new(&session.source_path);
            if !path.starts_with(&self.settings.upload_dir) {
                continue;
            }
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(token = %session.token, path = %path.display(), error = %e, "Failed to delete upload of evicted session")
                }
            }
        }

        if !stale.is_empty() {
            tracing::info!(evicted = stale.len(), ttl_secs = ttl.as_secs(), "Evicted stale import sessions");
        }
        Ok(stale.len())
    }

    async fn run_batch(&self, token: &str, request: Option<&BatchRequest>, retry: bool) -> Result<BatchProgress> {
        let mut session = self.sessions.load(token).await?;
        let mut dirty = false;

        if let Some(abandoned) = session.recover_expired_claim(BsonDateTime::now(), self.settings.lease_ttl) {
            tracing::warn!(
                token = %token,
                claim_id = %abandoned.claim_id,
                rows = abandoned.indices.len(),
                "Recovered abandoned batch; rows marked as failed"
            );
            dirty = true;
        }
        if session.in_flight.is_some() {
            return Err(ImportError::BatchInProgress(token.to_string()));
        }

        if session.mapping.is_none() {
            let columns = request
                .map(|r| resolve_columns(&session.headers, &r.columns))
                .unwrap_or_default();
            if columns.is_empty() {
                return Err(ImportError::MappingRequired);
            }
            let total_rows = self.count_rows(&session.source_path).await?;
            let skip_duplicates = request.map(|r| r.skip_duplicates).unwrap_or(false);
            session.freeze_mapping(columns, skip_duplicates, total_rows);
            dirty = true;
            tracing::info!(token = %token, total_rows, skip_duplicates, "Froze column mapping");
        }

        let indices = session.select_batch(retry, self.settings.batch_size);
        if indices.is_empty() {
            if dirty {
                self.save(&mut session).await?;
            }
            let mut progress = BatchProgress::from(&session);
            progress.done = true;
            return Ok(progress);
        }

        let started = Instant::now();
        let rows = self.read_rows(&session.source_path, &indices).await?;

        let claim_id = Uuid::new_v4().to_string();
        session.claim(indices.clone(), retry, claim_id.clone(), BsonDateTime::now());
        self.save(&mut session).await.map_err(|e| match e {
            ImportError::Conflict(_) => ImportError::BatchInProgress(token.to_string()),
            other => other,
        })?;

        tracing::info!(
            token = %token,
            retry,
            first_row = indices.first().copied().unwrap_or_default(),
            rows = indices.len(),
            "Starting import batch"
        );

        let outcomes = self.import_rows(&session, &indices, &rows).await;
        let session = self.record_outcomes(session, &claim_id, &outcomes).await?;
        let progress = BatchProgress::from(&session);

        tracing::info!(
            token = %token,
            imported = progress.imported,
            skipped = progress.skipped,
            failed = progress.failed,
            total = progress.total,
            done = progress.done,
            duration_ms = started.elapsed().as_millis() as u64,
            "Finished import batch"
        );
        Ok(progress)
    }

    async fn import_rows(
        &self,
        session: &ImportSession,
        indices: &[u64],
        rows: &BTreeMap<u64, Vec<String>>,
    ) -> Vec<(u64, OutcomeKind)> {
        let mut outcomes = Vec::with_capacity(indices.len());
        let Some(mapping) = session.mapping.as_ref() else {
            return outcomes;
        };

        for &index in indices {
            let row = rows.get(&index).map(Vec::as_slice).unwrap_or_default();
            let outcome = self.importer.import(mapping, &session.headers, row).await;
            match &outcome {
                RowOutcome::Imported(id) => {
                    tracing::debug!(token = %session.token, row = index, post_id = %id, "Row imported")
                }
                RowOutcome::Skipped(id) => {
                    tracing::debug!(token = %session.token, row = index, existing_id = %id, "Row skipped as duplicate")
                }
                RowOutcome::Failed(e) => {
                    tracing::warn!(token = %session.token, row = index, error = %e, "Row import failed")
                }
            }
            outcomes.push((index, OutcomeKind::from(&outcome)));
        }
        outcomes
    }

    async fn record_outcomes(
        &self,
        mut session: ImportSession,
        claim_id: &str,
        outcomes: &[(u64, OutcomeKind)],
    ) -> Result<ImportSession> {
        let mut attempt = 1;
        loop {
            if !session.apply_outcomes(claim_id, outcomes) {
                tracing::warn!(
                    token = %session.token,
                    claim_id = %claim_id,
                    rows = outcomes.len(),
                    "Batch lease was recovered by another call; dropping its outcomes"
                );
                return Ok(session);
            }
            match self.save(&mut session).await {
                Ok(()) => return Ok(session),
                Err(ImportError::Conflict(_)) if attempt < MAX_SAVE_ATTEMPTS => {
                    tracing::debug!(token = %session.token, attempt, "Session changed during batch; reapplying outcomes");
                    session = self.sessions.load(&session.token).await?;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(token = %session.token, error = %e, "Failed to record batch outcomes");
                    return Err(e);
                }
            }
        }
    }

    async fn save(&self, session: &mut ImportSession) -> Result<()> {
        let expected = session.next_revision();
        self.sessions.compare_and_swap(expected, session).await
    }

    async fn count_rows(&self, source_path: &str) -> Result<u64> {
        let source = CsvSource::new(source_path);
        tokio::task::spawn_blocking(move || source.count_rows())
            .await
            .map_err(|e| ImportError::Transport(e.to_string()))?
            .map_err(into_transport)
    }

    async fn read_rows(&self, source_path: &str, indices: &[u64]) -> Result<BTreeMap<u64, Vec<String>>> {
        let source = CsvSource::new(source_path);
        let wanted: BTreeSet<u64> = indices.iter().copied().collect();
        tokio::task::spawn_blocking(move || source.read_rows(&wanted))
            .await
            .map_err(|e| ImportError::Transport(e.to_string()))?
            .map_err(into_transport)
    }
}

fn into_transport(e: ImportError) -> ImportError {
    match e {
        ImportError::Transport(_) => e,
        other => {
            tracing::error!(error = %other, "Unable to read CSV source");
            ImportError::Transport(other.to_string())
        }
    }
}
