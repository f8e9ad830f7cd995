use mongodb::bson::DateTime as BsonDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::models::{FieldType, RowOutcome};

/// One CSV column's frozen assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub header: String,
    pub field_type: FieldType,
    /// Only meaningful for `FieldType::CustomField`
    pub meta_key: Option<String>,
}

/// Mapping chosen on the first batch call; never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrozenMapping {
    pub columns: Vec<ColumnMapping>,
    pub skip_duplicates: bool,
    pub total_rows: u64,
}

/// Client supplied column assignment, validated against the session headers
/// before it is frozen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMappingInput {
    pub header: String,
    pub field_type: String,
    pub meta_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub columns: Vec<ColumnMappingInput>,
    pub skip_duplicates: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub imported: u64,
    pub skipped: u64,
    /// Failure events, not currently failing rows; never decremented
    pub failed: u64,
}

/// Claim on the batch window currently being executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightBatch {
    pub claim_id: String,
    pub indices: Vec<u64>,
    pub retry: bool,
    pub claimed_at: BsonDateTime,
}

impl InFlightBatch {
    pub fn is_expired(&self, now: BsonDateTime, lease: Duration) -> bool {
        let age_ms = now.timestamp_millis() - self.claimed_at.timestamp_millis();
        age_ms >= lease.as_millis() as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Created,
    Mapped,
    Running,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeKind {
    Imported,
    Skipped,
    Failed,
}

impl From<&RowOutcome> for OutcomeKind {
    fn from(outcome: &RowOutcome) -> Self {
        match outcome {
            RowOutcome::Imported(_) => OutcomeKind::Imported,
            RowOutcome::Skipped(_) => OutcomeKind::Skipped,
            RowOutcome::Failed(_) => OutcomeKind::Failed,
        }
    }
}

/// Persistent state of one CSV import, keyed by its token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSession {
    #[serde(rename = "_id")]
    pub token: String,
    pub source_path: String,
    pub original_filename: Option<String>,
    pub headers: Vec<String>,
    pub mapping: Option<FrozenMapping>,
    pub cursor: u64,
    pub counters: Counters,
    pub failed_rows: BTreeSet<u64>,
    pub in_flight: Option<InFlightBatch>,
    pub version: u64,
    pub created_at: BsonDateTime,
    pub updated_at: BsonDateTime,
}

impl ImportSession {
    pub fn new(
        token: String,
        source_path: String,
        original_filename: Option<String>,
        headers: Vec<String>,
    ) -> Self {
        let now = BsonDateTime::now();
        Self {
            token,
            source_path,
            original_filename,
            headers,
            mapping: None,
            cursor: 0,
            counters: Counters::default(),
            failed_rows: BTreeSet::new(),
            in_flight: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn total_rows(&self) -> u64 {
        self.mapping.as_ref().map(|m| m.total_rows).unwrap_or(0)
    }

    pub fn state(&self) -> SessionState {
        let Some(mapping) = &self.mapping else {
            return SessionState::Created;
        };
        if self.cursor >= mapping.total_rows && self.failed_rows.is_empty() && self.in_flight.is_none() {
            return SessionState::Complete;
        }
        let untouched = self.cursor == 0
            && self.counters == Counters::default()
            && self.failed_rows.is_empty()
            && self.in_flight.is_none();
        if untouched {
            SessionState::Mapped
        } else {
            SessionState::Running
        }
    }

    pub fn is_done(&self) -> bool {
        self.state() == SessionState::Complete
    }

    /// Freeze the column mapping. Returns false (and changes nothing) if a
    /// mapping was already frozen.
    pub fn freeze_mapping(&mut self, columns: Vec<ColumnMapping>, skip_duplicates: bool, total_rows: u64) -> bool {
        if self.mapping.is_some() {
            return false;
        }
        self.mapping = Some(FrozenMapping { columns, skip_duplicates, total_rows });
        true
    }

    /// Row indices the next call should process, in increasing order.
    pub fn select_batch(&self, retry: bool, batch_size: usize) -> Vec<u64> {
        if retry {
            return self.failed_rows.iter().copied().collect();
        }
        let total = self.total_rows();
        let end = self.cursor.saturating_add(batch_size as u64).min(total);
        (self.cursor..end).collect()
    }

    /// Reserve `indices` for execution: advance the cursor (sequential
    /// batches) or take them out of the failed set (retries).
    pub fn claim(&mut self, indices: Vec<u64>, retry: bool, claim_id: String, now: BsonDateTime) {
        if retry {
            for index in &indices {
                self.failed_rows.remove(index);
            }
        } else {
            self.cursor += indices.len() as u64;
        }
        self.in_flight = Some(InFlightBatch { claim_id, indices, retry, claimed_at: now });
    }

    /// Fold the outcomes of a claimed batch into the counters and failed set.
    /// Returns false, changing nothing, once the session no longer holds
    /// `claim_id`: its rows were recovered and are accounted for elsewhere.
    pub fn apply_outcomes(&mut self, claim_id: &str, outcomes: &[(u64, OutcomeKind)]) -> bool {
        if self.in_flight.as_ref().map(|b| b.claim_id.as_str()) != Some(claim_id) {
            return false;
        }
        for (index, kind) in outcomes {
            match kind {
                OutcomeKind::Imported => {
                    self.counters.imported += 1;
                    self.failed_rows.remove(index);
                }
                OutcomeKind::Skipped => {
                    self.counters.skipped += 1;
                    self.failed_rows.remove(index);
                }
                OutcomeKind::Failed => {
                    self.counters.failed += 1;
                    self.failed_rows.insert(*index);
                }
            }
        }
        self.in_flight = None;
        true
    }

    /// Release a claim whose lease ran out. Its rows never reported back,
    /// so they are counted as failed and become retryable.
    pub fn recover_expired_claim(&mut self, now: BsonDateTime, lease: Duration) -> Option<InFlightBatch> {
        let expired = self.in_flight.as_ref().map(|b| b.is_expired(now, lease)).unwrap_or(false);
        if !expired {
            return None;
        }
        let batch = self.in_flight.take()?;
        for index in &batch.indices {
            self.counters.failed += 1;
            self.failed_rows.insert(*index);
        }
        Some(batch)
    }

    /// Bump the version for a compare-and-swap save. Returns the version the
    /// store must still hold for the save to succeed.
    pub fn next_revision(&mut self) -> u64 {
        let expected = self.version;
        self.version += 1;
        self.updated_at = BsonDateTime::now();
        expected
    }
}

/// Progress snapshot returned to the driver after every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub token: String,
    pub imported: u64,
    pub skipped: u64,
    pub failed: u64,
    pub total: u64,
    pub cursor: u64,
    pub done: bool,
    pub retryable: bool,
    pub state: SessionState,
}

impl From<&ImportSession> for BatchProgress {
    fn from(session: &ImportSession) -> Self {
        Self {
            token: session.token.clone(),
            imported: session.counters.imported,
            skipped: session.counters.skipped,
            failed: session.counters.failed,
            total: session.total_rows(),
            cursor: session.cursor,
            done: session.is_done(),
            retryable: !session.failed_rows.is_empty(),
            state: session.state(),
        }
    }
}
