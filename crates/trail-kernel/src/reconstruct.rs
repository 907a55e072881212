use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use trail_store::{
    CapturePolicy, ChangeRecord, ExclusionSet, Operation, PartitionState, RowSnapshot, StoreError,
    TrailBackend,
};

#[derive(Debug, Error)]
pub enum ReconstructionError {
    #[error("reconstruction store error: {0}")]
    Store(#[from] StoreError),
    #[error(
        "ambiguous history for {entity}/{row_id}: two records share \
         captured_at {captured_at}, transaction {transaction_id}, sequence {sequence}"
    )]
    Ambiguous {
        entity: String,
        row_id: String,
        captured_at: DateTime<Utc>,
        transaction_id: u64,
        sequence: u32,
    },
    #[error("inconsistent history for {entity}/{row_id} at record {record_id}: {detail}")]
    Inconsistent {
        entity: String,
        row_id: String,
        record_id: u64,
        detail: String,
    },
    #[error(
        "history of {entity}/{row_id} before {retained_from} has been retired; \
         cannot reconstruct as of {as_of}"
    )]
    HistoryRetired {
        entity: String,
        row_id: String,
        as_of: DateTime<Utc>,
        retained_from: DateTime<Utc>,
    },
    #[error("{pending} queued captures for {entity}/{row_id} are not yet in the change log")]
    PendingCaptures {
        entity: String,
        row_id: String,
        pending: u64,
    },
}

/// Current row state, as the primary datastore sees it.
pub trait PrimaryStore: Send + Sync {
    fn current_row(&self, entity: &str, row_id: &str) -> Result<Option<RowSnapshot>, StoreError>;
}

/// Derives current state from the newest change record. Used when the trail
/// runs apart from the primary datastore.
pub struct LatestRecordState {
    changelog: Arc<dyn TrailBackend>,
}

impl LatestRecordState {
    pub fn new(changelog: Arc<dyn TrailBackend>) -> Self {
        Self { changelog }
    }
}

impl PrimaryStore for LatestRecordState {
    fn current_row(&self, entity: &str, row_id: &str) -> Result<Option<RowSnapshot>, StoreError> {
        let latest = self.changelog.history(entity, row_id, 1)?;
        Ok(latest.into_iter().next().and_then(|record| match record.operation {
            Operation::Delete => None,
            Operation::Insert | Operation::Update => record.new_snapshot,
        }))
    }
}

/// A reconstructed row. Fields whose historical value was redacted are listed
/// in `unknown` and never appear in `fields`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HistoricalState {
    pub fields: RowSnapshot,
    pub unknown: BTreeSet<String>,
}

impl HistoricalState {
    fn from_snapshot(snapshot: RowSnapshot, redacted: &BTreeSet<String>) -> Self {
        let mut state = Self {
            fields: snapshot,
            unknown: BTreeSet::new(),
        };
        state.forget(redacted.iter());
        state
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn is_unknown(&self, field: &str) -> bool {
        self.unknown.contains(field)
    }

    fn forget<'a>(&mut self, fields: impl Iterator<Item = &'a String>) {
        for field in fields {
            self.fields.remove(field);
            self.unknown.insert(field.clone());
        }
    }

    /// Rolls one update back: fields take their pre-update values, fields the
    /// update introduced disappear.
    fn undo_update(&mut self, record: &ChangeRecord) {
        if let Some(new) = &record.new_snapshot {
            for field in new.fields() {
                let existed_before = record
                    .old_snapshot
                    .as_ref()
                    .map(|old| old.contains(field))
                    .unwrap_or(false);
                if !existed_before && !record.redacted_fields.contains(field) {
                    self.fields.remove(field);
                    self.unknown.remove(field);
                }
            }
        }
        if let Some(old) = &record.old_snapshot {
            for (field, value) in old.iter() {
                self.fields.insert(field.clone(), value.clone());
                self.unknown.remove(field);
            }
        }
        self.forget(record.redacted_fields.iter());
    }
}

pub struct ReconstructionEngine {
    changelog: Arc<dyn TrailBackend>,
    primary: Arc<dyn PrimaryStore>,
    policy: Arc<dyn CapturePolicy>,
}

impl ReconstructionEngine {
    pub fn new(
        changelog: Arc<dyn TrailBackend>,
        primary: Arc<dyn PrimaryStore>,
        policy: Arc<dyn CapturePolicy>,
    ) -> Self {
        Self {
            changelog,
            primary,
            policy,
        }
    }

    /// State of the row as of `as_of`, including changes captured exactly at
    /// `as_of`. `None` means the row did not exist.
    pub fn reconstruct(
        &self,
        entity: &str,
        row_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Option<HistoricalState>, ReconstructionError> {
        self.ensure_history_complete(entity, row_id, as_of)?;
        let exclusions = self.policy.exclusions_for(entity)?;
        let mut running = self
            .primary
            .current_row(entity, row_id)?
            .map(|row| starting_state(row, &exclusions));

        let records = self.changelog.changes_after(entity, row_id, as_of)?;
        ensure_unambiguous(entity, row_id, &records)?;
        debug!(entity = %entity, row_id = %row_id, records = records.len(), "replaying backward");

        for record in &records {
            let inconsistent = |detail: &str| ReconstructionError::Inconsistent {
                entity: entity.to_string(),
                row_id: row_id.to_string(),
                record_id: record.id,
                detail: detail.to_string(),
            };
            running = match (record.operation, running) {
                (Operation::Insert, Some(_)) => None,
                (Operation::Insert, None) => {
                    return Err(inconsistent("insert while the row was already absent"))
                }
                (Operation::Update, Some(mut state)) => {
                    state.undo_update(record);
                    Some(state)
                }
                (Operation::Update, None) => {
                    return Err(inconsistent("update of a row that did not exist"))
                }
                (Operation::Delete, None) => {
                    let old = record
                        .old_snapshot
                        .clone()
                        .ok_or_else(|| inconsistent("delete without an old snapshot"))?;
                    Some(HistoricalState::from_snapshot(old, &record.redacted_fields))
                }
                (Operation::Delete, Some(_)) => {
                    return Err(inconsistent("delete of a row that still exists afterwards"))
                }
            };
        }

        Ok(running.map(|mut state| {
            state.forget(exclusions.fields());
            state
        }))
    }

    /// Backward replay needs every change after `as_of`. Retired partitions
    /// and unpromoted queue entries both leave holes in that suffix.
    fn ensure_history_complete(
        &self,
        entity: &str,
        row_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<(), ReconstructionError> {
        let retained_from = self
            .changelog
            .list_partitions()?
            .into_iter()
            .filter(|partition| partition.state != PartitionState::Active)
            .filter_map(|partition| partition.bounds.map(|bounds| bounds.end))
            .max();
        if let Some(retained_from) = retained_from {
            if as_of < retained_from {
                return Err(ReconstructionError::HistoryRetired {
                    entity: entity.to_string(),
                    row_id: row_id.to_string(),
                    as_of,
                    retained_from,
                });
            }
        }

        let pending = self.changelog.queued_for_row(entity, row_id)?;
        if pending > 0 {
            return Err(ReconstructionError::PendingCaptures {
                entity: entity.to_string(),
                row_id: row_id.to_string(),
                pending,
            });
        }
        Ok(())
    }
}

fn starting_state(row: RowSnapshot, exclusions: &ExclusionSet) -> HistoricalState {
    let mut state = HistoricalState {
        fields: row,
        unknown: BTreeSet::new(),
    };
    state.forget(exclusions.fields());
    state
}

/// Records arrive sorted by the replay key; equal neighbours mean the order
/// cannot be decided.
fn ensure_unambiguous(
    entity: &str,
    row_id: &str,
    records: &[ChangeRecord],
) -> Result<(), ReconstructionError> {
    for pair in records.windows(2) {
        if pair[0].ordering_key() == pair[1].ordering_key() {
            return Err(ReconstructionError::Ambiguous {
                entity: entity.to_string(),
                row_id: row_id.to_string(),
                captured_at: pair[0].captured_at,
                transaction_id: pair[0].transaction_id,
                sequence: pair[0].sequence,
            });
        }
    }
    Ok(())
}
