use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};
use trail_store::clock::truncate_to_millis;
use trail_store::{
    CaptureContext, CapturePolicy, CapturedChange, ChangeRecord, Clock, Operation, RowSnapshot,
    StoreError, TrailBackend,
};

use crate::diff::compute_diff;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("{operation} on {entity} is missing its {side} row")]
    MissingSnapshot {
        entity: String,
        operation: Operation,
        side: &'static str,
    },
    #[error("capture store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CaptureMode {
    /// The change record is written with the mutation.
    #[default]
    Sync,
    /// A queue entry is written with the mutation; a worker promotes it.
    Async,
}

impl FromStr for CaptureMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "sync" | "synchronous" => Ok(CaptureMode::Sync),
            "async" | "asynchronous" | "queued" => Ok(CaptureMode::Async),
            other => Err(format!("unknown capture mode: {other}")),
        }
    }
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureMode::Sync => f.write_str("sync"),
            CaptureMode::Async => f.write_str("async"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CaptureConfig {
    pub mode: CaptureMode,
    /// When set, a failed capture fails the mutation that triggered it.
    pub strict: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mode: CaptureMode::Sync,
            strict: true,
        }
    }
}

/// One row mutation as the host sees it.
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    pub entity: String,
    pub row_id: String,
    pub operation: Operation,
    pub old: Option<RowSnapshot>,
    pub new: Option<RowSnapshot>,
}

impl Mutation {
    pub fn insert(entity: impl Into<String>, row_id: impl Into<String>, new: RowSnapshot) -> Self {
        Self {
            entity: entity.into(),
            row_id: row_id.into(),
            operation: Operation::Insert,
            old: None,
            new: Some(new),
        }
    }

    pub fn update(
        entity: impl Into<String>,
        row_id: impl Into<String>,
        old: RowSnapshot,
        new: RowSnapshot,
    ) -> Self {
        Self {
            entity: entity.into(),
            row_id: row_id.into(),
            operation: Operation::Update,
            old: Some(old),
            new: Some(new),
        }
    }

    pub fn delete(entity: impl Into<String>, row_id: impl Into<String>, old: RowSnapshot) -> Self {
        Self {
            entity: entity.into(),
            row_id: row_id.into(),
            operation: Operation::Delete,
            old: Some(old),
            new: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    CaptureDisabled,
    NoChange,
    OnlyExcludedFields,
    /// Lenient mode swallowed a capture failure.
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureOutcome {
    Staged { sequence: u32 },
    Skipped(SkipReason),
}

/// What a committed capture transaction wrote.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommitReceipt {
    pub transaction_id: Option<u64>,
    pub records: Vec<ChangeRecord>,
    pub queued: Vec<u64>,
}

impl CommitReceipt {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.queued.is_empty()
    }
}

/// Entry point the primary store calls for every tracked mutation.
#[derive(Clone)]
pub struct CaptureInterceptor {
    config: CaptureConfig,
    policy: Arc<dyn CapturePolicy>,
    backend: Arc<dyn TrailBackend>,
    clock: Arc<dyn Clock>,
}

impl CaptureInterceptor {
    pub fn new(
        config: CaptureConfig,
        policy: Arc<dyn CapturePolicy>,
        backend: Arc<dyn TrailBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            policy,
            backend,
            clock,
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn begin(&self, context: CaptureContext) -> CaptureTransaction {
        CaptureTransaction {
            interceptor: self.clone(),
            context,
            transaction_id: None,
            next_sequence: 0,
            staged: Vec::new(),
        }
    }

    /// Captures a single mutation in its own transaction and commits it.
    pub fn capture_one(
        &self,
        context: CaptureContext,
        mutation: &Mutation,
    ) -> Result<CommitReceipt, CaptureError> {
        let mut tx = self.begin(context);
        tx.capture(mutation)?;
        tx.commit()
    }

    fn fail<T>(&self, err: CaptureError, fallback: T, entity: &str) -> Result<T, CaptureError> {
        if self.config.strict {
            return Err(err);
        }
        warn!(entity = %entity, error = %err, "capture failed, continuing without a record");
        Ok(fallback)
    }
}

/// Staged captures of one primary-store unit of work. Nothing is written until
/// `commit`; dropping the transaction discards everything staged.
pub struct CaptureTransaction {
    interceptor: CaptureInterceptor,
    context: CaptureContext,
    transaction_id: Option<u64>,
    next_sequence: u32,
    staged: Vec<CapturedChange>,
}

impl CaptureTransaction {
    pub fn transaction_id(&self) -> Option<u64> {
        self.transaction_id
    }

    pub fn staged(&self) -> &[CapturedChange] {
        &self.staged
    }

    pub fn capture(&mut self, mutation: &Mutation) -> Result<CaptureOutcome, CaptureError> {
        let interceptor = &self.interceptor;
        let entity = mutation.entity.as_str();
        let lookup = interceptor
            .policy
            .is_capture_enabled(entity)
            .and_then(|enabled| {
                if enabled {
                    interceptor.policy.exclusions_for(entity).map(Some)
                } else {
                    Ok(None)
                }
            });
        // without the current exclusions nothing may be written
        let exclusions = match lookup {
            Ok(Some(exclusions)) => exclusions,
            Ok(None) => return Ok(CaptureOutcome::Skipped(SkipReason::CaptureDisabled)),
            Err(err) => {
                return interceptor.fail(
                    err.into(),
                    CaptureOutcome::Skipped(SkipReason::Failed),
                    entity,
                )
            }
        };
        let diff = match compute_diff(
            entity,
            mutation.operation,
            mutation.old.as_ref(),
            mutation.new.as_ref(),
            &exclusions,
        ) {
            Ok(diff) => diff,
            Err(err) => {
                return interceptor.fail(err, CaptureOutcome::Skipped(SkipReason::Failed), entity)
            }
        };
        if diff.is_noop(mutation.operation) {
            debug!(entity = %entity, row_id = %mutation.row_id, "update changed nothing, no record");
            return Ok(CaptureOutcome::Skipped(SkipReason::NoChange));
        }
        if diff.is_redacted_only(mutation.operation) {
            debug!(
                entity = %entity,
                row_id = %mutation.row_id,
                "update touched only excluded fields, no record"
            );
            return Ok(CaptureOutcome::Skipped(SkipReason::OnlyExcludedFields));
        }

        let transaction_id = match self.transaction_id {
            Some(id) => id,
            None => match interceptor.backend.next_transaction_id() {
                Ok(id) => {
                    self.transaction_id = Some(id);
                    id
                }
                Err(err) => {
                    return interceptor.fail(
                        err.into(),
                        CaptureOutcome::Skipped(SkipReason::Failed),
                        entity,
                    )
                }
            },
        };
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.staged.push(CapturedChange {
            entity: mutation.entity.clone(),
            operation: mutation.operation,
            row_id: mutation.row_id.clone(),
            old_snapshot: diff.old_snapshot,
            new_snapshot: diff.new_snapshot,
            changed_fields: if mutation.operation == Operation::Update {
                diff.changed_fields
            } else {
                Default::default()
            },
            redacted_fields: diff.redacted_fields,
            captured_at: truncate_to_millis(interceptor.clock.now()),
            context: self.context.clone(),
            transaction_id,
            sequence,
        });
        Ok(CaptureOutcome::Staged { sequence })
    }

    /// Writes every staged capture in one store call: change records in sync
    /// mode, queue entries in async mode.
    pub fn commit(self) -> Result<CommitReceipt, CaptureError> {
        let CaptureTransaction {
            interceptor,
            transaction_id,
            staged,
            ..
        } = self;
        let mut receipt = CommitReceipt {
            transaction_id,
            ..CommitReceipt::default()
        };
        if staged.is_empty() {
            return Ok(receipt);
        }
        let entity = staged[0].entity.clone();
        let written = match interceptor.config.mode {
            CaptureMode::Sync => interceptor
                .backend
                .append(staged)
                .map(|records| receipt.records = records),
            CaptureMode::Async => {
                let now = interceptor.clock.now();
                interceptor
                    .backend
                    .enqueue(staged, now)
                    .map(|ids| receipt.queued = ids)
            }
        };
        match written {
            Ok(()) => Ok(receipt),
            Err(err) => interceptor.fail(err.into(), receipt, &entity),
        }
    }

    /// Discards everything staged. Same as dropping the transaction.
    pub fn rollback(self) {
        if !self.staged.is_empty() {
            debug!(
                transaction_id = ?self.transaction_id,
                staged = self.staged.len(),
                "capture transaction rolled back"
            );
        }
    }
}
