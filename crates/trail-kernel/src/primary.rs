use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use thiserror::Error;
use trail_store::{CaptureContext, RowSnapshot, StoreError};

use crate::capture::{CaptureError, CaptureInterceptor, CommitReceipt, Mutation};
use crate::reconstruct::PrimaryStore;

#[derive(Debug, Error)]
pub enum PrimaryError {
    #[error("row already exists: {0}")]
    Conflict(String),
    #[error("row not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// One write inside a multi-row unit of work.
#[derive(Clone, Debug, PartialEq)]
pub enum RowWrite {
    Insert {
        entity: String,
        row_id: String,
        row: RowSnapshot,
    },
    /// Fields in `patch` overwrite the stored ones; the rest stay.
    Update {
        entity: String,
        row_id: String,
        patch: RowSnapshot,
    },
    Delete {
        entity: String,
        row_id: String,
    },
}

type Tables = HashMap<String, BTreeMap<String, RowSnapshot>>;

/// A small transactional row store that routes every mutation through the
/// capture interceptor. A capture failure in strict mode rolls the whole unit
/// of work back.
pub struct InMemoryPrimaryStore {
    tables: RwLock<Tables>,
    interceptor: CaptureInterceptor,
}

impl InMemoryPrimaryStore {
    pub fn new(interceptor: CaptureInterceptor) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            interceptor,
        }
    }

    pub fn get(&self, entity: &str, row_id: &str) -> Option<RowSnapshot> {
        self.tables
            .read()
            .get(entity)
            .and_then(|rows| rows.get(row_id))
            .cloned()
    }

    pub fn insert(
        &self,
        context: CaptureContext,
        entity: &str,
        row_id: &str,
        row: RowSnapshot,
    ) -> Result<CommitReceipt, PrimaryError> {
        self.apply(
            context,
            vec![RowWrite::Insert {
                entity: entity.to_string(),
                row_id: row_id.to_string(),
                row,
            }],
        )
    }

    pub fn update(
        &self,
        context: CaptureContext,
        entity: &str,
        row_id: &str,
        patch: RowSnapshot,
    ) -> Result<CommitReceipt, PrimaryError> {
        self.apply(
            context,
            vec![RowWrite::Update {
                entity: entity.to_string(),
                row_id: row_id.to_string(),
                patch,
            }],
        )
    }

    pub fn delete(
        &self,
        context: CaptureContext,
        entity: &str,
        row_id: &str,
    ) -> Result<CommitReceipt, PrimaryError> {
        self.apply(
            context,
            vec![RowWrite::Delete {
                entity: entity.to_string(),
                row_id: row_id.to_string(),
            }],
        )
    }

    /// Applies all writes as one unit of work with one capture transaction.
    /// Rows change only if every write and the capture commit succeed.
    pub fn apply(
        &self,
        context: CaptureContext,
        writes: Vec<RowWrite>,
    ) -> Result<CommitReceipt, PrimaryError> {
        let mut tables = self.tables.write();
        let mut working = tables.clone();
        let mut tx = self.interceptor.begin(context);

        for write in writes {
            let mutation = stage_write(&mut working, write)?;
            tx.capture(&mutation)?;
        }

        let receipt = tx.commit()?;
        *tables = working;
        Ok(receipt)
    }
}

fn stage_write(tables: &mut Tables, write: RowWrite) -> Result<Mutation, PrimaryError> {
    match write {
        RowWrite::Insert {
            entity,
            row_id,
            row,
        } => {
            let rows = tables.entry(entity.clone()).or_default();
            if rows.contains_key(&row_id) {
                return Err(PrimaryError::Conflict(format!("{entity}/{row_id}")));
            }
            rows.insert(row_id.clone(), row.clone());
            Ok(Mutation::insert(entity, row_id, row))
        }
        RowWrite::Update {
            entity,
            row_id,
            patch,
        } => {
            let current = tables
                .get_mut(&entity)
                .and_then(|rows| rows.get_mut(&row_id))
                .ok_or_else(|| PrimaryError::NotFound(format!("{entity}/{row_id}")))?;
            let old = current.clone();
            for (field, value) in patch {
                current.insert(field, value);
            }
            Ok(Mutation::update(entity, row_id, old, current.clone()))
        }
        RowWrite::Delete { entity, row_id } => {
            let old = tables
                .get_mut(&entity)
                .and_then(|rows| rows.remove(&row_id))
                .ok_or_else(|| PrimaryError::NotFound(format!("{entity}/{row_id}")))?;
            Ok(Mutation::delete(entity, row_id, old))
        }
    }
}

impl PrimaryStore for InMemoryPrimaryStore {
    fn current_row(&self, entity: &str, row_id: &str) -> Result<Option<RowSnapshot>, StoreError> {
        Ok(self.get(entity, row_id))
    }
}
