use std::collections::BTreeSet;

use serde_json::Value;
use trail_store::{ChangeRecord, ExclusionSet, Operation, RowSnapshot};

use crate::capture::CaptureError;

/// Redacted snapshots of one mutation plus what the exclusion pass removed.
#[derive(Clone, Debug, PartialEq)]
pub struct DiffOutcome {
    pub old_snapshot: Option<RowSnapshot>,
    pub new_snapshot: Option<RowSnapshot>,
    /// Changed fields after exclusion. Empty for inserts and deletes.
    pub changed_fields: BTreeSet<String>,
    /// Changed fields before exclusion.
    pub raw_changed: BTreeSet<String>,
    /// Excluded fields that were present in either snapshot.
    pub redacted_fields: BTreeSet<String>,
}

impl DiffOutcome {
    /// An update that changed nothing at all.
    pub fn is_noop(&self, operation: Operation) -> bool {
        operation == Operation::Update && self.raw_changed.is_empty()
    }

    /// An update whose every change touched an excluded field.
    pub fn is_redacted_only(&self, operation: Operation) -> bool {
        operation == Operation::Update
            && !self.raw_changed.is_empty()
            && self.changed_fields.is_empty()
    }
}

/// NULL-safe distinctness: two missing or two null values are equal.
pub fn is_distinct(old: Option<&Value>, new: Option<&Value>) -> bool {
    match (old, new) {
        (None, None) => false,
        (Some(old), Some(new)) => old != new,
        _ => true,
    }
}

/// Keys present on only one side, plus keys whose values are distinct.
pub fn changed_fields(old: &RowSnapshot, new: &RowSnapshot) -> BTreeSet<String> {
    old.fields()
        .chain(new.fields())
        .filter(|field| is_distinct(old.get(field), new.get(field)))
        .cloned()
        .collect()
}

pub fn compute_diff(
    entity: &str,
    operation: Operation,
    old: Option<&RowSnapshot>,
    new: Option<&RowSnapshot>,
    exclusions: &ExclusionSet,
) -> Result<DiffOutcome, CaptureError> {
    let missing = |side: &'static str| CaptureError::MissingSnapshot {
        entity: entity.to_string(),
        operation,
        side,
    };
    let (old, new) = match operation {
        Operation::Insert => (None, Some(new.ok_or_else(|| missing("new"))?)),
        Operation::Update => (
            Some(old.ok_or_else(|| missing("old"))?),
            Some(new.ok_or_else(|| missing("new"))?),
        ),
        Operation::Delete => (Some(old.ok_or_else(|| missing("old"))?), None),
    };

    let raw_changed = match (old, new) {
        (Some(old), Some(new)) => changed_fields(old, new),
        _ => BTreeSet::new(),
    };
    let redacted_fields: BTreeSet<String> = exclusions
        .fields()
        .filter(|field| {
            old.map(|row| row.contains(field)).unwrap_or(false)
                || new.map(|row| row.contains(field)).unwrap_or(false)
        })
        .cloned()
        .collect();
    let changed_fields = raw_changed
        .iter()
        .filter(|field| !exclusions.is_excluded(field))
        .cloned()
        .collect();

    Ok(DiffOutcome {
        old_snapshot: old.map(|row| redact(row, exclusions)),
        new_snapshot: new.map(|row| redact(row, exclusions)),
        changed_fields,
        raw_changed,
        redacted_fields,
    })
}

pub fn redact(row: &RowSnapshot, exclusions: &ExclusionSet) -> RowSnapshot {
    row.iter()
        .filter(|(field, _)| !exclusions.is_excluded(field))
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect()
}

/// Applies today's exclusions to a stored record. Records captured before an
/// exclusion existed may still carry the value; reads never return it.
pub fn mask_record(mut record: ChangeRecord, exclusions: &ExclusionSet) -> ChangeRecord {
    if exclusions.is_empty() {
        return record;
    }
    for field in exclusions.fields() {
        let removed_old = record
            .old_snapshot
            .as_mut()
            .and_then(|row| row.remove(field))
            .is_some();
        let removed_new = record
            .new_snapshot
            .as_mut()
            .and_then(|row| row.remove(field))
            .is_some();
        let removed_changed = record.changed_fields.remove(field);
        if removed_old || removed_new || removed_changed {
            record.redacted_fields.insert(field.clone());
        }
    }
    record
}
