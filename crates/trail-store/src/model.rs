use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::CaptureContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(format!("unknown operation: {other}")),
        }
    }
}

/// Field name to value map of one row. `Value::Null` is SQL NULL.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowSnapshot(BTreeMap<String, Value>);

impl RowSnapshot {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(field.into(), value)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Builds a snapshot from a JSON object; any other JSON shape is rejected.
    pub fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map.into_iter().collect())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.0.clone().into_iter().collect())
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for RowSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl IntoIterator for RowSnapshot {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// A captured mutation that has not been given a record id yet. Staged in a
/// capture transaction, mirrored by queue entries, and turned into a
/// [`ChangeRecord`] when the store accepts it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapturedChange {
    pub entity: String,
    pub operation: Operation,
    pub row_id: String,
    pub old_snapshot: Option<RowSnapshot>,
    pub new_snapshot: Option<RowSnapshot>,
    pub changed_fields: BTreeSet<String>,
    pub redacted_fields: BTreeSet<String>,
    pub captured_at: DateTime<Utc>,
    pub context: CaptureContext,
    pub transaction_id: u64,
    pub sequence: u32,
}

impl CapturedChange {
    pub fn into_record(self, id: u64) -> ChangeRecord {
        ChangeRecord {
            id,
            entity: self.entity,
            operation: self.operation,
            row_id: self.row_id,
            old_snapshot: self.old_snapshot,
            new_snapshot: self.new_snapshot,
            changed_fields: self.changed_fields,
            redacted_fields: self.redacted_fields,
            captured_at: self.captured_at,
            context: self.context,
            transaction_id: self.transaction_id,
            sequence: self.sequence,
        }
    }

    /// Checks the snapshot presence rules for the operation.
    pub fn validate(&self) -> Result<(), String> {
        let (want_old, want_new) = match self.operation {
            Operation::Insert => (false, true),
            Operation::Update => (true, true),
            Operation::Delete => (true, false),
        };
        if self.old_snapshot.is_some() != want_old {
            return Err(format!(
                "{} on {}/{}: old snapshot presence mismatch",
                self.operation, self.entity, self.row_id
            ));
        }
        if self.new_snapshot.is_some() != want_new {
            return Err(format!(
                "{} on {}/{}: new snapshot presence mismatch",
                self.operation, self.entity, self.row_id
            ));
        }
        if self.operation != Operation::Update && !self.changed_fields.is_empty() {
            return Err(format!(
                "{} on {}/{}: changed fields only apply to updates",
                self.operation, self.entity, self.row_id
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: u64,
    pub entity: String,
    pub operation: Operation,
    pub row_id: String,
    pub old_snapshot: Option<RowSnapshot>,
    pub new_snapshot: Option<RowSnapshot>,
    pub changed_fields: BTreeSet<String>,
    pub redacted_fields: BTreeSet<String>,
    pub captured_at: DateTime<Utc>,
    pub context: CaptureContext,
    pub transaction_id: u64,
    pub sequence: u32,
}

impl ChangeRecord {
    /// The total order used for replay. Record ids are not part of it.
    pub fn ordering_key(&self) -> (DateTime<Utc>, u64, u32) {
        (self.captured_at, self.transaction_id, self.sequence)
    }
}

/// Sorts newest first by the replay ordering key, id as a final tie-break.
pub fn sort_newest_first(records: &mut [ChangeRecord]) {
    records.sort_by(|a, b| {
        b.ordering_key()
            .cmp(&a.ordering_key())
            .then_with(|| b.id.cmp(&a.id))
    });
}

/// Half-open time interval `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The window of length `window` that ends at `end`.
    pub fn ending_at(end: DateTime<Utc>, window: chrono::Duration) -> Self {
        Self {
            start: end - window,
            end,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub entity: Option<String>,
    pub operation: Option<Operation>,
}

impl ChangeFilter {
    pub fn matches(&self, record: &ChangeRecord) -> bool {
        if let Some(entity) = &self.entity {
            if &record.entity != entity {
                return false;
            }
        }
        if let Some(operation) = self.operation {
            if record.operation != operation {
                return false;
            }
        }
        true
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummaryRow {
    pub entity: String,
    pub operation: Operation,
    pub count: u64,
}

/// Change count attributed to one actor or tenant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCount {
    pub subject: String,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueClaim {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: u64,
    pub change: CapturedChange,
    pub enqueued_at: DateTime<Utc>,
    pub claim: Option<QueueClaim>,
}

impl QueueEntry {
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match &self.claim {
            None => true,
            Some(claim) => claim.expires_at <= now,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub pending: u64,
    pub claimed: u64,
}

impl QueueDepth {
    pub fn total(&self) -> u64 {
        self.pending + self.claimed
    }
}
