use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::alert::{within_cooldown, AlertEvent, AlertFiring, AlertRule};
use crate::model::{
    sort_newest_first, ActivityCount, CapturedChange, ChangeFilter, ChangeRecord,
    ChangeSummaryRow, Operation, QueueClaim, QueueDepth, QueueEntry, TimeRange,
};
use crate::partition::{Partition, PartitionPeriod, PartitionState, RetentionAction};
use crate::policy::{ExclusionRule, ExclusionSet, InMemoryCapturePolicy};
use crate::store::{
    apply_limit, AlertStore, CaptureQueue, ChangelogStore, PartitionCatalog, PolicyStore,
    StoreError,
};

/// Single-process backend. One lock guards the log, queue and alert state, so
/// every trait operation is atomic with respect to the others.
#[derive(Clone)]
pub struct InMemoryTrailStore {
    state: Arc<Mutex<TrailState>>,
    policy: Arc<InMemoryCapturePolicy>,
}

struct Slot {
    partition: Partition,
    records: Vec<ChangeRecord>,
}

#[derive(Default)]
struct TrailState {
    next_record_id: u64,
    next_transaction_id: u64,
    next_queue_id: u64,
    next_event_id: u64,
    partitions: BTreeMap<DateTime<Utc>, Slot>,
    default_records: Vec<ChangeRecord>,
    retired: BTreeMap<String, Slot>,
    queue: BTreeMap<u64, QueueEntry>,
    rules: BTreeMap<String, AlertRule>,
    events: Vec<AlertEvent>,
}

impl TrailState {
    fn append_record(&mut self, change: CapturedChange) -> Result<ChangeRecord, StoreError> {
        change.validate().map_err(StoreError::Integrity)?;
        self.next_record_id += 1;
        let record = change.into_record(self.next_record_id);
        let at = record.captured_at;
        let slot = self
            .partitions
            .values_mut()
            .find(|slot| slot.partition.bounds.map(|b| b.contains(at)).unwrap_or(false));
        match slot {
            Some(slot) => slot.records.push(record.clone()),
            None => self.default_records.push(record.clone()),
        }
        Ok(record)
    }

    /// Records from the partitions that can hold anything in `range`.
    fn scan<'a>(
        &'a self,
        range: Option<TimeRange>,
    ) -> impl Iterator<Item = &'a ChangeRecord> + 'a {
        self.partitions
            .values()
            .filter(move |slot| match (range, slot.partition.bounds) {
                (Some(range), Some(bounds)) => bounds.overlaps(&range),
                _ => true,
            })
            .flat_map(|slot| slot.records.iter())
            .chain(self.default_records.iter())
            .filter(move |record| range.map(|r| r.contains(record.captured_at)).unwrap_or(true))
    }

    fn top_by<F>(&self, range: TimeRange, key: F) -> Option<ActivityCount>
    where
        F: Fn(&ChangeRecord) -> Option<&String>,
    {
        let mut counts: HashMap<&String, u64> = HashMap::new();
        for record in self.scan(Some(range)) {
            if let Some(subject) = key(record) {
                *counts.entry(subject).or_default() += 1;
            }
        }
        counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(subject, count)| ActivityCount {
                subject: subject.clone(),
                count,
            })
    }

    fn collect_newest<F>(&self, range: Option<TimeRange>, limit: usize, keep: F) -> Vec<ChangeRecord>
    where
        F: Fn(&ChangeRecord) -> bool,
    {
        let mut records: Vec<ChangeRecord> =
            self.scan(range).filter(|record| keep(record)).cloned().collect();
        sort_newest_first(&mut records);
        apply_limit(&mut records, limit);
        records
    }
}

impl InMemoryTrailStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TrailState::default())),
            policy: InMemoryCapturePolicy::shared(),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for InMemoryTrailStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangelogStore for InMemoryTrailStore {
    fn next_transaction_id(&self) -> Result<u64, StoreError> {
        let mut state = self.state.lock();
        state.next_transaction_id += 1;
        Ok(state.next_transaction_id)
    }

    fn append(&self, changes: Vec<CapturedChange>) -> Result<Vec<ChangeRecord>, StoreError> {
        for change in &changes {
            change.validate().map_err(StoreError::Integrity)?;
        }
        let mut state = self.state.lock();
        changes
            .into_iter()
            .map(|change| state.append_record(change))
            .collect()
    }

    fn history(
        &self,
        entity: &str,
        row_id: &str,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        let state = self.state.lock();
        Ok(state.collect_newest(None, limit, |r| r.entity == entity && r.row_id == row_id))
    }

    fn changes_after(
        &self,
        entity: &str,
        row_id: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        let state = self.state.lock();
        Ok(state.collect_newest(None, 0, |r| {
            r.entity == entity && r.row_id == row_id && r.captured_at > after
        }))
    }

    fn by_actor(
        &self,
        actor_id: &str,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        let state = self.state.lock();
        Ok(state.collect_newest(Some(range), limit, |r| {
            r.context.actor_id.as_deref() == Some(actor_id)
        }))
    }

    fn by_tenant(
        &self,
        tenant_id: &str,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        let state = self.state.lock();
        Ok(state.collect_newest(Some(range), limit, |r| {
            r.context.tenant_id.as_deref() == Some(tenant_id)
        }))
    }

    fn by_transaction(&self, transaction_id: u64) -> Result<Vec<ChangeRecord>, StoreError> {
        let state = self.state.lock();
        let mut records: Vec<ChangeRecord> = state
            .scan(None)
            .filter(|r| r.transaction_id == transaction_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.sequence, r.id));
        Ok(records)
    }

    fn summary(&self, range: TimeRange) -> Result<Vec<ChangeSummaryRow>, StoreError> {
        let state = self.state.lock();
        // Keyed by the operation name so rows sort the same way as the SQL backends.
        let mut counts: BTreeMap<(String, &'static str), (Operation, u64)> = BTreeMap::new();
        for record in state.scan(Some(range)) {
            counts
                .entry((record.entity.clone(), record.operation.as_str()))
                .or_insert((record.operation, 0))
                .1 += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((entity, _), (operation, count))| ChangeSummaryRow {
                entity,
                operation,
                count,
            })
            .collect())
    }

    fn count(&self, range: TimeRange, filter: &ChangeFilter) -> Result<u64, StoreError> {
        let state = self.state.lock();
        Ok(state.scan(Some(range)).filter(|r| filter.matches(r)).count() as u64)
    }

    fn top_actor(&self, range: TimeRange) -> Result<Option<ActivityCount>, StoreError> {
        let state = self.state.lock();
        Ok(state.top_by(range, |r| r.context.actor_id.as_ref()))
    }

    fn top_tenant(&self, range: TimeRange) -> Result<Option<ActivityCount>, StoreError> {
        let state = self.state.lock();
        Ok(state.top_by(range, |r| r.context.tenant_id.as_ref()))
    }
}

impl CaptureQueue for InMemoryTrailStore {
    fn enqueue(
        &self,
        changes: Vec<CapturedChange>,
        enqueued_at: DateTime<Utc>,
    ) -> Result<Vec<u64>, StoreError> {
        for change in &changes {
            change.validate().map_err(StoreError::Integrity)?;
        }
        let mut state = self.state.lock();
        let mut ids = Vec::with_capacity(changes.len());
        for change in changes {
            state.next_queue_id += 1;
            let id = state.next_queue_id;
            state.queue.insert(
                id,
                QueueEntry {
                    id,
                    change,
                    enqueued_at,
                    claim: None,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    fn claim(
        &self,
        owner: &str,
        limit: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let mut state = self.state.lock();
        let mut claimed = Vec::new();
        for entry in state.queue.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if !entry.is_claimable(now) {
                continue;
            }
            entry.claim = Some(QueueClaim {
                owner: owner.to_string(),
                expires_at: now + lease,
            });
            claimed.push(entry.clone());
        }
        Ok(claimed)
    }

    fn promote(&self, owner: &str, entry_ids: &[u64]) -> Result<Vec<ChangeRecord>, StoreError> {
        let mut state = self.state.lock();
        let owned: Vec<u64> = entry_ids
            .iter()
            .copied()
            .filter(|id| {
                state
                    .queue
                    .get(id)
                    .and_then(|entry| entry.claim.as_ref())
                    .map(|claim| claim.owner == owner)
                    .unwrap_or(false)
            })
            .collect();
        for id in &owned {
            if let Some(entry) = state.queue.get(id) {
                entry.change.validate().map_err(StoreError::Integrity)?;
            }
        }
        let mut promoted = Vec::with_capacity(owned.len());
        for id in owned {
            if let Some(entry) = state.queue.remove(&id) {
                promoted.push(state.append_record(entry.change)?);
            }
        }
        Ok(promoted)
    }

    fn release(&self, owner: &str, entry_ids: &[u64]) -> Result<usize, StoreError> {
        let mut state = self.state.lock();
        let mut released = 0;
        for id in entry_ids {
            if let Some(entry) = state.queue.get_mut(id) {
                if entry.claim.as_ref().map(|c| c.owner == owner).unwrap_or(false) {
                    entry.claim = None;
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    fn depth(&self, now: DateTime<Utc>) -> Result<QueueDepth, StoreError> {
        let state = self.state.lock();
        let mut depth = QueueDepth::default();
        for entry in state.queue.values() {
            if entry.is_claimable(now) {
                depth.pending += 1;
            } else {
                depth.claimed += 1;
            }
        }
        Ok(depth)
    }

    fn queued_for_row(&self, entity: &str, row_id: &str) -> Result<u64, StoreError> {
        let state = self.state.lock();
        Ok(state
            .queue
            .values()
            .filter(|entry| entry.change.entity == entity && entry.change.row_id == row_id)
            .count() as u64)
    }
}

impl PartitionCatalog for InMemoryTrailStore {
    fn create_partition(
        &self,
        period: PartitionPeriod,
        at: DateTime<Utc>,
    ) -> Result<Partition, StoreError> {
        let bounds = period.bounds_containing(at);
        let name = period.partition_name(&bounds);
        let mut state = self.state.lock();

        if let Some(slot) = state.partitions.get(&bounds.start) {
            if slot.partition.bounds == Some(bounds) {
                let mut partition = slot.partition.clone();
                partition.record_count = slot.records.len() as u64;
                return Ok(partition);
            }
        }
        if state.retired.contains_key(&name) {
            return Err(StoreError::Conflict(format!("partition {name} already retired")));
        }
        let overlapping = state
            .partitions
            .values()
            .chain(state.retired.values())
            .find(|slot| slot.partition.bounds.map(|b| b.overlaps(&bounds)).unwrap_or(false));
        if let Some(slot) = overlapping {
            return Err(StoreError::Conflict(format!(
                "partition {name} overlaps {}",
                slot.partition.name
            )));
        }

        let (moved, kept): (Vec<ChangeRecord>, Vec<ChangeRecord>) =
            std::mem::take(&mut state.default_records)
                .into_iter()
                .partition(|record| bounds.contains(record.captured_at));
        state.default_records = kept;
        let mut partition = Partition::active(name, bounds);
        partition.record_count = moved.len() as u64;
        state.partitions.insert(
            bounds.start,
            Slot {
                partition: partition.clone(),
                records: moved,
            },
        );
        Ok(partition)
    }

    fn list_partitions(&self) -> Result<Vec<Partition>, StoreError> {
        let state = self.state.lock();
        let mut partitions: Vec<Partition> = state
            .retired
            .values()
            .map(|slot| slot.partition.clone())
            .collect();
        partitions.extend(state.partitions.values().map(|slot| {
            let mut partition = slot.partition.clone();
            partition.record_count = slot.records.len() as u64;
            partition
        }));
        partitions.sort_by_key(|p| p.bounds.map(|b| b.start));
        partitions.push(Partition::default_partition(state.default_records.len() as u64));
        Ok(partitions)
    }

    fn retire_partition(
        &self,
        name: &str,
        action: RetentionAction,
        at: DateTime<Utc>,
    ) -> Result<Partition, StoreError> {
        let mut state = self.state.lock();
        let key = state
            .partitions
            .iter()
            .find(|(_, slot)| slot.partition.name == name)
            .map(|(key, _)| *key);
        let Some(key) = key else {
            if let Some(slot) = state.retired.get(name) {
                return Ok(slot.partition.clone());
            }
            return Err(StoreError::NotFound(format!("partition {name}")));
        };
        let Some(mut slot) = state.partitions.remove(&key) else {
            return Err(StoreError::NotFound(format!("partition {name}")));
        };
        slot.partition.record_count = slot.records.len() as u64;
        slot.partition.retired_at = Some(at);
        match action {
            RetentionAction::Archive => slot.partition.state = PartitionState::Archived,
            RetentionAction::Drop => {
                slot.partition.state = PartitionState::Dropped;
                slot.records.clear();
            }
        }
        let partition = slot.partition.clone();
        state.retired.insert(name.to_string(), slot);
        Ok(partition)
    }

    fn read_archived(&self, name: &str) -> Result<Vec<ChangeRecord>, StoreError> {
        let state = self.state.lock();
        match state.retired.get(name) {
            Some(slot) if slot.partition.state == PartitionState::Archived => {
                let mut records = slot.records.clone();
                records.sort_by_key(|r| r.id);
                Ok(records)
            }
            Some(_) => Err(StoreError::NotFound(format!("partition {name} was dropped"))),
            None => Err(StoreError::NotFound(format!("archived partition {name}"))),
        }
    }
}

impl AlertStore for InMemoryTrailStore {
    fn put_rule(&self, rule: AlertRule) -> Result<(), StoreError> {
        rule.validate().map_err(StoreError::Integrity)?;
        self.state.lock().rules.insert(rule.name.clone(), rule);
        Ok(())
    }

    fn set_rule_enabled(&self, name: &str, enabled: bool) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let rule = state
            .rules
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("alert rule {name}")))?;
        rule.enabled = enabled;
        Ok(())
    }

    fn list_rules(&self) -> Result<Vec<AlertRule>, StoreError> {
        Ok(self.state.lock().rules.values().cloned().collect())
    }

    fn fire_if_cooled(&self, firing: AlertFiring) -> Result<Option<AlertEvent>, StoreError> {
        let mut state = self.state.lock();
        let cooldown = state
            .rules
            .get(&firing.rule_name)
            .map(AlertRule::cooldown)
            .ok_or_else(|| StoreError::NotFound(format!("alert rule {}", firing.rule_name)))?;
        let last = state
            .events
            .iter()
            .filter(|event| event.rule_name == firing.rule_name)
            .map(|event| event.fired_at)
            .max();
        if let Some(last) = last {
            if within_cooldown(last, firing.fired_at, cooldown) {
                return Ok(None);
            }
        }
        state.next_event_id += 1;
        let event = AlertEvent {
            id: state.next_event_id,
            rule_name: firing.rule_name,
            fired_at: firing.fired_at,
            observed_value: firing.observed_value,
            severity: firing.severity,
            subject: firing.subject,
            acknowledged_at: None,
            acknowledged_by: None,
        };
        state.events.push(event.clone());
        Ok(Some(event))
    }

    fn events(&self, range: TimeRange) -> Result<Vec<AlertEvent>, StoreError> {
        let state = self.state.lock();
        let mut events: Vec<AlertEvent> = state
            .events
            .iter()
            .filter(|event| range.contains(event.fired_at))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.fired_at.cmp(&a.fired_at).then_with(|| b.id.cmp(&a.id)));
        Ok(events)
    }

    fn acknowledge(
        &self,
        event_id: u64,
        by: &str,
        at: DateTime<Utc>,
    ) -> Result<AlertEvent, StoreError> {
        let mut state = self.state.lock();
        let event = state
            .events
            .iter_mut()
            .find(|event| event.id == event_id)
            .ok_or_else(|| StoreError::NotFound(format!("alert event {event_id}")))?;
        if event.acknowledged_at.is_none() {
            event.acknowledged_at = Some(at);
            event.acknowledged_by = Some(by.to_string());
        }
        Ok(event.clone())
    }
}

impl PolicyStore for InMemoryTrailStore {
    fn capture_enabled(&self, entity: &str) -> Result<bool, StoreError> {
        Ok(self.policy.is_capture_enabled(entity))
    }

    fn set_capture_enabled(&self, entity: &str, enabled: bool) -> Result<(), StoreError> {
        if enabled {
            self.policy.enable_capture(entity);
        } else {
            self.policy.disable_capture(entity);
        }
        Ok(())
    }

    fn enabled_entities(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.policy.captured_entities())
    }

    fn entity_exclusions(&self, entity: &str) -> Result<ExclusionSet, StoreError> {
        Ok(self.policy.exclusions_for(entity))
    }

    fn put_exclusion(&self, rule: ExclusionRule) -> Result<(), StoreError> {
        self.policy.add_exclusion(rule);
        Ok(())
    }

    fn delete_exclusion(&self, entity: &str, field: &str) -> Result<bool, StoreError> {
        Ok(self.policy.remove_exclusion(entity, field))
    }

    fn exclusion_rules(&self) -> Result<Vec<ExclusionRule>, StoreError> {
        Ok(self.policy.list_exclusions())
    }
}
