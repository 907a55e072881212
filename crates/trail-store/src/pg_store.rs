use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use postgres::{Client, GenericClient, NoTls, Row};
use serde_json::Value;

use crate::alert::{within_cooldown, AlertEvent, AlertFiring, AlertRule, Severity};
use crate::context::CaptureContext;
use crate::model::{
    ActivityCount, CapturedChange, ChangeFilter, ChangeRecord, ChangeSummaryRow, QueueClaim,
    QueueDepth, QueueEntry, RowSnapshot, TimeRange,
};
use crate::partition::{
    is_valid_partition_name, Partition, PartitionPeriod, PartitionState, RetentionAction,
    DEFAULT_PARTITION,
};
use crate::policy::{ExclusionRule, ExclusionSet};
use crate::store::{
    AlertStore, CaptureQueue, ChangelogStore, PartitionCatalog, PolicyStore, StoreError,
};

const RECORD_COLUMNS: &str = "id, entity, operation, row_id, old_snapshot, new_snapshot, \
     changed_fields, redacted_fields, captured_at, actor_id, tenant_id, request_id, \
     client_address, transaction_id, sequence";

const NEWEST_FIRST: &str = "ORDER BY captured_at DESC, transaction_id DESC, sequence DESC, id DESC";

const ARCHIVE_SCHEMA: &str = "trail_archive";

/// Postgres backend on native range partitioning. Retired partitions are
/// detached and moved into the `trail_archive` schema.
pub struct PgTrailStore {
    client: Arc<Mutex<Client>>,
}

impl PgTrailStore {
    pub fn connect(dsn: &str) -> Result<Self, StoreError> {
        let client = Client::connect(dsn, NoTls).map_err(pg_err)?;
        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut client = self.client.lock();
        client
            .batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {ARCHIVE_SCHEMA};
                CREATE SEQUENCE IF NOT EXISTS change_record_ids;
                CREATE SEQUENCE IF NOT EXISTS change_transaction_ids;
                CREATE TABLE IF NOT EXISTS change_records (
                    id BIGINT NOT NULL,
                    entity TEXT NOT NULL,
                    operation TEXT NOT NULL,
                    row_id TEXT NOT NULL,
                    old_snapshot JSONB,
                    new_snapshot JSONB,
                    changed_fields JSONB NOT NULL,
                    redacted_fields JSONB NOT NULL,
                    captured_at TIMESTAMPTZ NOT NULL,
                    actor_id TEXT,
                    tenant_id TEXT,
                    request_id TEXT,
                    client_address TEXT,
                    transaction_id BIGINT NOT NULL,
                    sequence BIGINT NOT NULL
                ) PARTITION BY RANGE (captured_at);
                CREATE TABLE IF NOT EXISTS {DEFAULT_PARTITION} PARTITION OF change_records DEFAULT;
                CREATE INDEX IF NOT EXISTS change_records_row ON change_records (entity, row_id, captured_at);
                CREATE INDEX IF NOT EXISTS change_records_actor ON change_records (actor_id, captured_at);
                CREATE INDEX IF NOT EXISTS change_records_tenant ON change_records (tenant_id, captured_at);
                CREATE INDEX IF NOT EXISTS change_records_tx ON change_records (transaction_id, sequence);
                CREATE TABLE IF NOT EXISTS trail_partitions (
                    name TEXT PRIMARY KEY,
                    range_start TIMESTAMPTZ NOT NULL,
                    range_end TIMESTAMPTZ NOT NULL,
                    state TEXT NOT NULL,
                    record_count BIGINT NOT NULL DEFAULT 0,
                    retired_at TIMESTAMPTZ
                );
                CREATE TABLE IF NOT EXISTS capture_queue (
                    id BIGSERIAL PRIMARY KEY,
                    payload JSONB NOT NULL,
                    enqueued_at TIMESTAMPTZ NOT NULL,
                    claimed_by TEXT,
                    claim_expires_at TIMESTAMPTZ
                );
                CREATE TABLE IF NOT EXISTS alert_rules (
                    name TEXT PRIMARY KEY,
                    definition JSONB NOT NULL
                );
                CREATE TABLE IF NOT EXISTS alert_events (
                    id BIGSERIAL PRIMARY KEY,
                    rule_name TEXT NOT NULL,
                    fired_at TIMESTAMPTZ NOT NULL,
                    observed_value DOUBLE PRECISION NOT NULL,
                    severity TEXT NOT NULL,
                    subject TEXT,
                    acknowledged_at TIMESTAMPTZ,
                    acknowledged_by TEXT
                );
                CREATE INDEX IF NOT EXISTS alert_events_rule ON alert_events (rule_name, fired_at);
                CREATE TABLE IF NOT EXISTS capture_entities (
                    entity TEXT PRIMARY KEY
                );
                CREATE TABLE IF NOT EXISTS capture_exclusions (
                    entity TEXT NOT NULL,
                    field TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    PRIMARY KEY (entity, field)
                );"
            ))
            .map_err(pg_err)?;
        Ok(())
    }
}

impl ChangelogStore for PgTrailStore {
    fn next_transaction_id(&self) -> Result<u64, StoreError> {
        let mut client = self.client.lock();
        let row = client
            .query_one("SELECT nextval('change_transaction_ids')", &[])
            .map_err(pg_err)?;
        let value: i64 = row.try_get(0).map_err(pg_err)?;
        Ok(value as u64)
    }

    fn append(&self, changes: Vec<CapturedChange>) -> Result<Vec<ChangeRecord>, StoreError> {
        for change in &changes {
            change.validate().map_err(StoreError::Integrity)?;
        }
        let mut client = self.client.lock();
        let mut tx = client.transaction().map_err(pg_err)?;
        let mut records = Vec::with_capacity(changes.len());
        for change in changes {
            records.push(insert_change(&mut tx, change)?);
        }
        tx.commit().map_err(pg_err)?;
        Ok(records)
    }

    fn history(
        &self,
        entity: &str,
        row_id: &str,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        let mut client = self.client.lock();
        let rows = client
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM change_records
                     WHERE entity = $1 AND row_id = $2 {NEWEST_FIRST} LIMIT $3"
                ),
                &[&entity, &row_id, &pg_limit(limit)],
            )
            .map_err(pg_err)?;
        rows.iter().map(record_from_row).collect()
    }

    fn changes_after(
        &self,
        entity: &str,
        row_id: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        let mut client = self.client.lock();
        let rows = client
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM change_records
                     WHERE entity = $1 AND row_id = $2 AND captured_at > $3 {NEWEST_FIRST}"
                ),
                &[&entity, &row_id, &after],
            )
            .map_err(pg_err)?;
        rows.iter().map(record_from_row).collect()
    }

    fn by_actor(
        &self,
        actor_id: &str,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        let mut client = self.client.lock();
        let rows = client
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM change_records
                     WHERE actor_id = $1 AND captured_at >= $2 AND captured_at < $3
                     {NEWEST_FIRST} LIMIT $4"
                ),
                &[&actor_id, &range.start, &range.end, &pg_limit(limit)],
            )
            .map_err(pg_err)?;
        rows.iter().map(record_from_row).collect()
    }

    fn by_tenant(
        &self,
        tenant_id: &str,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        let mut client = self.client.lock();
        let rows = client
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM change_records
                     WHERE tenant_id = $1 AND captured_at >= $2 AND captured_at < $3
                     {NEWEST_FIRST} LIMIT $4"
                ),
                &[&tenant_id, &range.start, &range.end, &pg_limit(limit)],
            )
            .map_err(pg_err)?;
        rows.iter().map(record_from_row).collect()
    }

    fn by_transaction(&self, transaction_id: u64) -> Result<Vec<ChangeRecord>, StoreError> {
        let mut client = self.client.lock();
        let rows = client
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM change_records
                     WHERE transaction_id = $1 ORDER BY sequence ASC, id ASC"
                ),
                &[&(transaction_id as i64)],
            )
            .map_err(pg_err)?;
        rows.iter().map(record_from_row).collect()
    }

    fn summary(&self, range: TimeRange) -> Result<Vec<ChangeSummaryRow>, StoreError> {
        let mut client = self.client.lock();
        let rows = client
            .query(
                "SELECT entity, operation, COUNT(*) FROM change_records
                 WHERE captured_at >= $1 AND captured_at < $2
                 GROUP BY entity, operation ORDER BY entity, operation",
                &[&range.start, &range.end],
            )
            .map_err(pg_err)?;
        let mut summary = Vec::with_capacity(rows.len());
        for row in rows {
            let operation: String = row.try_get(1).map_err(pg_err)?;
            let count: i64 = row.try_get(2).map_err(pg_err)?;
            summary.push(ChangeSummaryRow {
                entity: row.try_get(0).map_err(pg_err)?,
                operation: operation.parse().map_err(StoreError::Serialization)?,
                count: count.max(0) as u64,
            });
        }
        Ok(summary)
    }

    fn count(&self, range: TimeRange, filter: &ChangeFilter) -> Result<u64, StoreError> {
        let operation = filter.operation.map(|op| op.as_str().to_string());
        let mut client = self.client.lock();
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM change_records
                 WHERE captured_at >= $1 AND captured_at < $2
                   AND ($3::TEXT IS NULL OR entity = $3)
                   AND ($4::TEXT IS NULL OR operation = $4)",
                &[&range.start, &range.end, &filter.entity, &operation],
            )
            .map_err(pg_err)?;
        let count: i64 = row.try_get(0).map_err(pg_err)?;
        Ok(count.max(0) as u64)
    }

    fn top_actor(&self, range: TimeRange) -> Result<Option<ActivityCount>, StoreError> {
        let mut client = self.client.lock();
        top_subject(&mut *client, "actor_id", range)
    }

    fn top_tenant(&self, range: TimeRange) -> Result<Option<ActivityCount>, StoreError> {
        let mut client = self.client.lock();
        top_subject(&mut *client, "tenant_id", range)
    }
}

impl CaptureQueue for PgTrailStore {
    fn enqueue(
        &self,
        changes: Vec<CapturedChange>,
        enqueued_at: DateTime<Utc>,
    ) -> Result<Vec<u64>, StoreError> {
        for change in &changes {
            change.validate().map_err(StoreError::Integrity)?;
        }
        let mut client = self.client.lock();
        let mut tx = client.transaction().map_err(pg_err)?;
        let mut ids = Vec::with_capacity(changes.len());
        for change in &changes {
            let payload = to_json(change)?;
            let row = tx
                .query_one(
                    "INSERT INTO capture_queue (payload, enqueued_at) VALUES ($1, $2) RETURNING id",
                    &[&payload, &enqueued_at],
                )
                .map_err(pg_err)?;
            let id: i64 = row.try_get(0).map_err(pg_err)?;
            ids.push(id as u64);
        }
        tx.commit().map_err(pg_err)?;
        Ok(ids)
    }

    fn claim(
        &self,
        owner: &str,
        limit: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let expires_at = now + lease;
        let mut client = self.client.lock();
        let rows = client
            .query(
                "UPDATE capture_queue SET claimed_by = $1, claim_expires_at = $2
                 WHERE id IN (
                     SELECT id FROM capture_queue
                     WHERE claimed_by IS NULL OR claim_expires_at <= $3
                     ORDER BY id ASC LIMIT $4
                     FOR UPDATE SKIP LOCKED
                 )
                 RETURNING id, payload, enqueued_at",
                &[&owner, &expires_at, &now, &(limit as i64)],
            )
            .map_err(pg_err)?;
        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get(0).map_err(pg_err)?;
            let payload: Value = row.try_get(1).map_err(pg_err)?;
            claimed.push(QueueEntry {
                id: id as u64,
                change: from_json(payload)?,
                enqueued_at: row.try_get(2).map_err(pg_err)?,
                claim: Some(QueueClaim {
                    owner: owner.to_string(),
                    expires_at,
                }),
            });
        }
        claimed.sort_by_key(|entry| entry.id);
        Ok(claimed)
    }

    fn promote(&self, owner: &str, entry_ids: &[u64]) -> Result<Vec<ChangeRecord>, StoreError> {
        let ids: Vec<i64> = entry_ids.iter().map(|id| *id as i64).collect();
        let mut client = self.client.lock();
        let mut tx = client.transaction().map_err(pg_err)?;
        let rows = tx
            .query(
                "DELETE FROM capture_queue WHERE id = ANY($1) AND claimed_by = $2
                 RETURNING id, payload",
                &[&ids, &owner],
            )
            .map_err(pg_err)?;
        let mut changes = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get(0).map_err(pg_err)?;
            let payload: Value = row.try_get(1).map_err(pg_err)?;
            let change: CapturedChange = from_json(payload)?;
            change.validate().map_err(StoreError::Integrity)?;
            changes.push((id, change));
        }
        changes.sort_by_key(|(id, _)| *id);
        let mut promoted = Vec::with_capacity(changes.len());
        for (_, change) in changes {
            promoted.push(insert_change(&mut tx, change)?);
        }
        tx.commit().map_err(pg_err)?;
        Ok(promoted)
    }

    fn release(&self, owner: &str, entry_ids: &[u64]) -> Result<usize, StoreError> {
        let ids: Vec<i64> = entry_ids.iter().map(|id| *id as i64).collect();
        let mut client = self.client.lock();
        let released = client
            .execute(
                "UPDATE capture_queue SET claimed_by = NULL, claim_expires_at = NULL
                 WHERE id = ANY($1) AND claimed_by = $2",
                &[&ids, &owner],
            )
            .map_err(pg_err)?;
        Ok(released as usize)
    }

    fn depth(&self, now: DateTime<Utc>) -> Result<QueueDepth, StoreError> {
        let mut client = self.client.lock();
        let row = client
            .query_one(
                "SELECT COUNT(*) FILTER (WHERE claimed_by IS NULL OR claim_expires_at <= $1),
                        COUNT(*)
                 FROM capture_queue",
                &[&now],
            )
            .map_err(pg_err)?;
        let pending: i64 = row.try_get(0).map_err(pg_err)?;
        let total: i64 = row.try_get(1).map_err(pg_err)?;
        Ok(QueueDepth {
            pending: pending.max(0) as u64,
            claimed: (total - pending).max(0) as u64,
        })
    }

    fn queued_for_row(&self, entity: &str, row_id: &str) -> Result<u64, StoreError> {
        let mut client = self.client.lock();
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM capture_queue
                 WHERE payload->>'entity' = $1 AND payload->>'row_id' = $2",
                &[&entity, &row_id],
            )
            .map_err(pg_err)?;
        let queued: i64 = row.try_get(0).map_err(pg_err)?;
        Ok(queued.max(0) as u64)
    }
}

impl PartitionCatalog for PgTrailStore {
    fn create_partition(
        &self,
        period: PartitionPeriod,
        at: DateTime<Utc>,
    ) -> Result<Partition, StoreError> {
        let bounds = period.bounds_containing(at);
        let name = period.partition_name(&bounds);
        let mut client = self.client.lock();
        let mut tx = client.transaction().map_err(pg_err)?;
        tx.execute("LOCK TABLE trail_partitions IN EXCLUSIVE MODE", &[])
            .map_err(pg_err)?;

        if let Some(existing) = load_partition(&mut tx, &name)? {
            if existing.state != PartitionState::Active {
                return Err(StoreError::Conflict(format!("partition {name} already retired")));
            }
            if existing.bounds != Some(bounds) {
                return Err(StoreError::Conflict(format!(
                    "partition {name} exists with different bounds"
                )));
            }
            let partition = with_live_count(&mut tx, existing)?;
            tx.commit().map_err(pg_err)?;
            return Ok(partition);
        }
        let overlapping = tx
            .query_opt(
                "SELECT name FROM trail_partitions WHERE range_start < $2 AND range_end > $1 LIMIT 1",
                &[&bounds.start, &bounds.end],
            )
            .map_err(pg_err)?;
        if let Some(row) = overlapping {
            let other: String = row.try_get(0).map_err(pg_err)?;
            return Err(StoreError::Conflict(format!("partition {name} overlaps {other}")));
        }

        // Rows already sitting in the default partition would block ATTACH, so
        // they move into the new table first.
        tx.batch_execute(&format!(
            "CREATE TABLE \"{name}\" (LIKE change_records INCLUDING DEFAULTS);"
        ))
        .map_err(pg_err)?;
        let moved = tx
            .execute(
                &format!(
                    "WITH moved AS (
                         DELETE FROM {DEFAULT_PARTITION}
                         WHERE captured_at >= $1 AND captured_at < $2
                         RETURNING *
                     )
                     INSERT INTO \"{name}\" SELECT * FROM moved"
                ),
                &[&bounds.start, &bounds.end],
            )
            .map_err(pg_err)?;
        tx.batch_execute(&format!(
            "ALTER TABLE change_records ATTACH PARTITION \"{name}\"
             FOR VALUES FROM ('{}') TO ('{}');",
            bounds.start.to_rfc3339(),
            bounds.end.to_rfc3339()
        ))
        .map_err(pg_err)?;
        tx.execute(
            "INSERT INTO trail_partitions (name, range_start, range_end, state, record_count)
             VALUES ($1, $2, $3, 'active', $4)",
            &[&name, &bounds.start, &bounds.end, &(moved as i64)],
        )
        .map_err(pg_err)?;
        tx.commit().map_err(pg_err)?;

        let mut partition = Partition::active(name, bounds);
        partition.record_count = moved;
        Ok(partition)
    }

    fn list_partitions(&self) -> Result<Vec<Partition>, StoreError> {
        let mut client = self.client.lock();
        let rows = client
            .query(
                "SELECT name, range_start, range_end, state, record_count, retired_at
                 FROM trail_partitions ORDER BY range_start ASC",
                &[],
            )
            .map_err(pg_err)?;
        let mut partitions = Vec::with_capacity(rows.len() + 1);
        for row in &rows {
            let partition = partition_from_row(row)?;
            partitions.push(with_live_count(&mut *client, partition)?);
        }
        let default_count = table_count(&mut *client, DEFAULT_PARTITION)?;
        partitions.push(Partition::default_partition(default_count));
        Ok(partitions)
    }

    fn retire_partition(
        &self,
        name: &str,
        action: RetentionAction,
        at: DateTime<Utc>,
    ) -> Result<Partition, StoreError> {
        if !is_valid_partition_name(name) || name == DEFAULT_PARTITION {
            return Err(StoreError::NotFound(format!("partition {name}")));
        }
        let mut client = self.client.lock();
        let mut tx = client.transaction().map_err(pg_err)?;
        tx.execute("LOCK TABLE trail_partitions IN EXCLUSIVE MODE", &[])
            .map_err(pg_err)?;
        let Some(mut partition) = load_partition(&mut tx, name)? else {
            return Err(StoreError::NotFound(format!("partition {name}")));
        };
        if partition.state != PartitionState::Active {
            return Ok(partition);
        }
        partition.record_count = table_count(&mut tx, name)?;
        partition.retired_at = Some(at);
        let statement = match action {
            RetentionAction::Archive => {
                partition.state = PartitionState::Archived;
                format!(
                    "ALTER TABLE change_records DETACH PARTITION \"{name}\";
                     ALTER TABLE \"{name}\" SET SCHEMA {ARCHIVE_SCHEMA};"
                )
            }
            RetentionAction::Drop => {
                partition.state = PartitionState::Dropped;
                format!(
                    "ALTER TABLE change_records DETACH PARTITION \"{name}\";
                     DROP TABLE \"{name}\";"
                )
            }
        };
        tx.batch_execute(&statement).map_err(pg_err)?;
        tx.execute(
            "UPDATE trail_partitions SET state = $1, record_count = $2, retired_at = $3
             WHERE name = $4",
            &[
                &partition.state.as_str(),
                &(partition.record_count as i64),
                &at,
                &name,
            ],
        )
        .map_err(pg_err)?;
        tx.commit().map_err(pg_err)?;
        Ok(partition)
    }

    fn read_archived(&self, name: &str) -> Result<Vec<ChangeRecord>, StoreError> {
        if !is_valid_partition_name(name) {
            return Err(StoreError::NotFound(format!("archived partition {name}")));
        }
        let mut client = self.client.lock();
        match load_partition(&mut *client, name)? {
            Some(partition) if partition.state == PartitionState::Archived => {}
            Some(_) => {
                return Err(StoreError::NotFound(format!(
                    "partition {name} is not archived"
                )))
            }
            None => return Err(StoreError::NotFound(format!("archived partition {name}"))),
        }
        let rows = client
            .query(
                &format!("SELECT {RECORD_COLUMNS} FROM {ARCHIVE_SCHEMA}.\"{name}\" ORDER BY id ASC"),
                &[],
            )
            .map_err(pg_err)?;
        rows.iter().map(record_from_row).collect()
    }
}

impl AlertStore for PgTrailStore {
    fn put_rule(&self, rule: AlertRule) -> Result<(), StoreError> {
        rule.validate().map_err(StoreError::Integrity)?;
        let definition = to_json(&rule)?;
        let mut client = self.client.lock();
        client
            .execute(
                "INSERT INTO alert_rules (name, definition) VALUES ($1, $2)
                 ON CONFLICT (name) DO UPDATE SET definition = EXCLUDED.definition",
                &[&rule.name, &definition],
            )
            .map_err(pg_err)?;
        Ok(())
    }

    fn set_rule_enabled(&self, name: &str, enabled: bool) -> Result<(), StoreError> {
        let mut client = self.client.lock();
        let updated = client
            .execute(
                "UPDATE alert_rules
                 SET definition = jsonb_set(definition, '{enabled}', to_jsonb($2::BOOLEAN))
                 WHERE name = $1",
                &[&name, &enabled],
            )
            .map_err(pg_err)?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("alert rule {name}")));
        }
        Ok(())
    }

    fn list_rules(&self) -> Result<Vec<AlertRule>, StoreError> {
        let mut client = self.client.lock();
        let rows = client
            .query("SELECT definition FROM alert_rules ORDER BY name ASC", &[])
            .map_err(pg_err)?;
        rows.iter()
            .map(|row| {
                let definition: Value = row.try_get(0).map_err(pg_err)?;
                from_json(definition)
            })
            .collect()
    }

    fn fire_if_cooled(&self, firing: AlertFiring) -> Result<Option<AlertEvent>, StoreError> {
        let mut client = self.client.lock();
        let mut tx = client.transaction().map_err(pg_err)?;
        // The rule row lock serializes concurrent evaluators for the same rule.
        let row = tx
            .query_opt(
                "SELECT definition FROM alert_rules WHERE name = $1 FOR UPDATE",
                &[&firing.rule_name],
            )
            .map_err(pg_err)?
            .ok_or_else(|| StoreError::NotFound(format!("alert rule {}", firing.rule_name)))?;
        let definition: Value = row.try_get(0).map_err(pg_err)?;
        let rule: AlertRule = from_json(definition)?;
        let last: Option<DateTime<Utc>> = tx
            .query_one(
                "SELECT MAX(fired_at) FROM alert_events WHERE rule_name = $1",
                &[&firing.rule_name],
            )
            .map_err(pg_err)?
            .try_get(0)
            .map_err(pg_err)?;
        if let Some(last) = last {
            if within_cooldown(last, firing.fired_at, rule.cooldown()) {
                return Ok(None);
            }
        }
        let row = tx
            .query_one(
                "INSERT INTO alert_events (rule_name, fired_at, observed_value, severity, subject)
                 VALUES ($1, $2, $3, $4, $5) RETURNING id",
                &[
                    &firing.rule_name,
                    &firing.fired_at,
                    &firing.observed_value,
                    &firing.severity.as_str(),
                    &firing.subject,
                ],
            )
            .map_err(pg_err)?;
        let id: i64 = row.try_get(0).map_err(pg_err)?;
        tx.commit().map_err(pg_err)?;
        Ok(Some(AlertEvent {
            id: id as u64,
            rule_name: firing.rule_name,
            fired_at: firing.fired_at,
            observed_value: firing.observed_value,
            severity: firing.severity,
            subject: firing.subject,
            acknowledged_at: None,
            acknowledged_by: None,
        }))
    }

    fn events(&self, range: TimeRange) -> Result<Vec<AlertEvent>, StoreError> {
        let mut client = self.client.lock();
        let rows = client
            .query(
                "SELECT id, rule_name, fired_at, observed_value, severity, subject,
                        acknowledged_at, acknowledged_by
                 FROM alert_events WHERE fired_at >= $1 AND fired_at < $2
                 ORDER BY fired_at DESC, id DESC",
                &[&range.start, &range.end],
            )
            .map_err(pg_err)?;
        rows.iter().map(event_from_row).collect()
    }

    fn acknowledge(
        &self,
        event_id: u64,
        by: &str,
        at: DateTime<Utc>,
    ) -> Result<AlertEvent, StoreError> {
        let mut client = self.client.lock();
        client
            .execute(
                "UPDATE alert_events SET acknowledged_at = $1, acknowledged_by = $2
                 WHERE id = $3 AND acknowledged_at IS NULL",
                &[&at, &by, &(event_id as i64)],
            )
            .map_err(pg_err)?;
        let row = client
            .query_opt(
                "SELECT id, rule_name, fired_at, observed_value, severity, subject,
                        acknowledged_at, acknowledged_by
                 FROM alert_events WHERE id = $1",
                &[&(event_id as i64)],
            )
            .map_err(pg_err)?
            .ok_or_else(|| StoreError::NotFound(format!("alert event {event_id}")))?;
        event_from_row(&row)
    }
}

impl PolicyStore for PgTrailStore {
    fn capture_enabled(&self, entity: &str) -> Result<bool, StoreError> {
        let mut client = self.client.lock();
        let row = client
            .query_opt("SELECT 1 FROM capture_entities WHERE entity = $1", &[&entity])
            .map_err(pg_err)?;
        Ok(row.is_some())
    }

    fn set_capture_enabled(&self, entity: &str, enabled: bool) -> Result<(), StoreError> {
        let mut client = self.client.lock();
        let sql = if enabled {
            "INSERT INTO capture_entities (entity) VALUES ($1) ON CONFLICT (entity) DO NOTHING"
        } else {
            "DELETE FROM capture_entities WHERE entity = $1"
        };
        client.execute(sql, &[&entity]).map_err(pg_err)?;
        Ok(())
    }

    fn enabled_entities(&self) -> Result<Vec<String>, StoreError> {
        let mut client = self.client.lock();
        let rows = client
            .query("SELECT entity FROM capture_entities ORDER BY entity ASC", &[])
            .map_err(pg_err)?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(pg_err))
            .collect()
    }

    fn entity_exclusions(&self, entity: &str) -> Result<ExclusionSet, StoreError> {
        let mut client = self.client.lock();
        let rows = client
            .query(
                "SELECT field FROM capture_exclusions WHERE entity = $1",
                &[&entity],
            )
            .map_err(pg_err)?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(pg_err))
            .collect()
    }

    fn put_exclusion(&self, rule: ExclusionRule) -> Result<(), StoreError> {
        let mut client = self.client.lock();
        client
            .execute(
                "INSERT INTO capture_exclusions (entity, field, reason) VALUES ($1, $2, $3)
                 ON CONFLICT (entity, field) DO UPDATE SET reason = EXCLUDED.reason",
                &[&rule.entity, &rule.field, &rule.reason],
            )
            .map_err(pg_err)?;
        Ok(())
    }

    fn delete_exclusion(&self, entity: &str, field: &str) -> Result<bool, StoreError> {
        let mut client = self.client.lock();
        let removed = client
            .execute(
                "DELETE FROM capture_exclusions WHERE entity = $1 AND field = $2",
                &[&entity, &field],
            )
            .map_err(pg_err)?;
        Ok(removed > 0)
    }

    fn exclusion_rules(&self) -> Result<Vec<ExclusionRule>, StoreError> {
        let mut client = self.client.lock();
        let rows = client
            .query(
                "SELECT entity, field, reason FROM capture_exclusions
                 ORDER BY entity ASC, field ASC",
                &[],
            )
            .map_err(pg_err)?;
        rows.iter()
            .map(|row| {
                Ok(ExclusionRule {
                    entity: row.try_get(0).map_err(pg_err)?,
                    field: row.try_get(1).map_err(pg_err)?,
                    reason: row.try_get(2).map_err(pg_err)?,
                })
            })
            .collect()
    }
}

fn pg_err(err: postgres::Error) -> StoreError {
    StoreError::Store(err.to_string())
}

fn pg_limit(limit: usize) -> Option<i64> {
    if limit == 0 {
        None
    } else {
        Some(limit as i64)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|err| StoreError::Serialization(err.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|err| StoreError::Serialization(err.to_string()))
}

fn insert_change<C: GenericClient>(
    client: &mut C,
    change: CapturedChange,
) -> Result<ChangeRecord, StoreError> {
    let row = client
        .query_one("SELECT nextval('change_record_ids')", &[])
        .map_err(pg_err)?;
    let id: i64 = row.try_get(0).map_err(pg_err)?;
    let record = change.into_record(id as u64);
    let old_snapshot = record.old_snapshot.as_ref().map(RowSnapshot::to_json);
    let new_snapshot = record.new_snapshot.as_ref().map(RowSnapshot::to_json);
    client
        .execute(
            &format!(
                "INSERT INTO change_records ({RECORD_COLUMNS})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
            ),
            &[
                &id,
                &record.entity,
                &record.operation.as_str(),
                &record.row_id,
                &old_snapshot,
                &new_snapshot,
                &to_json(&record.changed_fields)?,
                &to_json(&record.redacted_fields)?,
                &record.captured_at,
                &record.context.actor_id,
                &record.context.tenant_id,
                &record.context.request_id,
                &record.context.client_address,
                &(record.transaction_id as i64),
                &i64::from(record.sequence),
            ],
        )
        .map_err(pg_err)?;
    Ok(record)
}

fn record_from_row(row: &Row) -> Result<ChangeRecord, StoreError> {
    let id: i64 = row.try_get("id").map_err(pg_err)?;
    let operation: String = row.try_get("operation").map_err(pg_err)?;
    let old_snapshot: Option<Value> = row.try_get("old_snapshot").map_err(pg_err)?;
    let new_snapshot: Option<Value> = row.try_get("new_snapshot").map_err(pg_err)?;
    let changed_fields: Value = row.try_get("changed_fields").map_err(pg_err)?;
    let redacted_fields: Value = row.try_get("redacted_fields").map_err(pg_err)?;
    let transaction_id: i64 = row.try_get("transaction_id").map_err(pg_err)?;
    let sequence: i64 = row.try_get("sequence").map_err(pg_err)?;
    Ok(ChangeRecord {
        id: id as u64,
        entity: row.try_get("entity").map_err(pg_err)?,
        operation: operation.parse().map_err(StoreError::Serialization)?,
        row_id: row.try_get("row_id").map_err(pg_err)?,
        old_snapshot: old_snapshot.map(from_json::<RowSnapshot>).transpose()?,
        new_snapshot: new_snapshot.map(from_json::<RowSnapshot>).transpose()?,
        changed_fields: from_json::<BTreeSet<String>>(changed_fields)?,
        redacted_fields: from_json::<BTreeSet<String>>(redacted_fields)?,
        captured_at: row.try_get("captured_at").map_err(pg_err)?,
        context: CaptureContext {
            actor_id: row.try_get("actor_id").map_err(pg_err)?,
            tenant_id: row.try_get("tenant_id").map_err(pg_err)?,
            request_id: row.try_get("request_id").map_err(pg_err)?,
            client_address: row.try_get("client_address").map_err(pg_err)?,
        },
        transaction_id: transaction_id as u64,
        sequence: u32::try_from(sequence)
            .map_err(|err| StoreError::Serialization(err.to_string()))?,
    })
}

fn top_subject<C: GenericClient>(
    client: &mut C,
    column: &str,
    range: TimeRange,
) -> Result<Option<ActivityCount>, StoreError> {
    let row = client
        .query_opt(
            &format!(
                "SELECT {column}, COUNT(*) AS total FROM change_records
                 WHERE {column} IS NOT NULL AND captured_at >= $1 AND captured_at < $2
                 GROUP BY {column} ORDER BY total DESC, {column} ASC LIMIT 1"
            ),
            &[&range.start, &range.end],
        )
        .map_err(pg_err)?;
    let Some(row) = row else {
        return Ok(None);
    };
    let count: i64 = row.try_get(1).map_err(pg_err)?;
    Ok(Some(ActivityCount {
        subject: row.try_get(0).map_err(pg_err)?,
        count: count.max(0) as u64,
    }))
}

fn table_count<C: GenericClient>(client: &mut C, table: &str) -> Result<u64, StoreError> {
    let row = client
        .query_one(&format!("SELECT COUNT(*) FROM \"{table}\""), &[])
        .map_err(pg_err)?;
    let count: i64 = row.try_get(0).map_err(pg_err)?;
    Ok(count.max(0) as u64)
}

fn with_live_count<C: GenericClient>(
    client: &mut C,
    mut partition: Partition,
) -> Result<Partition, StoreError> {
    if partition.state == PartitionState::Active {
        partition.record_count = table_count(client, &partition.name)?;
    }
    Ok(partition)
}

fn partition_from_row(row: &Row) -> Result<Partition, StoreError> {
    let state: String = row.try_get(3).map_err(pg_err)?;
    let record_count: i64 = row.try_get(4).map_err(pg_err)?;
    Ok(Partition {
        name: row.try_get(0).map_err(pg_err)?,
        bounds: Some(TimeRange::new(
            row.try_get(1).map_err(pg_err)?,
            row.try_get(2).map_err(pg_err)?,
        )),
        state: state.parse().map_err(StoreError::Serialization)?,
        record_count: record_count.max(0) as u64,
        retired_at: row.try_get(5).map_err(pg_err)?,
    })
}

fn load_partition<C: GenericClient>(
    client: &mut C,
    name: &str,
) -> Result<Option<Partition>, StoreError> {
    let row = client
        .query_opt(
            "SELECT name, range_start, range_end, state, record_count, retired_at
             FROM trail_partitions WHERE name = $1",
            &[&name],
        )
        .map_err(pg_err)?;
    row.as_ref().map(partition_from_row).transpose()
}

fn event_from_row(row: &Row) -> Result<AlertEvent, StoreError> {
    let id: i64 = row.try_get(0).map_err(pg_err)?;
    let severity: String = row.try_get(4).map_err(pg_err)?;
    Ok(AlertEvent {
        id: id as u64,
        rule_name: row.try_get(1).map_err(pg_err)?,
        fired_at: row.try_get(2).map_err(pg_err)?,
        observed_value: row.try_get(3).map_err(pg_err)?,
        severity: severity.parse::<Severity>().map_err(StoreError::Serialization)?,
        subject: row.try_get(5).map_err(pg_err)?,
        acknowledged_at: row.try_get(6).map_err(pg_err)?,
        acknowledged_by: row.try_get(7).map_err(pg_err)?,
    })
}
