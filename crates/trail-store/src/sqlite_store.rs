use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, Transaction,
    TransactionBehavior,
};

use crate::alert::{within_cooldown, AlertEvent, AlertFiring, AlertRule, Severity};
use crate::clock::{from_millis, to_millis};
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
     changed_fields, redacted_fields, captured_at_ms, actor_id, tenant_id, request_id, \
     client_address, transaction_id, sequence";

const NEWEST_FIRST: &str =
    "ORDER BY captured_at_ms DESC, transaction_id DESC, sequence DESC, id DESC";

/// SQLite backend. Every partition is its own table in `main`; retired
/// partitions move into the attached `archive` database.
pub struct SqliteTrailStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTrailStore {
    /// Opens `path` with the cold namespace next to it (`<path>.archive`), or
    /// in memory when `path` is `:memory:`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let archive_path = if path == ":memory:" {
            ":memory:".to_string()
        } else {
            format!("{path}.archive")
        };
        Self::open_with_archive(path, &archive_path)
    }

    pub fn open_with_archive(path: &str, archive_path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(store_err)?;
        conn.execute("ATTACH DATABASE ?1 AS archive", params![archive_path])
            .map_err(store_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS trail_sequences (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO trail_sequences (name, value)
                VALUES ('record', 0), ('transaction', 0);
            CREATE TABLE IF NOT EXISTS trail_partitions (
                name TEXT PRIMARY KEY,
                start_ms INTEGER NOT NULL,
                end_ms INTEGER NOT NULL,
                state TEXT NOT NULL,
                record_count INTEGER NOT NULL DEFAULT 0,
                retired_at_ms INTEGER
            );
            CREATE TABLE IF NOT EXISTS capture_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload TEXT NOT NULL,
                enqueued_at_ms INTEGER NOT NULL,
                claimed_by TEXT,
                claim_expires_ms INTEGER
            );
            CREATE TABLE IF NOT EXISTS alert_rules (
                name TEXT PRIMARY KEY,
                definition TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS alert_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rule_name TEXT NOT NULL,
                fired_at_ms INTEGER NOT NULL,
                observed_value REAL NOT NULL,
                severity TEXT NOT NULL,
                subject TEXT,
                acknowledged_at_ms INTEGER,
                acknowledged_by TEXT
            );
            CREATE INDEX IF NOT EXISTS alert_events_rule ON alert_events (rule_name, fired_at_ms);
            CREATE TABLE IF NOT EXISTS capture_entities (
                entity TEXT PRIMARY KEY
            );
            CREATE TABLE IF NOT EXISTS capture_exclusions (
                entity TEXT NOT NULL,
                field TEXT NOT NULL,
                reason TEXT NOT NULL,
                PRIMARY KEY (entity, field)
            );",
        )
        .map_err(store_err)?;
        conn.execute_batch(&record_table_ddl(DEFAULT_PARTITION))
            .map_err(store_err)?;
        Ok(())
    }

    fn immediate<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(store_err)?;
        let value = f(&tx)?;
        tx.commit().map_err(store_err)?;
        Ok(value)
    }
}

impl ChangelogStore for SqliteTrailStore {
    fn next_transaction_id(&self) -> Result<u64, StoreError> {
        self.immediate(|tx| next_sequence(tx, "transaction"))
    }

    fn append(&self, changes: Vec<CapturedChange>) -> Result<Vec<ChangeRecord>, StoreError> {
        for change in &changes {
            change.validate().map_err(StoreError::Integrity)?;
        }
        self.immediate(|tx| {
            changes
                .into_iter()
                .map(|change| insert_change(tx, change))
                .collect()
        })
    }

    fn history(
        &self,
        entity: &str,
        row_id: &str,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        let conn = self.conn.lock();
        let tables = tables_for(&conn, None)?;
        let sql = format!(
            "SELECT * FROM ({}) {NEWEST_FIRST} LIMIT ?3",
            union_select(&tables, RECORD_COLUMNS, "entity = ?1 AND row_id = ?2")
        );
        query_records(&conn, &sql, params![entity, row_id, sql_limit(limit)])
    }

    fn changes_after(
        &self,
        entity: &str,
        row_id: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        let conn = self.conn.lock();
        let tables = tables_for(&conn, None)?;
        let sql = format!(
            "SELECT * FROM ({}) {NEWEST_FIRST}",
            union_select(
                &tables,
                RECORD_COLUMNS,
                "entity = ?1 AND row_id = ?2 AND captured_at_ms > ?3"
            )
        );
        query_records(&conn, &sql, params![entity, row_id, to_millis(after)])
    }

    fn by_actor(
        &self,
        actor_id: &str,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        let conn = self.conn.lock();
        let tables = tables_for(&conn, Some(range))?;
        let sql = format!(
            "SELECT * FROM ({}) {NEWEST_FIRST} LIMIT ?4",
            union_select(
                &tables,
                RECORD_COLUMNS,
                "actor_id = ?1 AND captured_at_ms >= ?2 AND captured_at_ms < ?3"
            )
        );
        query_records(
            &conn,
            &sql,
            params![
                actor_id,
                to_millis(range.start),
                to_millis(range.end),
                sql_limit(limit)
            ],
        )
    }

    fn by_tenant(
        &self,
        tenant_id: &str,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        let conn = self.conn.lock();
        let tables = tables_for(&conn, Some(range))?;
        let sql = format!(
            "SELECT * FROM ({}) {NEWEST_FIRST} LIMIT ?4",
            union_select(
                &tables,
                RECORD_COLUMNS,
                "tenant_id = ?1 AND captured_at_ms >= ?2 AND captured_at_ms < ?3"
            )
        );
        query_records(
            &conn,
            &sql,
            params![
                tenant_id,
                to_millis(range.start),
                to_millis(range.end),
                sql_limit(limit)
            ],
        )
    }

    fn by_transaction(&self, transaction_id: u64) -> Result<Vec<ChangeRecord>, StoreError> {
        let conn = self.conn.lock();
        let tables = tables_for(&conn, None)?;
        let sql = format!(
            "SELECT * FROM ({}) ORDER BY sequence ASC, id ASC",
            union_select(&tables, RECORD_COLUMNS, "transaction_id = ?1")
        );
        query_records(&conn, &sql, params![transaction_id as i64])
    }

    fn summary(&self, range: TimeRange) -> Result<Vec<ChangeSummaryRow>, StoreError> {
        let conn = self.conn.lock();
        let tables = tables_for(&conn, Some(range))?;
        let sql = format!(
            "SELECT entity, operation, COUNT(*) FROM ({}) GROUP BY entity, operation
             ORDER BY entity, operation",
            union_select(
                &tables,
                "entity, operation",
                "captured_at_ms >= ?1 AND captured_at_ms < ?2"
            )
        );
        let mut stmt = conn.prepare(&sql).map_err(store_err)?;
        let rows = stmt
            .query_map(params![to_millis(range.start), to_millis(range.end)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .map_err(store_err)?;
        let mut summary = Vec::new();
        for row in rows {
            let (entity, operation, count) = row.map_err(store_err)?;
            summary.push(ChangeSummaryRow {
                entity,
                operation: operation.parse().map_err(StoreError::Serialization)?,
                count: count.max(0) as u64,
            });
        }
        Ok(summary)
    }

    fn count(&self, range: TimeRange, filter: &ChangeFilter) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let tables = tables_for(&conn, Some(range))?;
        let mut predicate = "captured_at_ms >= ?1 AND captured_at_ms < ?2".to_string();
        let mut values = vec![
            SqlValue::Integer(to_millis(range.start)),
            SqlValue::Integer(to_millis(range.end)),
        ];
        if let Some(entity) = &filter.entity {
            values.push(SqlValue::Text(entity.clone()));
            predicate.push_str(&format!(" AND entity = ?{}", values.len()));
        }
        if let Some(operation) = filter.operation {
            values.push(SqlValue::Text(operation.as_str().to_string()));
            predicate.push_str(&format!(" AND operation = ?{}", values.len()));
        }
        let sql = format!(
            "SELECT COUNT(*) FROM ({})",
            union_select(&tables, "id", &predicate)
        );
        let count: i64 = conn
            .query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))
            .map_err(store_err)?;
        Ok(count.max(0) as u64)
    }

    fn top_actor(&self, range: TimeRange) -> Result<Option<ActivityCount>, StoreError> {
        let conn = self.conn.lock();
        top_subject(&conn, "actor_id", range)
    }

    fn top_tenant(&self, range: TimeRange) -> Result<Option<ActivityCount>, StoreError> {
        let conn = self.conn.lock();
        top_subject(&conn, "tenant_id", range)
    }
}

impl CaptureQueue for SqliteTrailStore {
    fn enqueue(
        &self,
        changes: Vec<CapturedChange>,
        enqueued_at: DateTime<Utc>,
    ) -> Result<Vec<u64>, StoreError> {
        for change in &changes {
            change.validate().map_err(StoreError::Integrity)?;
        }
        self.immediate(|tx| {
            let mut ids = Vec::with_capacity(changes.len());
            for change in &changes {
                let payload = serde_json::to_string(change)
                    .map_err(|err| StoreError::Serialization(err.to_string()))?;
                tx.execute(
                    "INSERT INTO capture_queue (payload, enqueued_at_ms) VALUES (?1, ?2)",
                    params![payload, to_millis(enqueued_at)],
                )
                .map_err(store_err)?;
                ids.push(tx.last_insert_rowid() as u64);
            }
            Ok(ids)
        })
    }

    fn claim(
        &self,
        owner: &str,
        limit: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let now_ms = to_millis(now);
        let expires_at = now + lease;
        self.immediate(|tx| {
            let candidates = {
                let mut stmt = tx
                    .prepare(
                        "SELECT id, payload, enqueued_at_ms FROM capture_queue
                         WHERE claimed_by IS NULL OR claim_expires_ms <= ?1
                         ORDER BY id ASC LIMIT ?2",
                    )
                    .map_err(store_err)?;
                let rows = stmt
                    .query_map(params![now_ms, limit as i64], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    })
                    .map_err(store_err)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(store_err)?
            };
            let mut claimed = Vec::with_capacity(candidates.len());
            for (id, payload, enqueued_at_ms) in candidates {
                tx.execute(
                    "UPDATE capture_queue SET claimed_by = ?1, claim_expires_ms = ?2 WHERE id = ?3",
                    params![owner, to_millis(expires_at), id],
                )
                .map_err(store_err)?;
                claimed.push(QueueEntry {
                    id: id as u64,
                    change: decode_change(&payload)?,
                    enqueued_at: millis_to_time(enqueued_at_ms)?,
                    claim: Some(QueueClaim {
                        owner: owner.to_string(),
                        expires_at,
                    }),
                });
            }
            Ok(claimed)
        })
    }

    fn promote(&self, owner: &str, entry_ids: &[u64]) -> Result<Vec<ChangeRecord>, StoreError> {
        self.immediate(|tx| {
            let mut promoted = Vec::with_capacity(entry_ids.len());
            for id in entry_ids {
                let payload: Option<String> = tx
                    .query_row(
                        "SELECT payload FROM capture_queue WHERE id = ?1 AND claimed_by = ?2",
                        params![*id as i64, owner],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(store_err)?;
                let Some(payload) = payload else {
                    continue;
                };
                let change = decode_change(&payload)?;
                change.validate().map_err(StoreError::Integrity)?;
                tx.execute("DELETE FROM capture_queue WHERE id = ?1", params![*id as i64])
                    .map_err(store_err)?;
                promoted.push(insert_change(tx, change)?);
            }
            Ok(promoted)
        })
    }

    fn release(&self, owner: &str, entry_ids: &[u64]) -> Result<usize, StoreError> {
        self.immediate(|tx| {
            let mut released = 0;
            for id in entry_ids {
                released += tx
                    .execute(
                        "UPDATE capture_queue SET claimed_by = NULL, claim_expires_ms = NULL
                         WHERE id = ?1 AND claimed_by = ?2",
                        params![*id as i64, owner],
                    )
                    .map_err(store_err)?;
            }
            Ok(released)
        })
    }

    fn depth(&self, now: DateTime<Utc>) -> Result<QueueDepth, StoreError> {
        let conn = self.conn.lock();
        let (pending, total): (i64, i64) = conn
            .query_row(
                "SELECT COALESCE(SUM(CASE WHEN claimed_by IS NULL OR claim_expires_ms <= ?1
                                     THEN 1 ELSE 0 END), 0),
                        COUNT(*)
                 FROM capture_queue",
                params![to_millis(now)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(store_err)?;
        Ok(QueueDepth {
            pending: pending.max(0) as u64,
            claimed: (total - pending).max(0) as u64,
        })
    }

    fn queued_for_row(&self, entity: &str, row_id: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let queued: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM capture_queue
                 WHERE json_extract(payload, '$.entity') = ?1
                   AND json_extract(payload, '$.row_id') = ?2",
                params![entity, row_id],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        Ok(queued.max(0) as u64)
    }
}

impl PartitionCatalog for SqliteTrailStore {
    fn create_partition(
        &self,
        period: PartitionPeriod,
        at: DateTime<Utc>,
    ) -> Result<Partition, StoreError> {
        let bounds = period.bounds_containing(at);
        let name = period.partition_name(&bounds);
        let (start_ms, end_ms) = (to_millis(bounds.start), to_millis(bounds.end));
        self.immediate(|tx| {
            if let Some(existing) = load_partition(tx, &name)? {
                if existing.state != PartitionState::Active {
                    return Err(StoreError::Conflict(format!("partition {name} already retired")));
                }
                if existing.bounds != Some(bounds) {
                    return Err(StoreError::Conflict(format!(
                        "partition {name} exists with different bounds"
                    )));
                }
                return with_live_count(tx, existing);
            }
            let overlapping: Option<String> = tx
                .query_row(
                    "SELECT name FROM trail_partitions WHERE start_ms < ?2 AND end_ms > ?1 LIMIT 1",
                    params![start_ms, end_ms],
                    |row| row.get(0),
                )
                .optional()
                .map_err(store_err)?;
            if let Some(other) = overlapping {
                return Err(StoreError::Conflict(format!("partition {name} overlaps {other}")));
            }

            tx.execute_batch(&record_table_ddl(&name)).map_err(store_err)?;
            let moved = tx
                .execute(
                    &format!(
                        "INSERT INTO \"{name}\" SELECT * FROM \"{DEFAULT_PARTITION}\"
                         WHERE captured_at_ms >= ?1 AND captured_at_ms < ?2"
                    ),
                    params![start_ms, end_ms],
                )
                .map_err(store_err)?;
            tx.execute(
                &format!(
                    "DELETE FROM \"{DEFAULT_PARTITION}\" WHERE captured_at_ms >= ?1 AND captured_at_ms < ?2"
                ),
                params![start_ms, end_ms],
            )
            .map_err(store_err)?;
            tx.execute(
                "INSERT INTO trail_partitions (name, start_ms, end_ms, state, record_count)
                 VALUES (?1, ?2, ?3, 'active', ?4)",
                params![name, start_ms, end_ms, moved as i64],
            )
            .map_err(store_err)?;
            let mut partition = Partition::active(name.clone(), bounds);
            partition.record_count = moved as u64;
            Ok(partition)
        })
    }

    fn list_partitions(&self) -> Result<Vec<Partition>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT name, start_ms, end_ms, state, record_count, retired_at_ms
                 FROM trail_partitions ORDER BY start_ms ASC",
            )
            .map_err(store_err)?;
        let rows = stmt.query_map([], raw_partition).map_err(store_err)?;
        let mut partitions = Vec::new();
        for row in rows {
            let partition = partition_from_raw(row.map_err(store_err)?)?;
            partitions.push(with_live_count(&conn, partition)?);
        }
        partitions.push(Partition::default_partition(table_count(
            &conn,
            DEFAULT_PARTITION,
        )?));
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
        self.immediate(|tx| {
            let Some(mut partition) = load_partition(tx, name)? else {
                return Err(StoreError::NotFound(format!("partition {name}")));
            };
            if partition.state != PartitionState::Active {
                return Ok(partition);
            }
            partition.record_count = table_count(tx, name)?;
            partition.retired_at = Some(at);
            match action {
                RetentionAction::Archive => {
                    tx.execute_batch(&format!(
                        "CREATE TABLE archive.\"{name}\" AS SELECT * FROM main.\"{name}\";
                         DROP TABLE main.\"{name}\";"
                    ))
                    .map_err(store_err)?;
                    partition.state = PartitionState::Archived;
                }
                RetentionAction::Drop => {
                    tx.execute_batch(&format!("DROP TABLE main.\"{name}\";"))
                        .map_err(store_err)?;
                    partition.state = PartitionState::Dropped;
                }
            }
            tx.execute(
                "UPDATE trail_partitions SET state = ?1, record_count = ?2, retired_at_ms = ?3
                 WHERE name = ?4",
                params![
                    partition.state.as_str(),
                    partition.record_count as i64,
                    to_millis(at),
                    name
                ],
            )
            .map_err(store_err)?;
            Ok(partition)
        })
    }

    fn read_archived(&self, name: &str) -> Result<Vec<ChangeRecord>, StoreError> {
        if !is_valid_partition_name(name) {
            return Err(StoreError::NotFound(format!("archived partition {name}")));
        }
        let conn = self.conn.lock();
        match load_partition(&conn, name)? {
            Some(partition) if partition.state == PartitionState::Archived => {}
            Some(_) => {
                return Err(StoreError::NotFound(format!(
                    "partition {name} is not archived"
                )))
            }
            None => return Err(StoreError::NotFound(format!("archived partition {name}"))),
        }
        let sql = format!("SELECT {RECORD_COLUMNS} FROM archive.\"{name}\" ORDER BY id ASC");
        query_records(&conn, &sql, [])
    }
}

impl AlertStore for SqliteTrailStore {
    fn put_rule(&self, rule: AlertRule) -> Result<(), StoreError> {
        rule.validate().map_err(StoreError::Integrity)?;
        let definition = serde_json::to_string(&rule)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO alert_rules (name, definition) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET definition = excluded.definition",
            params![rule.name, definition],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn set_rule_enabled(&self, name: &str, enabled: bool) -> Result<(), StoreError> {
        self.immediate(|tx| {
            let mut rule = load_rule(tx, name)?
                .ok_or_else(|| StoreError::NotFound(format!("alert rule {name}")))?;
            rule.enabled = enabled;
            let definition = serde_json::to_string(&rule)
                .map_err(|err| StoreError::Serialization(err.to_string()))?;
            tx.execute(
                "UPDATE alert_rules SET definition = ?1 WHERE name = ?2",
                params![definition, name],
            )
            .map_err(store_err)?;
            Ok(())
        })
    }

    fn list_rules(&self) -> Result<Vec<AlertRule>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT definition FROM alert_rules ORDER BY name ASC")
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(store_err)?;
        let mut rules = Vec::new();
        for row in rows {
            let definition = row.map_err(store_err)?;
            rules.push(
                serde_json::from_str(&definition)
                    .map_err(|err| StoreError::Serialization(err.to_string()))?,
            );
        }
        Ok(rules)
    }

    fn fire_if_cooled(&self, firing: AlertFiring) -> Result<Option<AlertEvent>, StoreError> {
        self.immediate(|tx| {
            let rule = load_rule(tx, &firing.rule_name)?.ok_or_else(|| {
                StoreError::NotFound(format!("alert rule {}", firing.rule_name))
            })?;
            let last_ms: Option<i64> = tx
                .query_row(
                    "SELECT MAX(fired_at_ms) FROM alert_events WHERE rule_name = ?1",
                    params![firing.rule_name],
                    |row| row.get(0),
                )
                .map_err(store_err)?;
            if let Some(last_ms) = last_ms {
                if within_cooldown(millis_to_time(last_ms)?, firing.fired_at, rule.cooldown()) {
                    return Ok(None);
                }
            }
            tx.execute(
                "INSERT INTO alert_events (rule_name, fired_at_ms, observed_value, severity, subject)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    firing.rule_name,
                    to_millis(firing.fired_at),
                    firing.observed_value,
                    firing.severity.as_str(),
                    firing.subject
                ],
            )
            .map_err(store_err)?;
            Ok(Some(AlertEvent {
                id: tx.last_insert_rowid() as u64,
                rule_name: firing.rule_name,
                fired_at: firing.fired_at,
                observed_value: firing.observed_value,
                severity: firing.severity,
                subject: firing.subject,
                acknowledged_at: None,
                acknowledged_by: None,
            }))
        })
    }

    fn events(&self, range: TimeRange) -> Result<Vec<AlertEvent>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, rule_name, fired_at_ms, observed_value, severity, subject,
                        acknowledged_at_ms, acknowledged_by
                 FROM alert_events WHERE fired_at_ms >= ?1 AND fired_at_ms < ?2
                 ORDER BY fired_at_ms DESC, id DESC",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(
                params![to_millis(range.start), to_millis(range.end)],
                raw_event,
            )
            .map_err(store_err)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(event_from_raw(row.map_err(store_err)?)?);
        }
        Ok(events)
    }

    fn acknowledge(
        &self,
        event_id: u64,
        by: &str,
        at: DateTime<Utc>,
    ) -> Result<AlertEvent, StoreError> {
        self.immediate(|tx| {
            tx.execute(
                "UPDATE alert_events SET acknowledged_at_ms = ?1, acknowledged_by = ?2
                 WHERE id = ?3 AND acknowledged_at_ms IS NULL",
                params![to_millis(at), by, event_id as i64],
            )
            .map_err(store_err)?;
            let raw = tx
                .query_row(
                    "SELECT id, rule_name, fired_at_ms, observed_value, severity, subject,
                            acknowledged_at_ms, acknowledged_by
                     FROM alert_events WHERE id = ?1",
                    params![event_id as i64],
                    raw_event,
                )
                .optional()
                .map_err(store_err)?
                .ok_or_else(|| StoreError::NotFound(format!("alert event {event_id}")))?;
            event_from_raw(raw)
        })
    }
}

impl PolicyStore for SqliteTrailStore {
    fn capture_enabled(&self, entity: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM capture_entities WHERE entity = ?1",
                params![entity],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        Ok(found.is_some())
    }

    fn set_capture_enabled(&self, entity: &str, enabled: bool) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let sql = if enabled {
            "INSERT OR IGNORE INTO capture_entities (entity) VALUES (?1)"
        } else {
            "DELETE FROM capture_entities WHERE entity = ?1"
        };
        conn.execute(sql, params![entity]).map_err(store_err)?;
        Ok(())
    }

    fn enabled_entities(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT entity FROM capture_entities ORDER BY entity ASC")
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(store_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(store_err)
    }

    fn entity_exclusions(&self, entity: &str) -> Result<ExclusionSet, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT field FROM capture_exclusions WHERE entity = ?1")
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![entity], |row| row.get::<_, String>(0))
            .map_err(store_err)?;
        rows.collect::<rusqlite::Result<ExclusionSet>>().map_err(store_err)
    }

    fn put_exclusion(&self, rule: ExclusionRule) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO capture_exclusions (entity, field, reason) VALUES (?1, ?2, ?3)
             ON CONFLICT(entity, field) DO UPDATE SET reason = excluded.reason",
            params![rule.entity, rule.field, rule.reason],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn delete_exclusion(&self, entity: &str, field: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let removed = conn
            .execute(
                "DELETE FROM capture_exclusions WHERE entity = ?1 AND field = ?2",
                params![entity, field],
            )
            .map_err(store_err)?;
        Ok(removed > 0)
    }

    fn exclusion_rules(&self) -> Result<Vec<ExclusionRule>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT entity, field, reason FROM capture_exclusions
                 ORDER BY entity ASC, field ASC",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ExclusionRule {
                    entity: row.get(0)?,
                    field: row.get(1)?,
                    reason: row.get(2)?,
                })
            })
            .map_err(store_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(store_err)
    }
}

fn store_err(err: rusqlite::Error) -> StoreError {
    StoreError::Store(err.to_string())
}

fn millis_to_time(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    from_millis(ms).ok_or_else(|| StoreError::Serialization(format!("timestamp out of range: {ms}")))
}

fn sql_limit(limit: usize) -> i64 {
    if limit == 0 {
        -1
    } else {
        limit as i64
    }
}

fn record_table_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS main.\"{table}\" (
            id INTEGER PRIMARY KEY,
            entity TEXT NOT NULL,
            operation TEXT NOT NULL,
            row_id TEXT NOT NULL,
            old_snapshot TEXT,
            new_snapshot TEXT,
            changed_fields TEXT NOT NULL,
            redacted_fields TEXT NOT NULL,
            captured_at_ms INTEGER NOT NULL,
            actor_id TEXT,
            tenant_id TEXT,
            request_id TEXT,
            client_address TEXT,
            transaction_id INTEGER NOT NULL,
            sequence INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS main.\"{table}_row\" ON \"{table}\" (entity, row_id, captured_at_ms);
        CREATE INDEX IF NOT EXISTS main.\"{table}_actor\" ON \"{table}\" (actor_id, captured_at_ms);
        CREATE INDEX IF NOT EXISTS main.\"{table}_tenant\" ON \"{table}\" (tenant_id, captured_at_ms);
        CREATE INDEX IF NOT EXISTS main.\"{table}_tx\" ON \"{table}\" (transaction_id, sequence);"
    )
}

fn union_select(tables: &[String], columns: &str, predicate: &str) -> String {
    tables
        .iter()
        .map(|table| format!("SELECT {columns} FROM main.\"{table}\" WHERE {predicate}"))
        .collect::<Vec<_>>()
        .join(" UNION ALL ")
}

/// Active partition tables that can hold records in `range`, plus the default.
fn tables_for(conn: &Connection, range: Option<TimeRange>) -> Result<Vec<String>, StoreError> {
    let (start_ms, end_ms) = match range {
        Some(range) => (to_millis(range.start), to_millis(range.end)),
        None => (i64::MIN, i64::MAX),
    };
    let mut stmt = conn
        .prepare(
            "SELECT name FROM trail_partitions
             WHERE state = 'active' AND start_ms < ?2 AND end_ms > ?1
             ORDER BY start_ms ASC",
        )
        .map_err(store_err)?;
    let rows = stmt
        .query_map(params![start_ms, end_ms], |row| row.get::<_, String>(0))
        .map_err(store_err)?;
    let mut tables = rows.collect::<Result<Vec<_>, _>>().map_err(store_err)?;
    tables.push(DEFAULT_PARTITION.to_string());
    Ok(tables)
}

fn next_sequence(conn: &Connection, name: &str) -> Result<u64, StoreError> {
    conn.execute(
        "UPDATE trail_sequences SET value = value + 1 WHERE name = ?1",
        params![name],
    )
    .map_err(store_err)?;
    let value: i64 = conn
        .query_row(
            "SELECT value FROM trail_sequences WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .map_err(store_err)?;
    Ok(value as u64)
}

fn insert_change(conn: &Connection, change: CapturedChange) -> Result<ChangeRecord, StoreError> {
    let captured_ms = to_millis(change.captured_at);
    let table: String = conn
        .query_row(
            "SELECT name FROM trail_partitions
             WHERE state = 'active' AND start_ms <= ?1 AND ?1 < end_ms",
            params![captured_ms],
            |row| row.get(0),
        )
        .optional()
        .map_err(store_err)?
        .unwrap_or_else(|| DEFAULT_PARTITION.to_string());
    let id = next_sequence(conn, "record")?;
    let record = change.into_record(id);
    conn.execute(
        &format!("INSERT INTO main.\"{table}\" ({RECORD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"),
        params![
            record.id as i64,
            record.entity,
            record.operation.as_str(),
            record.row_id,
            encode_snapshot(record.old_snapshot.as_ref())?,
            encode_snapshot(record.new_snapshot.as_ref())?,
            encode_json(&record.changed_fields)?,
            encode_json(&record.redacted_fields)?,
            captured_ms,
            record.context.actor_id,
            record.context.tenant_id,
            record.context.request_id,
            record.context.client_address,
            record.transaction_id as i64,
            i64::from(record.sequence),
        ],
    )
    .map_err(store_err)?;
    Ok(record)
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|err| StoreError::Serialization(err.to_string()))
}

/// Absent snapshots are stored as SQL NULL, never as the JSON text `null`.
fn encode_snapshot(snapshot: Option<&RowSnapshot>) -> Result<Option<String>, StoreError> {
    snapshot.map(encode_json).transpose()
}

fn decode_change(payload: &str) -> Result<CapturedChange, StoreError> {
    serde_json::from_str(payload).map_err(|err| StoreError::Serialization(err.to_string()))
}

struct RawRecord {
    id: i64,
    entity: String,
    operation: String,
    row_id: String,
    old_snapshot: Option<String>,
    new_snapshot: Option<String>,
    changed_fields: String,
    redacted_fields: String,
    captured_at_ms: i64,
    context: CaptureContext,
    transaction_id: i64,
    sequence: i64,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity: row.get(1)?,
            operation: row.get(2)?,
            row_id: row.get(3)?,
            old_snapshot: row.get(4)?,
            new_snapshot: row.get(5)?,
            changed_fields: row.get(6)?,
            redacted_fields: row.get(7)?,
            captured_at_ms: row.get(8)?,
            context: CaptureContext {
                actor_id: row.get(9)?,
                tenant_id: row.get(10)?,
                request_id: row.get(11)?,
                client_address: row.get(12)?,
            },
            transaction_id: row.get(13)?,
            sequence: row.get(14)?,
        })
    }

    fn into_record(self) -> Result<ChangeRecord, StoreError> {
        let decode_snapshot = |value: Option<String>| -> Result<Option<RowSnapshot>, StoreError> {
            value
                .map(|text| serde_json::from_str(&text))
                .transpose()
                .map_err(|err| StoreError::Serialization(err.to_string()))
        };
        let decode_fields = |text: &str| -> Result<BTreeSet<String>, StoreError> {
            serde_json::from_str(text).map_err(|err| StoreError::Serialization(err.to_string()))
        };
        Ok(ChangeRecord {
            id: self.id as u64,
            entity: self.entity,
            operation: self.operation.parse().map_err(StoreError::Serialization)?,
            row_id: self.row_id,
            old_snapshot: decode_snapshot(self.old_snapshot)?,
            new_snapshot: decode_snapshot(self.new_snapshot)?,
            changed_fields: decode_fields(&self.changed_fields)?,
            redacted_fields: decode_fields(&self.redacted_fields)?,
            captured_at: millis_to_time(self.captured_at_ms)?,
            context: self.context,
            transaction_id: self.transaction_id as u64,
            sequence: u32::try_from(self.sequence)
                .map_err(|err| StoreError::Serialization(err.to_string()))?,
        })
    }
}

fn query_records<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<ChangeRecord>, StoreError> {
    let mut stmt = conn.prepare(sql).map_err(store_err)?;
    let rows = stmt.query_map(params, RawRecord::from_row).map_err(store_err)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row.map_err(store_err)?.into_record()?);
    }
    Ok(records)
}

fn top_subject(
    conn: &Connection,
    column: &str,
    range: TimeRange,
) -> Result<Option<ActivityCount>, StoreError> {
    let tables = tables_for(conn, Some(range))?;
    let sql = format!(
        "SELECT {column}, COUNT(*) AS total FROM ({}) WHERE {column} IS NOT NULL
         GROUP BY {column} ORDER BY total DESC, {column} ASC LIMIT 1",
        union_select(
            &tables,
            column,
            "captured_at_ms >= ?1 AND captured_at_ms < ?2"
        )
    );
    conn.query_row(
        &sql,
        params![to_millis(range.start), to_millis(range.end)],
        |row| {
            Ok(ActivityCount {
                subject: row.get(0)?,
                count: row.get::<_, i64>(1)?.max(0) as u64,
            })
        },
    )
    .optional()
    .map_err(store_err)
}

fn table_count(conn: &Connection, table: &str) -> Result<u64, StoreError> {
    let count: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM main.\"{table}\""), [], |row| {
            row.get(0)
        })
        .map_err(store_err)?;
    Ok(count.max(0) as u64)
}

fn with_live_count(conn: &Connection, mut partition: Partition) -> Result<Partition, StoreError> {
    if partition.state == PartitionState::Active {
        partition.record_count = table_count(conn, &partition.name)?;
    }
    Ok(partition)
}

type RawPartition = (String, i64, i64, String, i64, Option<i64>);

fn raw_partition(row: &Row<'_>) -> rusqlite::Result<RawPartition> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn partition_from_raw(raw: RawPartition) -> Result<Partition, StoreError> {
    let (name, start_ms, end_ms, state, record_count, retired_at_ms) = raw;
    Ok(Partition {
        name,
        bounds: Some(TimeRange::new(
            millis_to_time(start_ms)?,
            millis_to_time(end_ms)?,
        )),
        state: state.parse().map_err(StoreError::Serialization)?,
        record_count: record_count.max(0) as u64,
        retired_at: retired_at_ms.map(millis_to_time).transpose()?,
    })
}

fn load_partition(conn: &Connection, name: &str) -> Result<Option<Partition>, StoreError> {
    let raw = conn
        .query_row(
            "SELECT name, start_ms, end_ms, state, record_count, retired_at_ms
             FROM trail_partitions WHERE name = ?1",
            params![name],
            raw_partition,
        )
        .optional()
        .map_err(store_err)?;
    raw.map(partition_from_raw).transpose()
}

fn load_rule(conn: &Connection, name: &str) -> Result<Option<AlertRule>, StoreError> {
    let definition: Option<String> = conn
        .query_row(
            "SELECT definition FROM alert_rules WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()
        .map_err(store_err)?;
    definition
        .map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(|err| StoreError::Serialization(err.to_string()))
}

type RawEvent = (
    i64,
    String,
    i64,
    f64,
    String,
    Option<String>,
    Option<i64>,
    Option<String>,
);

fn raw_event(row: &Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn event_from_raw(raw: RawEvent) -> Result<AlertEvent, StoreError> {
    let (id, rule_name, fired_at_ms, observed_value, severity, subject, ack_ms, ack_by) = raw;
    Ok(AlertEvent {
        id: id as u64,
        rule_name,
        fired_at: millis_to_time(fired_at_ms)?,
        observed_value,
        severity: severity.parse::<Severity>().map_err(StoreError::Serialization)?,
        subject,
        acknowledged_at: ack_ms.map(millis_to_time).transpose()?,
        acknowledged_by: ack_by,
    })
}
