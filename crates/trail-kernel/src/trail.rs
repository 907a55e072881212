use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;
use trail_store::{
    AlertEvent, AlertRule, CapturePolicy, ChangeRecord, ChangeSummaryRow, Clock, ExclusionRule,
    Partition, PartitionPeriod, QueueDepth, RetentionAction, StoreBundle, StoreError, TimeRange,
    TrailBackend,
};

use crate::alerting::AlertEvaluator;
use crate::capture::{CaptureError, CaptureInterceptor};
use crate::diff::mask_record;
use crate::reconstruct::{
    HistoricalState, LatestRecordState, PrimaryStore, ReconstructionEngine, ReconstructionError,
};
use crate::retention::{MaintenanceReport, PartitionManager};
use crate::settings::TrailSettings;
use crate::worker::CaptureWorker;

#[derive(Debug, Error)]
pub enum TrailError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Reconstruction(#[from] ReconstructionError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Read and admin surface over one backend. Every record it returns has the
/// current exclusions applied.
pub struct Trail {
    settings: TrailSettings,
    backend: Arc<dyn TrailBackend>,
    policy: Arc<dyn CapturePolicy>,
    clock: Arc<dyn Clock>,
    interceptor: CaptureInterceptor,
    reconstruction: ReconstructionEngine,
}

impl Trail {
    /// Reconstruction starts from the newest change record until a primary
    /// store is attached with [`Trail::with_primary`].
    pub fn new(
        settings: TrailSettings,
        backend: Arc<dyn TrailBackend>,
        policy: Arc<dyn CapturePolicy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let interceptor = CaptureInterceptor::new(
            settings.capture.clone(),
            policy.clone(),
            backend.clone(),
            clock.clone(),
        );
        let reconstruction = ReconstructionEngine::new(
            backend.clone(),
            Arc::new(LatestRecordState::new(backend.clone())),
            policy.clone(),
        );
        Self {
            settings,
            backend,
            policy,
            clock,
            interceptor,
            reconstruction,
        }
    }

    pub fn from_bundle(settings: TrailSettings, bundle: &StoreBundle, clock: Arc<dyn Clock>) -> Self {
        Self::new(settings, bundle.backend.clone(), bundle.policy.clone(), clock)
    }

    pub fn with_primary(mut self, primary: Arc<dyn PrimaryStore>) -> Self {
        self.reconstruction =
            ReconstructionEngine::new(self.backend.clone(), primary, self.policy.clone());
        self
    }

    pub fn settings(&self) -> &TrailSettings {
        &self.settings
    }

    pub fn interceptor(&self) -> &CaptureInterceptor {
        &self.interceptor
    }

    pub fn capture_worker(&self) -> CaptureWorker {
        CaptureWorker::new(
            self.settings.worker.clone(),
            self.backend.clone(),
            self.clock.clone(),
        )
    }

    pub fn alert_evaluator(&self) -> AlertEvaluator {
        AlertEvaluator::new(self.backend.clone(), self.clock.clone())
    }

    pub fn partition_manager(&self) -> PartitionManager {
        PartitionManager::new(
            self.settings.retention.clone(),
            self.backend.clone(),
            self.clock.clone(),
        )
    }

    // Read API

    /// Newest first; `limit == 0` returns everything.
    pub fn get_history(
        &self,
        entity: &str,
        row_id: &str,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, TrailError> {
        require("entity", entity)?;
        require("row_id", row_id)?;
        let records = self.backend.history(entity, row_id, limit)?;
        self.mask_all(records)
    }

    /// `Ok(None)` when the row did not exist at `as_of`.
    pub fn get_state_at(
        &self,
        entity: &str,
        row_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Option<HistoricalState>, TrailError> {
        require("entity", entity)?;
        require("row_id", row_id)?;
        Ok(self.reconstruction.reconstruct(entity, row_id, as_of)?)
    }

    pub fn get_actor_activity(
        &self,
        actor_id: &str,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, TrailError> {
        require("actor_id", actor_id)?;
        check_range(&range)?;
        let records = self.backend.by_actor(actor_id, range, limit)?;
        self.mask_all(records)
    }

    pub fn get_tenant_activity(
        &self,
        tenant_id: &str,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, TrailError> {
        require("tenant_id", tenant_id)?;
        check_range(&range)?;
        let records = self.backend.by_tenant(tenant_id, range, limit)?;
        self.mask_all(records)
    }

    pub fn get_transaction(&self, transaction_id: u64) -> Result<Vec<ChangeRecord>, TrailError> {
        let records = self.backend.by_transaction(transaction_id)?;
        self.mask_all(records)
    }

    pub fn get_change_summary(&self, range: TimeRange) -> Result<Vec<ChangeSummaryRow>, TrailError> {
        check_range(&range)?;
        Ok(self.backend.summary(range)?)
    }

    /// Unacknowledged events fired within `range`.
    pub fn get_active_alerts(&self, range: TimeRange) -> Result<Vec<AlertEvent>, TrailError> {
        check_range(&range)?;
        Ok(self
            .backend
            .events(range)?
            .into_iter()
            .filter(|event| !event.is_acknowledged())
            .collect())
    }

    pub fn queue_depth(&self) -> Result<QueueDepth, TrailError> {
        Ok(self.backend.depth(self.clock.now())?)
    }

    pub fn read_archived(&self, partition: &str) -> Result<Vec<ChangeRecord>, TrailError> {
        let records = self.backend.read_archived(partition)?;
        self.mask_all(records)
    }

    // Admin API

    pub fn enable_capture(&self, entity: &str) -> Result<(), TrailError> {
        require("entity", entity)?;
        self.policy.enable_capture(entity)?;
        info!(entity = %entity, "capture enabled");
        Ok(())
    }

    pub fn disable_capture(&self, entity: &str) -> Result<(), TrailError> {
        require("entity", entity)?;
        self.policy.disable_capture(entity)?;
        info!(entity = %entity, "capture disabled");
        Ok(())
    }

    pub fn captured_entities(&self) -> Result<Vec<String>, TrailError> {
        Ok(self.policy.captured_entities()?)
    }

    pub fn add_exclusion(&self, entity: &str, field: &str, reason: &str) -> Result<(), TrailError> {
        require("entity", entity)?;
        require("field", field)?;
        self.policy.add_exclusion(ExclusionRule {
            entity: entity.to_string(),
            field: field.to_string(),
            reason: reason.to_string(),
        })?;
        info!(entity = %entity, field = %field, "exclusion added");
        Ok(())
    }

    pub fn remove_exclusion(&self, entity: &str, field: &str) -> Result<(), TrailError> {
        if !self.policy.remove_exclusion(entity, field)? {
            return Err(TrailError::NotFound(format!("exclusion {entity}.{field}")));
        }
        info!(entity = %entity, field = %field, "exclusion removed");
        Ok(())
    }

    pub fn list_exclusions(&self) -> Result<Vec<ExclusionRule>, TrailError> {
        Ok(self.policy.list_exclusions()?)
    }

    /// Creates the partition of `period` containing `at`, or the current
    /// instant when `at` is not given.
    pub fn create_partition(
        &self,
        period: PartitionPeriod,
        at: Option<DateTime<Utc>>,
    ) -> Result<Partition, TrailError> {
        let at = at.unwrap_or_else(|| self.clock.now());
        Ok(self.backend.create_partition(period, at)?)
    }

    pub fn list_partitions(&self) -> Result<Vec<Partition>, TrailError> {
        Ok(self.backend.list_partitions()?)
    }

    /// Archives every active partition that ends at or before `older_than`.
    pub fn archive_partitions(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<MaintenanceReport, TrailError> {
        Ok(self.partition_manager().retire_before(
            older_than,
            RetentionAction::Archive,
            self.clock.now(),
        )?)
    }

    pub fn register_alert_rule(&self, rule: AlertRule) -> Result<(), TrailError> {
        rule.validate().map_err(TrailError::InvalidRequest)?;
        info!(rule = %rule.name, "alert rule registered");
        Ok(self.backend.put_rule(rule)?)
    }

    pub fn set_alert_rule_enabled(&self, name: &str, enabled: bool) -> Result<(), TrailError> {
        Ok(self.backend.set_rule_enabled(name, enabled)?)
    }

    pub fn list_alert_rules(&self) -> Result<Vec<AlertRule>, TrailError> {
        Ok(self.backend.list_rules()?)
    }

    pub fn acknowledge_alert(&self, event_id: u64, by: &str) -> Result<AlertEvent, TrailError> {
        require("acknowledged_by", by)?;
        Ok(self.backend.acknowledge(event_id, by, self.clock.now())?)
    }

    fn mask_all(&self, records: Vec<ChangeRecord>) -> Result<Vec<ChangeRecord>, TrailError> {
        records
            .into_iter()
            .map(|record| {
                let exclusions = self.policy.exclusions_for(&record.entity)?;
                Ok(mask_record(record, &exclusions))
            })
            .collect()
    }
}

fn require(name: &str, value: &str) -> Result<(), TrailError> {
    if value.trim().is_empty() {
        return Err(TrailError::InvalidRequest(format!("{name} must not be empty")));
    }
    Ok(())
}

fn check_range(range: &TimeRange) -> Result<(), TrailError> {
    if range.start > range.end {
        return Err(TrailError::InvalidRequest(
            "time range starts after it ends".to_string(),
        ));
    }
    Ok(())
}
