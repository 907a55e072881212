use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, Response};
use axum::middleware::Next;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use trail_kernel::{EvaluationReport, HistoricalState, MaintenanceReport, Trail, TrailError};
use trail_store::config::describe;
use trail_store::{
    AlertEvent, AlertRule, ChangeRecord, ChangeSummaryRow, ExclusionRule, Partition,
    PartitionPeriod, QueueDepth, TimeRange,
};

use crate::error::AppError;
use crate::state::{backend_name, update_config_file, AppState};

#[derive(Serialize)]
pub struct SimpleResponse {
    pub ok: bool,
}

#[derive(Deserialize, Default)]
pub struct RangeQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RangeQuery {
    /// Missing bounds default to the last 24 hours.
    fn range(&self) -> TimeRange {
        let end = self.end.unwrap_or_else(Utc::now);
        let start = self.start.unwrap_or(end - Duration::hours(24));
        TimeRange::new(start, end)
    }
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct StateQuery {
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub entity: String,
    pub row_id: String,
    pub as_of: DateTime<Utc>,
    pub exists: bool,
    pub state: Option<HistoricalState>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub backend: String,
}

#[derive(Deserialize)]
pub struct ExclusionRequest {
    pub entity: String,
    pub field: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Deserialize)]
pub struct PartitionRequest {
    pub period: String,
    pub at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct ArchiveRequest {
    pub older_than: DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct RuleToggle {
    pub enabled: bool,
}

#[derive(Deserialize)]
pub struct AcknowledgeRequest {
    pub by: String,
}

#[derive(Serialize)]
pub struct SystemConfigEntry {
    pub key: String,
    pub value: String,
    pub value_type: String,
    pub description: String,
}

#[derive(Serialize)]
pub struct SystemConfigResponse {
    pub content: String,
    pub entries: Vec<SystemConfigEntry>,
}

#[derive(Deserialize)]
pub struct SystemConfigUpdate {
    pub content: String,
}

pub async fn admin_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response<Body>, AppError> {
    let expected = state.admin_token.read().await.clone();
    authorize(req.headers(), &expected)?;
    Ok(next.run(req).await)
}

fn authorize(headers: &HeaderMap, expected: &str) -> Result<(), AppError> {
    let token = extract_bearer_token(headers);
    if expected.trim().is_empty() || token.as_deref() != Some(expected) {
        return Err(AppError::unauthorized("invalid admin token"));
    }
    Ok(())
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        backend: backend_name(&state.backend_kind).to_string(),
    })
}

pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Path((entity, row_id)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ChangeRecord>>, AppError> {
    let limit = query.limit.unwrap_or(100);
    let records = with_trail(&state, move |trail| trail.get_history(&entity, &row_id, limit)).await?;
    Ok(Json(records))
}

pub async fn get_state_at(
    State(state): State<Arc<AppState>>,
    Path((entity, row_id)): Path<(String, String)>,
    Query(query): Query<StateQuery>,
) -> Result<Json<StateResponse>, AppError> {
    let as_of = query.as_of;
    let (lookup_entity, lookup_row) = (entity.clone(), row_id.clone());
    let reconstructed = with_trail(&state, move |trail| {
        trail.get_state_at(&lookup_entity, &lookup_row, as_of)
    })
    .await?;
    Ok(Json(StateResponse {
        entity,
        row_id,
        as_of,
        exists: reconstructed.is_some(),
        state: reconstructed,
    }))
}

pub async fn get_actor_activity(
    State(state): State<Arc<AppState>>,
    Path(actor_id): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Vec<ChangeRecord>>, AppError> {
    let range = query.range();
    let limit = query.limit.unwrap_or(100);
    let records =
        with_trail(&state, move |trail| trail.get_actor_activity(&actor_id, range, limit)).await?;
    Ok(Json(records))
}

pub async fn get_tenant_activity(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Vec<ChangeRecord>>, AppError> {
    let range = query.range();
    let limit = query.limit.unwrap_or(100);
    let records =
        with_trail(&state, move |trail| trail.get_tenant_activity(&tenant_id, range, limit)).await?;
    Ok(Json(records))
}

pub async fn get_transaction(
    State(state): State<Arc<AppState>>,
    Path(transaction_id): Path<u64>,
) -> Result<Json<Vec<ChangeRecord>>, AppError> {
    let records = with_trail(&state, move |trail| trail.get_transaction(transaction_id)).await?;
    Ok(Json(records))
}

pub async fn get_change_summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Vec<ChangeSummaryRow>>, AppError> {
    let range = query.range();
    let rows = with_trail(&state, move |trail| trail.get_change_summary(range)).await?;
    Ok(Json(rows))
}

pub async fn get_active_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Vec<AlertEvent>>, AppError> {
    let range = query.range();
    let events = with_trail(&state, move |trail| trail.get_active_alerts(range)).await?;
    Ok(Json(events))
}

pub async fn get_queue_depth(
    State(state): State<Arc<AppState>>,
) -> Result<Json<QueueDepth>, AppError> {
    let depth = with_trail(&state, |trail| trail.queue_depth()).await?;
    Ok(Json(depth))
}

pub async fn list_captured(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<String>>, AppError> {
    let entities = with_trail(&state, |trail| trail.captured_entities()).await?;
    Ok(Json(entities))
}

pub async fn enable_capture(
    State(state): State<Arc<AppState>>,
    Path(entity): Path<String>,
) -> Result<Json<SimpleResponse>, AppError> {
    with_trail(&state, move |trail| trail.enable_capture(&entity)).await?;
    Ok(Json(SimpleResponse { ok: true }))
}

pub async fn disable_capture(
    State(state): State<Arc<AppState>>,
    Path(entity): Path<String>,
) -> Result<Json<SimpleResponse>, AppError> {
    with_trail(&state, move |trail| trail.disable_capture(&entity)).await?;
    Ok(Json(SimpleResponse { ok: true }))
}

pub async fn list_exclusions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ExclusionRule>>, AppError> {
    let rules = with_trail(&state, |trail| trail.list_exclusions()).await?;
    Ok(Json(rules))
}

pub async fn add_exclusion(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ExclusionRequest>,
) -> Result<Json<SimpleResponse>, AppError> {
    with_trail(&state, move |trail| {
        trail.add_exclusion(&payload.entity, &payload.field, &payload.reason)
    })
    .await?;
    Ok(Json(SimpleResponse { ok: true }))
}

pub async fn remove_exclusion(
    State(state): State<Arc<AppState>>,
    Path((entity, field)): Path<(String, String)>,
) -> Result<Json<SimpleResponse>, AppError> {
    with_trail(&state, move |trail| trail.remove_exclusion(&entity, &field)).await?;
    Ok(Json(SimpleResponse { ok: true }))
}

pub async fn list_partitions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Partition>>, AppError> {
    let partitions = with_trail(&state, |trail| trail.list_partitions()).await?;
    Ok(Json(partitions))
}

pub async fn create_partition(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PartitionRequest>,
) -> Result<Json<Partition>, AppError> {
    let period: PartitionPeriod = payload.period.parse().map_err(AppError::bad_request)?;
    let at = payload.at;
    let partition = with_trail(&state, move |trail| trail.create_partition(period, at)).await?;
    Ok(Json(partition))
}

pub async fn archive_partitions(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ArchiveRequest>,
) -> Result<Json<MaintenanceReport>, AppError> {
    let older_than = payload.older_than;
    let report = with_trail(&state, move |trail| trail.archive_partitions(older_than)).await?;
    Ok(Json(report))
}

pub async fn run_partition_maintenance(
    State(state): State<Arc<AppState>>,
) -> Result<Json<MaintenanceReport>, AppError> {
    let report = with_trail(&state, |trail| {
        Ok(trail.partition_manager().run_maintenance()?)
    })
    .await?;
    Ok(Json(report))
}

pub async fn read_archived(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<ChangeRecord>>, AppError> {
    let records = with_trail(&state, move |trail| trail.read_archived(&name)).await?;
    Ok(Json(records))
}

pub async fn list_alert_rules(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<AlertRule>>, AppError> {
    let rules = with_trail(&state, |trail| trail.list_alert_rules()).await?;
    Ok(Json(rules))
}

pub async fn register_alert_rule(
    State(state): State<Arc<AppState>>,
    Json(rule): Json<AlertRule>,
) -> Result<Json<AlertRule>, AppError> {
    let stored = rule.clone();
    with_trail(&state, move |trail| trail.register_alert_rule(rule)).await?;
    Ok(Json(stored))
}

pub async fn set_alert_rule_enabled(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(payload): Json<RuleToggle>,
) -> Result<Json<SimpleResponse>, AppError> {
    let enabled = payload.enabled;
    with_trail(&state, move |trail| trail.set_alert_rule_enabled(&name, enabled)).await?;
    Ok(Json(SimpleResponse { ok: true }))
}

pub async fn acknowledge_alert(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<u64>,
    Json(payload): Json<AcknowledgeRequest>,
) -> Result<Json<AlertEvent>, AppError> {
    let event = with_trail(&state, move |trail| trail.acknowledge_alert(event_id, &payload.by)).await?;
    Ok(Json(event))
}

pub async fn evaluate_alerts(
    State(state): State<Arc<AppState>>,
) -> Result<Json<EvaluationReport>, AppError> {
    let report = with_trail(&state, |trail| Ok(trail.alert_evaluator().evaluate()?)).await?;
    Ok(Json(report))
}

pub async fn get_system_config(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SystemConfigResponse>, AppError> {
    let content = state.config_raw.read().await.clone();
    let config = state.config.read().await;
    let entries = describe(&config)
        .into_iter()
        .map(|(item, value)| SystemConfigEntry {
            key: item.key.to_string(),
            value: if item.key == "security.admin_token" {
                "***".to_string()
            } else {
                value
            },
            value_type: item.value_type.to_string(),
            description: item.description.to_string(),
        })
        .collect();
    Ok(Json(SystemConfigResponse { content, entries }))
}

pub async fn update_system_config_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SystemConfigUpdate>,
) -> Result<Json<Value>, AppError> {
    update_config_file(&state, payload.content).await?;
    Ok(Json(json!({ "ok": true, "restart_required": true })))
}

/// Runs a blocking trail call off the async runtime.
async fn with_trail<F, R>(state: &Arc<AppState>, op: F) -> Result<R, AppError>
where
    F: FnOnce(&Trail) -> Result<R, TrailError> + Send + 'static,
    R: Send + 'static,
{
    let trail = state.trail.clone();
    tokio::task::spawn_blocking(move || op(&trail).map_err(AppError::from))
        .await
        .map_err(|err| AppError::internal(err.to_string()))?
}
