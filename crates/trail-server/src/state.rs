use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use trail_kernel::{spawn_periodic, Trail, TrailSettings};
use trail_store::{
    load_from_system_config, BackendKind, SystemClock, SystemConfig, SystemConfigLoader,
};

use crate::error::AppError;

pub struct AppState {
    pub config_path: PathBuf,
    pub config_raw: RwLock<String>,
    pub config: RwLock<SystemConfig>,
    pub admin_token: RwLock<String>,
    pub backend_kind: BackendKind,
    pub trail: Arc<Trail>,
}

impl AppState {
    pub fn new(
        config_path: PathBuf,
        config_raw: String,
        config: SystemConfig,
        backend_kind: BackendKind,
        trail: Arc<Trail>,
    ) -> Self {
        let admin_token = config.get_string("security.admin_token");
        Self {
            config_path,
            config_raw: RwLock::new(config_raw),
            config: RwLock::new(config),
            admin_token: RwLock::new(admin_token),
            backend_kind,
            trail,
        }
    }
}

pub fn load_config(path: &Path) -> Result<(String, SystemConfig), AppError> {
    let raw = std::fs::read_to_string(path)?;
    let config = SystemConfigLoader::from_str(&raw)?;
    Ok((raw, config))
}

pub fn create_default_config(path: &Path) -> Result<String, AppError> {
    let content = default_config_template();
    std::fs::write(path, content.as_bytes())?;
    Ok(content)
}

pub fn default_config_template() -> String {
    let mut lines = Vec::new();
    lines.push("storage = { dsn = \"\", sqlite_path = \"changetrail.sqlite\", archive_path = \"\" }");
    lines.push("capture = { mode = \"sync\", strict = true }");
    lines.push("worker = { interval_ms = 1000, batch_size = 100, lease_ms = 30000 }");
    lines.push("alerts = { interval_ms = 60000 }");
    lines.push("partitions = { period = \"monthly\", ahead = 2, interval_ms = 3600000 }");
    lines.push("retention = { horizon_days = 365, action = \"archive\", max_attempts = 3 }");
    lines.push("security = { admin_token = \"change-me\" }");
    format!("{}\n", lines.join("\n"))
}

pub fn backend_name(kind: &BackendKind) -> &'static str {
    match kind {
        BackendKind::Memory => "memory",
        BackendKind::Sqlite { .. } => "sqlite",
        BackendKind::Postgres { .. } => "postgres",
    }
}

/// Opens the configured backend and wires the trail over it. Reconstruction
/// starts from the newest change record since the primary datastore lives in
/// another process.
pub fn build_trail(config: &SystemConfig) -> Result<(BackendKind, Trail), AppError> {
    let settings = TrailSettings::from_config(config)?;
    let bundle = load_from_system_config(config, None)?;
    let trail = Trail::from_bundle(settings, &bundle, SystemClock::shared());
    Ok((bundle.kind, trail))
}

/// Starts the worker, alert evaluator and partition manager loops.
/// [`build_trail`] on the blocking pool. The Postgres client runs its own
/// runtime and panics when opened from an async worker thread.
pub async fn open_trail(config: SystemConfig) -> Result<(BackendKind, Trail), AppError> {
    tokio::task::spawn_blocking(move || build_trail(&config))
        .await
        .map_err(|err| AppError::internal(err.to_string()))?
}

/// Closing a blocking client may also block.
pub async fn close_trail(trail: Arc<Trail>) {
    if let Err(err) = tokio::task::spawn_blocking(move || drop(trail)).await {
        tracing::warn!(error = %err, "closing the changelog backend failed");
    }
}

pub fn spawn_background_jobs(
    trail: &Trail,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let settings = trail.settings();
    vec![
        spawn_periodic(
            Arc::new(trail.capture_worker()),
            settings.worker_interval,
            shutdown.clone(),
        ),
        spawn_periodic(
            Arc::new(trail.alert_evaluator()),
            settings.alert_interval,
            shutdown.clone(),
        ),
        spawn_periodic(
            Arc::new(trail.partition_manager()),
            settings.partition_interval,
            shutdown,
        ),
    ]
}

/// Validates and persists new config content. Only the admin token takes
/// effect immediately; storage and job settings apply on restart.
pub async fn update_config_file(
    state: &AppState,
    content: String,
) -> Result<SystemConfig, AppError> {
    let parsed = SystemConfigLoader::from_str(&content)?;
    TrailSettings::from_config(&parsed)?;
    std::fs::write(&state.config_path, content.as_bytes())?;
    *state.config_raw.write().await = content;
    *state.config.write().await = parsed.clone();
    *state.admin_token.write().await = parsed.get_string("security.admin_token");
    Ok(parsed)
}
