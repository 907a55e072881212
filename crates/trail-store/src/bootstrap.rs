use std::sync::Arc;

use crate::config::SystemConfig;
use crate::memory::InMemoryTrailStore;
use crate::pg_store::PgTrailStore;
use crate::policy::{PolicySnapshot, StoredCapturePolicy};
use crate::sqlite_store::SqliteTrailStore;
use crate::store::{StoreError, TrailBackend};

/// Which backend `storage.dsn` resolved to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Sqlite { path: String, archive_path: String },
    Postgres { dsn: String },
}

pub struct StoreBundle {
    pub kind: BackendKind,
    pub backend: Arc<dyn TrailBackend>,
    pub policy: Arc<StoredCapturePolicy>,
}

impl StoreBundle {
    pub fn new(kind: BackendKind, backend: Arc<dyn TrailBackend>) -> Self {
        let policy = StoredCapturePolicy::shared(backend.clone());
        Self {
            kind,
            backend,
            policy,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(BackendKind::Memory, InMemoryTrailStore::shared())
    }

    /// Adds the seed to the policy already stored in the backend.
    pub fn with_policy(self, seed: &PolicySnapshot) -> Result<Self, StoreError> {
        self.policy.seed(seed)?;
        Ok(self)
    }
}

/// Opens the configured backend. The capture policy lives in the backend, so
/// a seed only adds to what earlier runs stored.
pub fn load_from_system_config(
    config: &SystemConfig,
    seed: Option<&PolicySnapshot>,
) -> Result<StoreBundle, StoreError> {
    let kind = resolve_backend_kind(config);
    let backend = open_backend(&kind)?;
    let bundle = StoreBundle::new(kind, backend);
    match seed {
        Some(seed) => bundle.with_policy(seed),
        None => Ok(bundle),
    }
}

pub fn resolve_backend_kind(config: &SystemConfig) -> BackendKind {
    let dsn = config.get_string("storage.dsn");
    let archive_path = config.get_string("storage.archive_path");
    if dsn.trim().is_empty() {
        let path = config.get_string("storage.sqlite_path");
        return sqlite_kind(path, archive_path);
    }
    if dsn.trim().eq_ignore_ascii_case("memory:") {
        return BackendKind::Memory;
    }
    if is_sqlite_dsn(&dsn) {
        return sqlite_kind(sqlite_path_from_dsn(&dsn).to_string(), archive_path);
    }
    BackendKind::Postgres { dsn }
}

fn open_backend(kind: &BackendKind) -> Result<Arc<dyn TrailBackend>, StoreError> {
    match kind {
        BackendKind::Memory => Ok(InMemoryTrailStore::shared()),
        BackendKind::Sqlite { path, archive_path } => {
            let store = SqliteTrailStore::open_with_archive(path, archive_path)?;
            store.ensure_schema()?;
            Ok(Arc::new(store))
        }
        BackendKind::Postgres { dsn } => {
            let store = PgTrailStore::connect(dsn)?;
            store.ensure_schema()?;
            Ok(Arc::new(store))
        }
    }
}

fn sqlite_kind(path: String, archive_path: String) -> BackendKind {
    let archive_path = if !archive_path.trim().is_empty() {
        archive_path
    } else if path == ":memory:" {
        ":memory:".to_string()
    } else {
        format!("{path}.archive")
    };
    BackendKind::Sqlite { path, archive_path }
}

fn is_sqlite_dsn(dsn: &str) -> bool {
    let trimmed = dsn.trim().to_lowercase();
    trimmed.starts_with("sqlite://") || trimmed.starts_with("sqlite:")
}

fn sqlite_path_from_dsn(dsn: &str) -> &str {
    dsn.trim()
        .strip_prefix("sqlite://")
        .or_else(|| dsn.trim().strip_prefix("sqlite:"))
        .unwrap_or(dsn)
}
