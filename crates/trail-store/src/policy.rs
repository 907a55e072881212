use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::store::{StoreError, TrailBackend};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionRule {
    pub entity: String,
    pub field: String,
    pub reason: String,
}

/// Excluded fields of one entity, taken as a single consistent view so a
/// capture never sees a half-applied admin change.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    fields: BTreeSet<String>,
}

impl ExclusionSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_excluded(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &String> {
        self.fields.iter()
    }
}

impl<S: Into<String>> FromIterator<S> for ExclusionSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Which entities are captured and which of their fields are redacted.
pub trait CapturePolicy: Send + Sync {
    fn is_capture_enabled(&self, entity: &str) -> Result<bool, StoreError>;
    fn exclusions_for(&self, entity: &str) -> Result<ExclusionSet, StoreError>;
    fn enable_capture(&self, entity: &str) -> Result<(), StoreError>;
    fn disable_capture(&self, entity: &str) -> Result<(), StoreError>;
    fn captured_entities(&self) -> Result<Vec<String>, StoreError>;
    fn add_exclusion(&self, rule: ExclusionRule) -> Result<(), StoreError>;
    fn remove_exclusion(&self, entity: &str, field: &str) -> Result<bool, StoreError>;
    fn list_exclusions(&self) -> Result<Vec<ExclusionRule>, StoreError>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub captured_entities: Vec<String>,
    pub exclusions: Vec<ExclusionRule>,
}

/// Process-local policy. Backs the in-memory store and embedded setups that
/// do not share a backend.
pub struct InMemoryCapturePolicy {
    entities: RwLock<BTreeSet<String>>,
    exclusions: RwLock<BTreeMap<String, BTreeMap<String, String>>>,
}

impl InMemoryCapturePolicy {
    pub fn new() -> Self {
        Self {
            entities: RwLock::new(BTreeSet::new()),
            exclusions: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn from_snapshot(snapshot: &PolicySnapshot) -> Self {
        let policy = Self::new();
        for entity in &snapshot.captured_entities {
            policy.enable_capture(entity);
        }
        for rule in &snapshot.exclusions {
            policy.add_exclusion(rule.clone());
        }
        policy
    }

    pub fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            captured_entities: self.captured_entities(),
            exclusions: self.list_exclusions(),
        }
    }

    pub fn is_capture_enabled(&self, entity: &str) -> bool {
        self.entities.read().contains(entity)
    }

    pub fn exclusions_for(&self, entity: &str) -> ExclusionSet {
        self.exclusions
            .read()
            .get(entity)
            .map(|fields| fields.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn enable_capture(&self, entity: &str) {
        self.entities.write().insert(entity.to_string());
    }

    pub fn disable_capture(&self, entity: &str) {
        self.entities.write().remove(entity);
    }

    pub fn captured_entities(&self) -> Vec<String> {
        self.entities.read().iter().cloned().collect()
    }

    pub fn add_exclusion(&self, rule: ExclusionRule) {
        self.exclusions
            .write()
            .entry(rule.entity)
            .or_default()
            .insert(rule.field, rule.reason);
    }

    pub fn remove_exclusion(&self, entity: &str, field: &str) -> bool {
        let mut exclusions = self.exclusions.write();
        let Some(fields) = exclusions.get_mut(entity) else {
            return false;
        };
        let removed = fields.remove(field).is_some();
        if fields.is_empty() {
            exclusions.remove(entity);
        }
        removed
    }

    pub fn list_exclusions(&self) -> Vec<ExclusionRule> {
        self.exclusions
            .read()
            .iter()
            .flat_map(|(entity, fields)| {
                fields.iter().map(move |(field, reason)| ExclusionRule {
                    entity: entity.clone(),
                    field: field.clone(),
                    reason: reason.clone(),
                })
            })
            .collect()
    }
}

impl Default for InMemoryCapturePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl CapturePolicy for InMemoryCapturePolicy {
    fn is_capture_enabled(&self, entity: &str) -> Result<bool, StoreError> {
        Ok(InMemoryCapturePolicy::is_capture_enabled(self, entity))
    }

    fn exclusions_for(&self, entity: &str) -> Result<ExclusionSet, StoreError> {
        Ok(InMemoryCapturePolicy::exclusions_for(self, entity))
    }

    fn enable_capture(&self, entity: &str) -> Result<(), StoreError> {
        InMemoryCapturePolicy::enable_capture(self, entity);
        Ok(())
    }

    fn disable_capture(&self, entity: &str) -> Result<(), StoreError> {
        InMemoryCapturePolicy::disable_capture(self, entity);
        Ok(())
    }

    fn captured_entities(&self) -> Result<Vec<String>, StoreError> {
        Ok(InMemoryCapturePolicy::captured_entities(self))
    }

    fn add_exclusion(&self, rule: ExclusionRule) -> Result<(), StoreError> {
        InMemoryCapturePolicy::add_exclusion(self, rule);
        Ok(())
    }

    fn remove_exclusion(&self, entity: &str, field: &str) -> Result<bool, StoreError> {
        Ok(InMemoryCapturePolicy::remove_exclusion(self, entity, field))
    }

    fn list_exclusions(&self) -> Result<Vec<ExclusionRule>, StoreError> {
        Ok(InMemoryCapturePolicy::list_exclusions(self))
    }
}

/// Policy kept in the backend itself. Every lookup reads the store, so admin
/// changes survive restarts and reach every process sharing the backend.
pub struct StoredCapturePolicy {
    backend: Arc<dyn TrailBackend>,
}

impl StoredCapturePolicy {
    pub fn new(backend: Arc<dyn TrailBackend>) -> Self {
        Self { backend }
    }

    pub fn shared(backend: Arc<dyn TrailBackend>) -> Arc<Self> {
        Arc::new(Self::new(backend))
    }

    /// Adds everything in `seed` on top of what the backend already holds.
    pub fn seed(&self, seed: &PolicySnapshot) -> Result<(), StoreError> {
        for entity in &seed.captured_entities {
            self.backend.set_capture_enabled(entity, true)?;
        }
        for rule in &seed.exclusions {
            self.backend.put_exclusion(rule.clone())?;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Result<PolicySnapshot, StoreError> {
        Ok(PolicySnapshot {
            captured_entities: self.backend.enabled_entities()?,
            exclusions: self.backend.exclusion_rules()?,
        })
    }
}

impl CapturePolicy for StoredCapturePolicy {
    fn is_capture_enabled(&self, entity: &str) -> Result<bool, StoreError> {
        self.backend.capture_enabled(entity)
    }

    fn exclusions_for(&self, entity: &str) -> Result<ExclusionSet, StoreError> {
        self.backend.entity_exclusions(entity)
    }

    fn enable_capture(&self, entity: &str) -> Result<(), StoreError> {
        self.backend.set_capture_enabled(entity, true)
    }

    fn disable_capture(&self, entity: &str) -> Result<(), StoreError> {
        self.backend.set_capture_enabled(entity, false)
    }

    fn captured_entities(&self) -> Result<Vec<String>, StoreError> {
        self.backend.enabled_entities()
    }

    fn add_exclusion(&self, rule: ExclusionRule) -> Result<(), StoreError> {
        self.backend.put_exclusion(rule)
    }

    fn remove_exclusion(&self, entity: &str, field: &str) -> Result<bool, StoreError> {
        self.backend.delete_exclusion(entity, field)
    }

    fn list_exclusions(&self) -> Result<Vec<ExclusionRule>, StoreError> {
        self.backend.exclusion_rules()
    }
}
