use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Operation;

/// Aggregate an alert rule watches over its window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertMetric {
    ChangeCount {
        #[serde(default)]
        entity: Option<String>,
        #[serde(default)]
        operation: Option<Operation>,
    },
    /// Highest change count attributed to a single actor.
    ActorChangeCount,
    /// Highest change count attributed to a single tenant.
    TenantChangeCount,
    QueueDepth,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
}

impl Comparator {
    pub fn holds(&self, observed: f64, threshold: f64) -> bool {
        match self {
            Comparator::Gt => observed > threshold,
            Comparator::Ge => observed >= threshold,
            Comparator::Lt => observed < threshold,
            Comparator::Le => observed <= threshold,
            Comparator::Eq => (observed - threshold).abs() < f64::EPSILON,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Eq => "==",
        };
        f.write_str(symbol)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub metric: AlertMetric,
    pub window_ms: u64,
    pub threshold: f64,
    pub comparator: Comparator,
    pub severity: Severity,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub cooldown_ms: u64,
}

impl AlertRule {
    pub fn window(&self) -> Duration {
        Duration::milliseconds(self.window_ms.min(i64::MAX as u64) as i64)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::milliseconds(self.cooldown_ms.min(i64::MAX as u64) as i64)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("alert rule name is empty".to_string());
        }
        if !self.threshold.is_finite() {
            return Err(format!("alert rule {}: threshold is not finite", self.name));
        }
        if self.window_ms == 0 && self.metric != AlertMetric::QueueDepth {
            return Err(format!("alert rule {}: window must be positive", self.name));
        }
        Ok(())
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: u64,
    pub rule_name: String,
    pub fired_at: DateTime<Utc>,
    pub observed_value: f64,
    pub severity: Severity,
    /// The actor or tenant that breached the rule, for per-subject metrics.
    pub subject: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
}

impl AlertEvent {
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_at.is_some()
    }
}

/// What an evaluator hands to the store when a rule breaches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertFiring {
    pub rule_name: String,
    pub fired_at: DateTime<Utc>,
    pub observed_value: f64,
    pub severity: Severity,
    pub subject: Option<String>,
}

/// True if an event fired at `last` still blocks a firing at `now`.
pub fn within_cooldown(last: DateTime<Utc>, now: DateTime<Utc>, cooldown: Duration) -> bool {
    now < last + cooldown
}
