use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use trail_store::{
    AlertEvent, AlertFiring, AlertMetric, AlertRule, ChangeFilter, Clock, StoreError, TimeRange,
    TrailBackend,
};

/// A measured aggregate, with the actor or tenant it belongs to if any.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Observation {
    pub value: f64,
    pub subject: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RuleFailure {
    pub rule: String,
    pub error: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub evaluated: usize,
    pub fired: Vec<AlertEvent>,
    /// Rules that breached but were still cooling down.
    pub suppressed: Vec<String>,
    pub failures: Vec<RuleFailure>,
}

#[derive(Clone)]
pub struct AlertEvaluator {
    backend: Arc<dyn TrailBackend>,
    clock: Arc<dyn Clock>,
}

impl AlertEvaluator {
    pub fn new(backend: Arc<dyn TrailBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    pub fn evaluate(&self) -> Result<EvaluationReport, StoreError> {
        self.evaluate_at(self.clock.now())
    }

    /// Evaluates every enabled rule over the window ending at `now`. A failing
    /// rule is reported and skipped; only loading the rules can fail the cycle.
    pub fn evaluate_at(&self, now: DateTime<Utc>) -> Result<EvaluationReport, StoreError> {
        let mut report = EvaluationReport::default();
        for rule in self.backend.list_rules()? {
            if !rule.enabled {
                continue;
            }
            report.evaluated += 1;
            match self.evaluate_rule(&rule, now) {
                Ok(RuleOutcome::Fired(event)) => report.fired.push(event),
                Ok(RuleOutcome::Quiet) => {}
                Ok(RuleOutcome::CoolingDown) => report.suppressed.push(rule.name.clone()),
                Err(err) => {
                    warn!(rule = %rule.name, error = %err, "alert rule evaluation failed");
                    report.failures.push(RuleFailure {
                        rule: rule.name.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    pub fn observe(&self, rule: &AlertRule, now: DateTime<Utc>) -> Result<Observation, StoreError> {
        let window = TimeRange::ending_at(now, rule.window());
        let observation = match &rule.metric {
            AlertMetric::ChangeCount { entity, operation } => {
                let filter = ChangeFilter {
                    entity: entity.clone(),
                    operation: *operation,
                };
                Observation {
                    value: self.backend.count(window, &filter)? as f64,
                    subject: None,
                }
            }
            AlertMetric::ActorChangeCount => top_observation(self.backend.top_actor(window)?),
            AlertMetric::TenantChangeCount => top_observation(self.backend.top_tenant(window)?),
            AlertMetric::QueueDepth => Observation {
                value: self.backend.depth(now)?.total() as f64,
                subject: None,
            },
        };
        Ok(observation)
    }

    fn evaluate_rule(
        &self,
        rule: &AlertRule,
        now: DateTime<Utc>,
    ) -> Result<RuleOutcome, StoreError> {
        let observation = self.observe(rule, now)?;
        if !rule.comparator.holds(observation.value, rule.threshold) {
            debug!(rule = %rule.name, observed = observation.value, "alert rule quiet");
            return Ok(RuleOutcome::Quiet);
        }
        let firing = AlertFiring {
            rule_name: rule.name.clone(),
            fired_at: now,
            observed_value: observation.value,
            severity: rule.severity,
            subject: observation.subject,
        };
        match self.backend.fire_if_cooled(firing)? {
            Some(event) => {
                info!(
                    rule = %rule.name,
                    severity = rule.severity.as_str(),
                    observed = event.observed_value,
                    threshold = rule.threshold,
                    comparator = %rule.comparator,
                    subject = ?event.subject,
                    "alert fired"
                );
                Ok(RuleOutcome::Fired(event))
            }
            None => {
                debug!(rule = %rule.name, "alert breached within cooldown");
                Ok(RuleOutcome::CoolingDown)
            }
        }
    }
}

enum RuleOutcome {
    Quiet,
    Fired(AlertEvent),
    CoolingDown,
}

fn top_observation(top: Option<trail_store::ActivityCount>) -> Observation {
    match top {
        Some(top) => Observation {
            value: top.count as f64,
            subject: Some(top.subject),
        },
        None => Observation {
            value: 0.0,
            subject: None,
        },
    }
}
