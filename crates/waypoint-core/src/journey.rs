//! Milestone Journey Tracker
//!
//! A journey is the progress record of one multi-phase operation: a singly
//! linked chain of milestones, one per phase. Definitions are checked once
//! when the journey starts (exactly one head, no cycles, every milestone
//! reachable); a bad chain is a configuration error and never a runtime
//! state.
//!
//! `advance` is idempotent for repeated delivery of the same result, so
//! upstream retries can call it more than once.

use crate::context::CorrelationContext;
use crate::error::{Result, WaypointError};
use crate::phase::Phase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::RwLock;

/// One entry of a journey definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneDefinition {
    pub milestone_id: String,
    pub phase_id: String,
    #[serde(default = "default_mandatory")]
    pub mandatory: bool,
    #[serde(default)]
    pub next_milestone_id: Option<String>,
}

fn default_mandatory() -> bool {
    true
}

/// Declarative journey configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JourneyDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub milestones: Vec<MilestoneDefinition>,
}

impl JourneyDefinition {
    pub fn new(milestones: Vec<MilestoneDefinition>) -> Self {
        Self {
            name: None,
            milestones,
        }
    }

    /// One milestone per phase, chained in phase order. Milestone ids
    /// equal phase ids.
    pub fn linear(phases: &[Phase]) -> Self {
        let milestones = phases
            .iter()
            .enumerate()
            .map(|(i, phase)| MilestoneDefinition {
                milestone_id: phase.phase_id.clone(),
                phase_id: phase.phase_id.clone(),
                mandatory: phase.mandatory,
                next_milestone_id: phases.get(i + 1).map(|p| p.phase_id.clone()),
            })
            .collect();
        Self::new(milestones)
    }

    /// Load from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| WaypointError::config(format!("invalid journey definition: {}", e)))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            WaypointError::config(format!("cannot read journey definition {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Check the chain shape and return definition indices in chain order.
    pub fn chain_order(&self) -> Result<Vec<usize>> {
        let n = self.milestones.len();
        if n == 0 {
            return Err(WaypointError::config("journey definition has no milestones"));
        }

        let mut index: HashMap<&str, usize> = HashMap::with_capacity(n);
        for (i, m) in self.milestones.iter().enumerate() {
            if index.insert(m.milestone_id.as_str(), i).is_some() {
                return Err(WaypointError::config(format!(
                    "duplicate milestone id '{}'",
                    m.milestone_id
                )));
            }
        }

        let mut incoming = vec![0usize; n];
        for m in &self.milestones {
            if let Some(next) = &m.next_milestone_id {
                let target = *index.get(next.as_str()).ok_or_else(|| {
                    WaypointError::config(format!(
                        "milestone '{}' points to unknown milestone '{}'",
                        m.milestone_id, next
                    ))
                })?;
                incoming[target] += 1;
                if incoming[target] > 1 {
                    return Err(WaypointError::config(format!(
                        "milestone '{}' has more than one predecessor",
                        next
                    )));
                }
            }
        }

        let heads: Vec<usize> = (0..n).filter(|i| incoming[*i] == 0).collect();
        let head = match heads.as_slice() {
            [] => {
                return Err(WaypointError::config(
                    "journey definition is cyclic: no head milestone",
                ))
            }
            [head] => *head,
            _ => {
                let ids: Vec<&str> = heads
                    .iter()
                    .map(|i| self.milestones[*i].milestone_id.as_str())
                    .collect();
                return Err(WaypointError::config(format!(
                    "journey definition has {} heads: {:?}",
                    heads.len(),
                    ids
                )));
            }
        };

        let mut order = Vec::with_capacity(n);
        let mut seen = HashSet::with_capacity(n);
        let mut cursor = Some(head);
        while let Some(i) = cursor {
            if !seen.insert(i) {
                return Err(WaypointError::config(format!(
                    "journey definition is cyclic at milestone '{}'",
                    self.milestones[i].milestone_id
                )));
            }
            order.push(i);
            cursor = self.milestones[i]
                .next_milestone_id
                .as_deref()
                .and_then(|next| index.get(next).copied());
        }

        // With one head and at most one predecessor each, anything the walk
        // missed sits on a detached cycle.
        if order.len() != n {
            let detached: Vec<&str> = (0..n)
                .filter(|i| !seen.contains(i))
                .map(|i| self.milestones[i].milestone_id.as_str())
                .collect();
            return Err(WaypointError::config(format!(
                "journey definition is cyclic: {:?} unreachable from head",
                detached
            )));
        }

        Ok(order)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    Completed,
    Failed,
}

/// Snapshot of a phase result stored on its milestone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneResult {
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The phase never ran (lenient contract skip)
    #[serde(default)]
    pub skipped: bool,
}

impl MilestoneResult {
    pub fn completed(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            skipped: false,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(error.into()),
            skipped: false,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            skipped: true,
            ..Self::failed(reason)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub milestone_id: String,
    pub phase_id: String,
    pub mandatory: bool,
    pub status: MilestoneStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<MilestoneResult>,
    pub next_milestone_id: Option<String>,
}

impl Milestone {
    pub fn is_terminal(&self) -> bool {
        self.status != MilestoneStatus::Pending
    }

    pub fn skipped(&self) -> bool {
        self.result.as_ref().map(|r| r.skipped).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Journey {
    pub journey_id: String,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Milestones in chain order, head first
    pub milestones: Vec<Milestone>,
    pub status: JourneyStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Journey {
    pub fn head(&self) -> Option<&Milestone> {
        self.milestones.first()
    }

    pub fn tail(&self) -> Option<&Milestone> {
        self.milestones.last()
    }

    pub fn milestone(&self, milestone_id: &str) -> Option<&Milestone> {
        self.milestones.iter().find(|m| m.milestone_id == milestone_id)
    }

    pub fn milestone_for_phase(&self, phase_id: &str) -> Option<&Milestone> {
        self.milestones.iter().find(|m| m.phase_id == phase_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status != JourneyStatus::InProgress
    }

    /// Every milestone has an outcome, whatever the journey status.
    pub fn is_settled(&self) -> bool {
        self.milestones.iter().all(Milestone::is_terminal)
    }

    pub fn pending(&self) -> impl Iterator<Item = &Milestone> {
        self.milestones.iter().filter(|m| !m.is_terminal())
    }

    fn derive_status(&self) -> JourneyStatus {
        if self
            .milestones
            .iter()
            .any(|m| m.mandatory && m.status == MilestoneStatus::Failed && !m.skipped())
        {
            JourneyStatus::Failed
        } else if self
            .milestones
            .iter()
            .all(|m| m.status == MilestoneStatus::Completed)
        {
            JourneyStatus::Completed
        } else {
            JourneyStatus::InProgress
        }
    }
}

#[derive(Default)]
struct Journeys {
    by_id: HashMap<String, Journey>,
    by_correlation: HashMap<String, String>,
}

/// Owns every journey in the process. Each call takes the lock for a
/// short synchronous section only.
#[derive(Default)]
pub struct MilestoneJourneyTracker {
    inner: RwLock<Journeys>,
}

impl MilestoneJourneyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_journey(
        &self,
        definition: &JourneyDefinition,
        ctx: &CorrelationContext,
    ) -> Result<Journey> {
        let order = definition.chain_order()?;
        let now = Utc::now();
        let milestones = order
            .into_iter()
            .map(|i| {
                let def = &definition.milestones[i];
                Milestone {
                    milestone_id: def.milestone_id.clone(),
                    phase_id: def.phase_id.clone(),
                    mandatory: def.mandatory,
                    status: MilestoneStatus::Pending,
                    completed_at: None,
                    result: None,
                    next_milestone_id: def.next_milestone_id.clone(),
                }
            })
            .collect();

        let journey = Journey {
            journey_id: format!("jrn_{}", uuid::Uuid::new_v4().simple()),
            correlation_id: ctx.correlation_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
            name: definition.name.clone(),
            milestones,
            status: JourneyStatus::InProgress,
            created_at: now,
            updated_at: now,
        };

        let mut inner = self.write()?;
        if inner.by_correlation.contains_key(&ctx.correlation_id) {
            return Err(WaypointError::config(format!(
                "a journey already exists for correlation id {}",
                ctx.correlation_id
            )));
        }
        inner
            .by_correlation
            .insert(journey.correlation_id.clone(), journey.journey_id.clone());
        inner.by_id.insert(journey.journey_id.clone(), journey.clone());

        tracing::info!(
            journey_id = %journey.journey_id,
            correlation_id = %journey.correlation_id,
            milestones = journey.milestones.len(),
            "journey started"
        );
        Ok(journey)
    }

    pub fn advance(
        &self,
        journey_id: &str,
        milestone_id: &str,
        result: MilestoneResult,
    ) -> Result<Journey> {
        let mut inner = self.write()?;
        let journey = inner
            .by_id
            .get_mut(journey_id)
            .ok_or_else(|| WaypointError::InvalidTransition(format!("unknown journey {}", journey_id)))?;

        let journey_terminal = journey.is_terminal();
        let milestone = journey
            .milestones
            .iter_mut()
            .find(|m| m.milestone_id == milestone_id)
            .ok_or_else(|| {
                WaypointError::InvalidTransition(format!(
                    "journey {} has no milestone '{}'",
                    journey_id, milestone_id
                ))
            })?;

        if milestone.is_terminal() {
            if milestone.result.as_ref() == Some(&result) {
                return Ok(journey.clone());
            }
            return Err(WaypointError::InvalidTransition(format!(
                "milestone '{}' already {:?} with a different result",
                milestone_id, milestone.status
            )));
        }
        if journey_terminal {
            return Err(WaypointError::InvalidTransition(format!(
                "journey {} is already {:?}",
                journey_id, journey.status
            )));
        }

        let now = Utc::now();
        milestone.status = if result.success {
            MilestoneStatus::Completed
        } else {
            MilestoneStatus::Failed
        };
        milestone.completed_at = Some(now);
        milestone.result = Some(result);

        journey.status = journey.derive_status();
        journey.updated_at = now;

        match journey.status {
            JourneyStatus::InProgress => {
                tracing::debug!(journey_id, milestone_id, "milestone advanced")
            }
            status => tracing::info!(journey_id, milestone_id, ?status, "journey finished"),
        }
        Ok(journey.clone())
    }

    pub fn get_journey(&self, journey_id: &str) -> Option<Journey> {
        self.inner.read().ok()?.by_id.get(journey_id).cloned()
    }

    pub fn journey_for_correlation(&self, correlation_id: &str) -> Option<Journey> {
        let inner = self.inner.read().ok()?;
        let journey_id = inner.by_correlation.get(correlation_id)?;
        inner.by_id.get(journey_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.by_id.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Journeys>> {
        self.inner
            .write()
            .map_err(|_| WaypointError::InvalidTransition("journey store lock poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextAttrs, CorrelationContextFactory};
    use serde_json::json;
    use std::sync::Arc;

    fn ctx() -> CorrelationContext {
        CorrelationContextFactory::default()
            .create(None, ContextAttrs::new().tenant("acme"))
            .unwrap()
    }

    fn m(id: &str, next: Option<&str>, mandatory: bool) -> MilestoneDefinition {
        MilestoneDefinition {
            milestone_id: id.to_string(),
            phase_id: format!("phase-{}", id),
            mandatory,
            next_milestone_id: next.map(str::to_string),
        }
    }

    fn chain(n: usize) -> Vec<MilestoneDefinition> {
        (0..n)
            .map(|i| {
                let next = if i + 1 < n { Some(format!("m{}", i + 1)) } else { None };
                m(&format!("m{}", i), next.as_deref(), true)
            })
            .collect()
    }

    #[test]
    fn test_acyclic_definitions_start() {
        let tracker = MilestoneJourneyTracker::new();
        for n in 1..8 {
            // declare in a scrambled order; the chain must still come out head first
            let mut milestones = chain(n);
            milestones.rotate_left(n / 2);
            if n > 2 {
                milestones.swap(0, n - 1);
            }
            let journey = tracker
                .start_journey(&JourneyDefinition::new(milestones), &ctx())
                .unwrap();

            assert_eq!(journey.milestones.len(), n);
            assert_eq!(journey.head().unwrap().milestone_id, "m0");
            assert_eq!(journey.tail().unwrap().next_milestone_id, None);
            assert_eq!(journey.status, JourneyStatus::InProgress);
            let ids: Vec<String> = journey.milestones.iter().map(|m| m.milestone_id.clone()).collect();
            let expected: Vec<String> = (0..n).map(|i| format!("m{}", i)).collect();
            assert_eq!(ids, expected);
        }
    }

    #[test]
    fn test_cyclic_definitions_rejected() {
        let tracker = MilestoneJourneyTracker::new();
        for n in 1..6 {
            for back in 0..n {
                let mut milestones = chain(n);
                milestones[n - 1].next_milestone_id = Some(format!("m{}", back));
                let err = tracker
                    .start_journey(&JourneyDefinition::new(milestones), &ctx())
                    .unwrap_err();
                assert!(matches!(err, WaypointError::Configuration(_)), "n={} back={}", n, back);
            }
        }
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_malformed_definitions_rejected() {
        let cases = vec![
            vec![],
            vec![m("a", Some("b"), true), m("a", None, true)],
            vec![m("a", Some("ghost"), true)],
            vec![m("a", None, true), m("b", None, true)],
            vec![m("a", Some("c"), true), m("b", Some("c"), true), m("c", None, true)],
            // head a → b, plus detached x ⇄ y
            vec![
                m("a", Some("b"), true),
                m("b", None, true),
                m("x", Some("y"), true),
                m("y", Some("x"), true),
            ],
        ];
        for milestones in cases {
            let def = JourneyDefinition::new(milestones.clone());
            assert!(def.chain_order().is_err(), "accepted {:?}", milestones);
        }
    }

    #[test]
    fn test_advance_to_completion() {
        let tracker = MilestoneJourneyTracker::new();
        let journey = tracker
            .start_journey(&JourneyDefinition::new(chain(2)), &ctx())
            .unwrap();

        let j = tracker
            .advance(&journey.journey_id, "m0", MilestoneResult::completed(json!({ "rows": 3 })))
            .unwrap();
        assert_eq!(j.status, JourneyStatus::InProgress);
        assert!(j.milestone("m0").unwrap().completed_at.is_some());

        let j = tracker
            .advance(&journey.journey_id, "m1", MilestoneResult::completed(json!(null)))
            .unwrap();
        assert_eq!(j.status, JourneyStatus::Completed);
        assert!(j.is_settled());
    }

    #[test]
    fn test_advance_is_idempotent() {
        let tracker = MilestoneJourneyTracker::new();
        let journey = tracker
            .start_journey(&JourneyDefinition::new(chain(3)), &ctx())
            .unwrap();
        let result = MilestoneResult::completed(json!({ "stored_id": "doc-1" }));

        let first = tracker.advance(&journey.journey_id, "m1", result.clone()).unwrap();
        let second = tracker.advance(&journey.journey_id, "m1", result).unwrap();
        assert_eq!(first, second);

        let conflicting = tracker.advance(&journey.journey_id, "m1", MilestoneResult::failed("late"));
        assert!(matches!(conflicting, Err(WaypointError::InvalidTransition(_))));
    }

    #[test]
    fn test_mandatory_failure_is_terminal() {
        let tracker = MilestoneJourneyTracker::new();
        let def = JourneyDefinition::new(vec![
            m("a", Some("b"), true),
            m("b", Some("c"), false),
            m("c", None, true),
        ]);
        let journey = tracker.start_journey(&def, &ctx()).unwrap();
        let id = journey.journey_id.clone();

        tracker.advance(&id, "a", MilestoneResult::completed(json!(1))).unwrap();
        let j = tracker.advance(&id, "b", MilestoneResult::skipped("contract")).unwrap();
        assert_eq!(j.status, JourneyStatus::InProgress);
        assert!(j.milestone("b").unwrap().skipped());

        let j = tracker.advance(&id, "c", MilestoneResult::completed(json!(2))).unwrap();
        // a skipped milestone keeps the journey from completing, but not terminal
        assert_eq!(j.status, JourneyStatus::InProgress);
        assert!(j.is_settled());

        let journey = tracker
            .start_journey(&JourneyDefinition::new(chain(2)), &ctx())
            .unwrap();
        let failed = MilestoneResult::failed("boom");
        let j = tracker.advance(&journey.journey_id, "m0", failed.clone()).unwrap();
        assert_eq!(j.status, JourneyStatus::Failed);

        // replay of the failing event is still a no-op
        assert_eq!(tracker.advance(&journey.journey_id, "m0", failed).unwrap(), j);
        assert!(tracker
            .advance(&journey.journey_id, "m1", MilestoneResult::completed(json!(null)))
            .is_err());
    }

    #[test]
    fn test_skipped_mandatory_milestone_does_not_fail_journey() {
        let tracker = MilestoneJourneyTracker::new();
        let journey = tracker
            .start_journey(&JourneyDefinition::new(chain(3)), &ctx())
            .unwrap();
        let id = journey.journey_id.clone();

        tracker.advance(&id, "m0", MilestoneResult::completed(json!(1))).unwrap();
        let j = tracker.advance(&id, "m1", MilestoneResult::skipped("contract")).unwrap();
        assert!(j.milestone("m1").unwrap().mandatory);
        assert_eq!(j.milestone("m1").unwrap().status, MilestoneStatus::Failed);
        assert_eq!(j.status, JourneyStatus::InProgress);

        let j = tracker.advance(&id, "m2", MilestoneResult::completed(json!(2))).unwrap();
        assert_eq!(j.status, JourneyStatus::InProgress);
        assert!(j.is_settled());
    }

    #[test]
    fn test_correlation_is_single_owner() {
        let tracker = MilestoneJourneyTracker::new();
        let ctx = ctx();
        let def = JourneyDefinition::new(chain(1));
        let journey = tracker.start_journey(&def, &ctx).unwrap();

        assert!(tracker.start_journey(&def, &ctx).is_err());
        assert_eq!(
            tracker.journey_for_correlation(&ctx.correlation_id).unwrap().journey_id,
            journey.journey_id
        );
        assert!(tracker.get_journey("jrn_missing").is_none());
        assert!(tracker.advance("jrn_missing", "m0", MilestoneResult::completed(json!(null))).is_err());
    }

    #[test]
    fn test_definition_from_yaml() {
        let yaml = r#"
name: ingest
milestones:
  - milestone_id: validated
    phase_id: validate
    next_milestone_id: stored
  - milestone_id: stored
    phase_id: store
    next_milestone_id: notified
  - milestone_id: notified
    phase_id: notify
    mandatory: false
"#;
        let def = JourneyDefinition::from_yaml(yaml).unwrap();
        assert_eq!(def.name.as_deref(), Some("ingest"));
        assert!(def.milestones[0].mandatory);
        assert!(!def.milestones[2].mandatory);
        assert_eq!(def.milestones[2].next_milestone_id, None);
        assert_eq!(def.chain_order().unwrap(), vec![0, 1, 2]);

        assert!(JourneyDefinition::from_yaml("milestones: 7").is_err());
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_advance() {
        let tracker = Arc::new(MilestoneJourneyTracker::new());
        let journey = tracker
            .start_journey(&JourneyDefinition::new(chain(2)), &ctx())
            .unwrap();
        let result = MilestoneResult::completed(json!({ "ok": true }));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let tracker = tracker.clone();
            let id = journey.journey_id.clone();
            let result = result.clone();
            handles.push(tokio::spawn(async move { tracker.advance(&id, "m0", result) }));
        }

        let mut snapshots = Vec::new();
        for handle in handles {
            snapshots.push(handle.await.unwrap().unwrap());
        }
        assert!(snapshots.windows(2).all(|w| w[0] == w[1]));
    }
}
