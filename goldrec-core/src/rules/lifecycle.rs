//! Violation lifecycle.
//!
//! ```text
//! OPEN ──> IN_PROGRESS ──> RESOLVED | FALSE_POSITIVE | ACCEPTED_RISK
//!   └──────────────────────> RESOLVED | FALSE_POSITIVE | ACCEPTED_RISK
//! RESOLVED ──(detected again after resolution)──> OPEN
//! FALSE_POSITIVE | ACCEPTED_RISK ──(clear_override)──> OPEN
//! ```
//!
//! Manual overrides are sticky: re-evaluation never reopens or resolves
//! them. Reconciliation produces [`ViolationChange`]s guarded on the status
//! they were computed from, so a steward decision stored in the meantime is
//! never overwritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Evaluation, Finding};
use crate::models::{Violation, ViolationKey, ViolationStatus, ViolationWrite};
use crate::{GoldrecError, Result};

const AUTO_RESOLVED: &str = "auto-resolved";
const ENTITY_RETIRED: &str = "entity no longer active";

impl Violation {
    /// New OPEN violation for a finding.
    pub fn open(finding: &Finding, detected_at: DateTime<Utc>) -> Self {
        Self {
            rule_name: finding.rule_name.clone(),
            entity_type: finding.entity_type,
            entity_id: finding.entity_id.clone(),
            severity: finding.severity,
            description: finding.description.clone(),
            detected_value: finding.detected_value.clone(),
            expected_value: finding.expected_value.clone(),
            status: ViolationStatus::Open,
            first_detected_at: detected_at,
            last_detected_at: detected_at,
            resolved_at: None,
            resolution_note: None,
            reopen_count: 0,
        }
    }

    /// Explicit status change, e.g. by a data steward.
    ///
    /// Overrides can only be left through [`Violation::clear_override`].
    ///
    /// # Errors
    /// Returns `InvalidTransition` if the lifecycle does not allow the change.
    pub fn transition(
        &mut self,
        to: ViolationStatus,
        at: DateTime<Utc>,
        note: Option<String>,
    ) -> Result<()> {
        use ViolationStatus::*;
        let allowed = matches!(
            (self.status, to),
            (Open, InProgress)
                | (InProgress, Open)
                | (Open | InProgress, Resolved | FalsePositive | AcceptedRisk)
                | (Resolved, Open)
        );
        if !allowed {
            return Err(GoldrecError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }

        match to {
            Resolved | FalsePositive | AcceptedRisk => {
                self.resolved_at = Some(at);
                self.resolution_note = note;
            }
            Open if self.status == Resolved => {
                self.reopen_count += 1;
                self.resolved_at = None;
                self.resolution_note = note;
            }
            Open | InProgress => {
                if note.is_some() {
                    self.resolution_note = note;
                }
            }
        }
        tracing::debug!(
            rule = %self.rule_name,
            entity = %self.entity_id,
            "Violation {} -> {}",
            self.status,
            to
        );
        self.status = to;
        Ok(())
    }

    /// Returns a manually overridden violation to OPEN.
    ///
    /// # Errors
    /// Returns `InvalidTransition` unless the status is ACCEPTED_RISK or
    /// FALSE_POSITIVE.
    pub fn clear_override(&mut self, at: DateTime<Utc>) -> Result<()> {
        if !self.status.is_manual_override() {
            return Err(GoldrecError::InvalidTransition {
                from: self.status.to_string(),
                to: ViolationStatus::Open.to_string(),
            });
        }
        self.status = ViolationStatus::Open;
        self.resolved_at = None;
        self.resolution_note = None;
        self.last_detected_at = self.last_detected_at.max(at);
        Ok(())
    }

    fn refresh(&mut self, finding: &Finding, detected_at: DateTime<Utc>) {
        self.severity = finding.severity;
        self.description = finding.description.clone();
        self.detected_value = finding.detected_value.clone();
        self.expected_value = finding.expected_value.clone();
        self.last_detected_at = detected_at;
    }
}

/// What reconciliation does to one violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    Opened,
    Updated,
    Reopened,
    Resolved,
}

/// One guarded violation write computed by reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct ViolationChange {
    pub action: ReconcileAction,
    pub write: ViolationWrite,
}

impl ViolationChange {
    fn new(action: ReconcileAction, violation: Violation, expected: Option<ViolationStatus>) -> Self {
        Self {
            action,
            write: ViolationWrite {
                violation,
                expected,
            },
        }
    }

    /// The violation as it will be stored.
    pub fn violation(&self) -> &Violation {
        &self.write.violation
    }
}

/// Counts of what one reconciliation did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub opened: usize,
    pub updated: usize,
    pub reopened: usize,
    pub resolved: usize,
    /// Overrides and failed evaluations left as they were
    pub untouched: usize,
}

impl ReconcileSummary {
    /// Counts one applied change.
    pub fn record(&mut self, action: ReconcileAction) {
        match action {
            ReconcileAction::Opened => self.opened += 1,
            ReconcileAction::Updated => self.updated += 1,
            ReconcileAction::Reopened => self.reopened += 1,
            ReconcileAction::Resolved => self.resolved += 1,
        }
    }
}

/// Applies an evaluation to the stored violations.
#[derive(Debug, Clone, Copy, Default)]
pub struct ViolationLedger;

impl ViolationLedger {
    /// Computes the violations that change.
    ///
    /// Returns the changes, ordered by key, and a summary. Each change
    /// carries the stored status it was computed from. The input slice is
    /// not modified; violations that do not change are not returned.
    pub fn reconcile(
        existing: &[Violation],
        evaluation: &Evaluation,
        now: DateTime<Utc>,
    ) -> (Vec<ViolationChange>, ReconcileSummary) {
        let mut summary = ReconcileSummary::default();
        let mut changed: BTreeMap<ViolationKey, ViolationChange> = BTreeMap::new();
        let stored: BTreeMap<ViolationKey, &Violation> =
            existing.iter().map(|v| (v.key(), v)).collect();

        for finding in &evaluation.findings {
            let key = finding.key();
            match stored.get(&key) {
                None => {
                    let change =
                        ViolationChange::new(ReconcileAction::Opened, Violation::open(finding, now), None);
                    changed.insert(key, change);
                }
                Some(current) if current.status.is_active() => {
                    let mut violation = (*current).clone();
                    violation.refresh(finding, now);
                    let change =
                        ViolationChange::new(ReconcileAction::Updated, violation, Some(current.status));
                    changed.insert(key, change);
                }
                Some(current) if current.status == ViolationStatus::Resolved => {
                    if current.resolved_at.is_none_or(|resolved| now > resolved) {
                        let mut violation = (*current).clone();
                        violation.refresh(finding, now);
                        violation.status = ViolationStatus::Open;
                        violation.reopen_count += 1;
                        violation.resolved_at = None;
                        violation.resolution_note = None;
                        let change = ViolationChange::new(
                            ReconcileAction::Reopened,
                            violation,
                            Some(ViolationStatus::Resolved),
                        );
                        changed.insert(key, change);
                    } else {
                        summary.untouched += 1;
                    }
                }
                Some(_) => summary.untouched += 1,
            }
        }

        for violation in existing {
            if !violation.status.is_active() || !evaluation.rules_run.contains(&violation.rule_name)
            {
                continue;
            }
            let key = violation.key();
            if evaluation.failed(&key) {
                summary.untouched += 1;
                continue;
            }
            let note = if evaluation.passed(&key) {
                AUTO_RESOLVED
            } else if !evaluation.contains_entity(violation.entity_type, &violation.entity_id) {
                ENTITY_RETIRED
            } else {
                continue;
            };
            let mut resolved = violation.clone();
            resolved.status = ViolationStatus::Resolved;
            resolved.resolved_at = Some(now);
            resolved.resolution_note = Some(note.to_string());
            let change = ViolationChange::new(ReconcileAction::Resolved, resolved, Some(violation.status));
            changed.insert(key, change);
        }

        for change in changed.values() {
            summary.record(change.action);
        }
        tracing::debug!(
            opened = summary.opened,
            updated = summary.updated,
            reopened = summary.reopened,
            resolved = summary.resolved,
            untouched = summary.untouched,
            "Violations reconciled"
        );
        (changed.into_values().collect(), summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, Severity};
    use crate::rules::RuleFailure;
    use chrono::{Duration, NaiveDate, TimeZone};
    use std::collections::BTreeSet;

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap()
    }

    fn key(entity: &str) -> ViolationKey {
        ViolationKey {
            rule_name: "npi_format".to_string(),
            entity_type: EntityType::Provider,
            entity_id: entity.to_string(),
        }
    }

    fn finding(entity: &str, detected: &str) -> Finding {
        Finding {
            rule_name: "npi_format".to_string(),
            entity_type: EntityType::Provider,
            entity_id: entity.to_string(),
            severity: Severity::High,
            description: "NPI has 5 digits".to_string(),
            detected_value: Some(detected.to_string()),
            expected_value: Some("10-digit NPI".to_string()),
        }
    }

    /// Evaluation where `failing` entities fail, `passing` pass and
    /// `broken` could not be evaluated.
    fn evaluation(failing: &[(&str, &str)], passing: &[&str], broken: &[&str]) -> Evaluation {
        let findings: Vec<Finding> = failing.iter().map(|(e, d)| finding(e, d)).collect();
        let mut checked: BTreeSet<ViolationKey> = passing.iter().map(|e| key(e)).collect();
        checked.extend(findings.iter().map(Finding::key));
        let entities = failing
            .iter()
            .map(|(e, _)| *e)
            .chain(passing.iter().copied())
            .chain(broken.iter().copied())
            .map(|e| (EntityType::Provider, e.to_string()))
            .collect();
        Evaluation {
            findings,
            failures: broken
                .iter()
                .map(|e| RuleFailure {
                    rule_name: "npi_format".to_string(),
                    entity_type: EntityType::Provider,
                    entity_id: e.to_string(),
                    reason: "bad type".to_string(),
                })
                .collect(),
            checked,
            rules_run: ["npi_format".to_string()].into_iter().collect(),
            entities,
            as_of: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            evaluated_at: t(0),
        }
    }

    fn stored(entity: &str, status: ViolationStatus, resolved_at: Option<DateTime<Utc>>) -> Violation {
        let mut violation = Violation::open(&finding(entity, "12345"), t(1));
        violation.status = status;
        violation.resolved_at = resolved_at;
        violation
    }

    #[test]
    fn test_new_failure_opens_violation() {
        let (changed, summary) = ViolationLedger::reconcile(&[], &evaluation(&[("p1", "12345")], &[], &[]), t(2));

        assert_eq!(summary.opened, 1);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].violation().status, ViolationStatus::Open);
        assert_eq!(changed[0].violation().first_detected_at, t(2));
        assert_eq!(changed[0].action, ReconcileAction::Opened);
        assert_eq!(changed[0].write.expected, None);
    }

    #[test]
    fn test_still_failing_updates_without_duplicate() {
        let existing = vec![stored("p1", ViolationStatus::InProgress, None)];
        let (changed, summary) =
            ViolationLedger::reconcile(&existing, &evaluation(&[("p1", "123")], &[], &[]), t(3));

        assert_eq!(summary.updated, 1);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].violation().status, ViolationStatus::InProgress);
        assert_eq!(changed[0].violation().detected_value.as_deref(), Some("123"));
        assert_eq!(changed[0].violation().first_detected_at, t(1));
        assert_eq!(changed[0].violation().last_detected_at, t(3));
    }

    #[test]
    fn test_passing_auto_resolves_open() {
        let existing = vec![stored("p1", ViolationStatus::Open, None)];
        let (changed, summary) = ViolationLedger::reconcile(&existing, &evaluation(&[], &["p1"], &[]), t(3));

        assert_eq!(summary.resolved, 1);
        assert_eq!(changed[0].violation().status, ViolationStatus::Resolved);
        assert_eq!(changed[0].write.expected, Some(ViolationStatus::Open));
        assert_eq!(changed[0].violation().resolution_note.as_deref(), Some("auto-resolved"));
        assert_eq!(changed[0].violation().resolved_at, Some(t(3)));
    }

    #[test]
    fn test_overrides_are_sticky() {
        let existing = vec![
            stored("p1", ViolationStatus::AcceptedRisk, Some(t(2))),
            stored("p2", ViolationStatus::FalsePositive, Some(t(2))),
        ];

        let failing = evaluation(&[("p1", "1"), ("p2", "2")], &[], &[]);
        let (changed, summary) = ViolationLedger::reconcile(&existing, &failing, t(5));
        assert!(changed.is_empty());
        assert_eq!(summary.untouched, 2);

        let passing = evaluation(&[], &["p1", "p2"], &[]);
        let (changed, _) = ViolationLedger::reconcile(&existing, &passing, t(5));
        assert!(changed.is_empty());
    }

    #[test]
    fn test_resolved_reopens_only_after_resolution() {
        let existing = vec![stored("p1", ViolationStatus::Resolved, Some(t(4)))];

        let (changed, _) =
            ViolationLedger::reconcile(&existing, &evaluation(&[("p1", "9")], &[], &[]), t(4));
        assert!(changed.is_empty());

        let (changed, summary) =
            ViolationLedger::reconcile(&existing, &evaluation(&[("p1", "9")], &[], &[]), t(5));
        assert_eq!(summary.reopened, 1);
        assert_eq!(changed[0].violation().status, ViolationStatus::Open);
        assert_eq!(changed[0].violation().reopen_count, 1);
        assert_eq!(changed[0].violation().resolved_at, None);
    }

    #[test]
    fn test_failed_evaluation_never_auto_resolves() {
        let existing = vec![stored("p1", ViolationStatus::Open, None)];
        let (changed, summary) = ViolationLedger::reconcile(&existing, &evaluation(&[], &[], &["p1"]), t(3));

        assert!(changed.is_empty());
        assert_eq!(summary.untouched, 1);
    }

    #[test]
    fn test_retired_entity_is_resolved() {
        let existing = vec![stored("gone", ViolationStatus::Open, None)];
        let (changed, _) = ViolationLedger::reconcile(&existing, &evaluation(&[], &["p1"], &[]), t(3));

        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].violation().resolution_note.as_deref(), Some("entity no longer active"));
    }

    #[test]
    fn test_rules_not_run_are_left_alone() {
        let mut other = stored("p1", ViolationStatus::Open, None);
        other.rule_name = "contact_validation".to_string();
        let (changed, _) = ViolationLedger::reconcile(&[other], &evaluation(&[], &["p1"], &[]), t(3));
        assert!(changed.is_empty());
    }

    #[test]
    fn test_explicit_transitions() {
        let mut violation = stored("p1", ViolationStatus::Open, None);
        violation
            .transition(ViolationStatus::InProgress, t(2), None)
            .unwrap();
        violation
            .transition(ViolationStatus::AcceptedRisk, t(3), Some("vendor data".to_string()))
            .unwrap();
        assert_eq!(violation.resolved_at, Some(t(3)));

        let err = violation
            .transition(ViolationStatus::Open, t(4), None)
            .unwrap_err();
        assert!(matches!(err, GoldrecError::InvalidTransition { .. }));

        violation.clear_override(t(4)).unwrap();
        assert_eq!(violation.status, ViolationStatus::Open);
        assert_eq!(violation.resolved_at, None);
        assert!(violation.clear_override(t(5)).is_err());
    }

    #[test]
    fn test_manual_resolve_then_reopen() {
        let mut violation = stored("p1", ViolationStatus::Open, None);
        violation
            .transition(ViolationStatus::Resolved, t(2), Some("fixed at source".to_string()))
            .unwrap();
        violation.transition(ViolationStatus::Open, t(3), None).unwrap();
        assert_eq!(violation.reopen_count, 1);

        assert!(
            violation
                .transition(ViolationStatus::Open, t(3) + Duration::hours(1), None)
                .is_err()
        );
    }
}
