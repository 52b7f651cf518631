//! Validation rule engine.
//!
//! Rules are configuration data: a [`RuleSetConfig`] lists named
//! [`RuleDefinition`]s whose [`RuleKind`] carries the parameters and
//! severities. The engine evaluates every enabled rule over a point-in-time
//! [`EntityGraph`] and returns an [`Evaluation`]; turning findings into
//! violation state changes is the job of [`ViolationLedger`].
//!
//! A rule that cannot evaluate an entity (for example a field stored with the
//! wrong type) records a failure for that entity only. Other entities and
//! other rules are unaffected, and the failed pair is never auto-resolved.

mod activity;
mod affiliation;
mod contact;
mod lifecycle;
mod npi;
mod temporal;

pub use activity::{ActivityAnomalyParams, population_statistics};
pub use affiliation::AffiliationCardinalityParams;
pub use contact::ContactValidationParams;
pub use lifecycle::{ReconcileAction, ReconcileSummary, ViolationChange, ViolationLedger};
pub use npi::{NpiDuplicateParams, NpiFormatParams};
pub use temporal::TemporalConsistencyParams;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::config::ConfigValidationError;
use crate::models::{
    Affiliation, EntityGraph, EntityType, FieldValue, GoldenRecord, Severity, ViolationKey,
};
use crate::{GoldrecError, Result};

/// Rule kinds and their parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    NpiFormat(NpiFormatParams),
    NpiDuplicate(NpiDuplicateParams),
    AffiliationCardinality(AffiliationCardinalityParams),
    TemporalConsistency(TemporalConsistencyParams),
    ContactValidation(ContactValidationParams),
    ActivityAnomaly(ActivityAnomalyParams),
}

impl RuleKind {
    fn build(&self, name: &str) -> Result<Box<dyn Rule>> {
        let name = name.to_string();
        Ok(match self {
            RuleKind::NpiFormat(params) => Box::new(npi::NpiFormatRule::new(name, params.clone())),
            RuleKind::NpiDuplicate(params) => {
                Box::new(npi::NpiDuplicateRule::new(name, params.clone()))
            }
            RuleKind::AffiliationCardinality(params) => Box::new(
                affiliation::AffiliationCardinalityRule::new(name, params.clone()),
            ),
            RuleKind::TemporalConsistency(params) => {
                Box::new(temporal::TemporalConsistencyRule::new(name, params.clone()))
            }
            RuleKind::ContactValidation(params) => {
                Box::new(contact::ContactValidationRule::new(name, params.clone())?)
            }
            RuleKind::ActivityAnomaly(params) => {
                Box::new(activity::ActivityAnomalyRule::new(name, params.clone()))
            }
        })
    }
}

fn default_enabled() -> bool {
    true
}

/// One named, configurable rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub kind: RuleKind,
}

impl RuleDefinition {
    pub fn new(name: impl Into<String>, kind: RuleKind) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            kind,
        }
    }

    /// Builder method to enable/disable the rule.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// The configured rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSetConfig {
    pub rules: Vec<RuleDefinition>,
}

impl Default for RuleSetConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                RuleDefinition::new("npi_format", RuleKind::NpiFormat(NpiFormatParams::default())),
                RuleDefinition::new(
                    "npi_duplicate",
                    RuleKind::NpiDuplicate(NpiDuplicateParams::default()),
                ),
                RuleDefinition::new(
                    "affiliation_cardinality",
                    RuleKind::AffiliationCardinality(AffiliationCardinalityParams::default()),
                ),
                RuleDefinition::new(
                    "temporal_consistency",
                    RuleKind::TemporalConsistency(TemporalConsistencyParams::default()),
                ),
                RuleDefinition::new(
                    "contact_validation",
                    RuleKind::ContactValidation(ContactValidationParams::default()),
                ),
                RuleDefinition::new(
                    "activity_anomaly",
                    RuleKind::ActivityAnomaly(ActivityAnomalyParams::default()),
                ),
            ],
        }
    }
}

impl RuleSetConfig {
    /// Builder method to enable/disable a rule by name.
    pub fn with_rule_enabled(mut self, name: &str, enabled: bool) -> Self {
        match self.rules.iter_mut().find(|r| r.name == name) {
            Some(rule) => rule.enabled = enabled,
            None => tracing::warn!("Unknown rule '{}' left unchanged", name),
        }
        self
    }

    /// Builder method to add or replace a rule definition.
    pub fn with_rule(mut self, definition: RuleDefinition) -> Self {
        self.rules.retain(|r| r.name != definition.name);
        self.rules.push(definition);
        self
    }

    /// Validates rule names and parameters.
    pub fn validate(&self) -> std::result::Result<(), ConfigValidationError> {
        let mut names = BTreeSet::new();
        for rule in &self.rules {
            if rule.name.trim().is_empty() {
                return Err(ConfigValidationError::Inconsistent {
                    message: "rule names must not be empty".to_string(),
                });
            }
            if !names.insert(rule.name.as_str()) {
                return Err(ConfigValidationError::DuplicateRule {
                    name: rule.name.clone(),
                });
            }
            let problem = match &rule.kind {
                RuleKind::AffiliationCardinality(p) => p.problem(),
                RuleKind::TemporalConsistency(p) => p.problem(),
                RuleKind::ActivityAnomaly(p) => p.problem(),
                RuleKind::ContactValidation(p) => p.problem(),
                RuleKind::NpiFormat(_) | RuleKind::NpiDuplicate(_) => None,
            };
            if let Some(problem) = problem {
                return Err(ConfigValidationError::Inconsistent {
                    message: format!("rule '{}': {}", rule.name, problem),
                });
            }
        }
        Ok(())
    }
}

/// A rule that currently fails for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub rule_name: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub severity: Severity,
    pub description: String,
    pub detected_value: Option<String>,
    pub expected_value: Option<String>,
}

impl Finding {
    /// Identity of the violation this finding maps to.
    pub fn key(&self) -> ViolationKey {
        ViolationKey {
            rule_name: self.rule_name.clone(),
            entity_type: self.entity_type,
            entity_id: self.entity_id.clone(),
        }
    }
}

/// One failed check inside a rule, before the rule folds its issues.
#[derive(Debug, Clone)]
pub(crate) struct Issue {
    pub severity: Severity,
    pub description: String,
    pub detected: Option<String>,
    pub expected: Option<String>,
}

impl Issue {
    pub(crate) fn new(severity: Severity, description: impl Into<String>) -> Self {
        Self {
            severity,
            description: description.into(),
            detected: None,
            expected: None,
        }
    }

    pub(crate) fn detected(mut self, value: impl ToString) -> Self {
        self.detected = Some(value.to_string());
        self
    }

    pub(crate) fn expected(mut self, value: impl Into<String>) -> Self {
        self.expected = Some(value.into());
        self
    }
}

/// Folds a rule's issues for one entity into a single finding.
///
/// The most severe issue supplies severity and values (the first one on
/// ties); all descriptions are kept.
pub(crate) fn fold_issues(
    rule_name: &str,
    entity_type: EntityType,
    entity_id: &str,
    issues: Vec<Issue>,
) -> Option<Finding> {
    let worst = issues
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| a.severity.cmp(&b.severity).then(ib.cmp(ia)))
        .map(|(i, _)| i)?;
    let description = issues
        .iter()
        .map(|i| i.description.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    let worst = &issues[worst];
    Some(Finding {
        rule_name: rule_name.to_string(),
        entity_type,
        entity_id: entity_id.to_string(),
        severity: worst.severity,
        description,
        detected_value: worst.detected.clone(),
        expected_value: worst.expected.clone(),
    })
}

/// The most severe issue, the first one on ties.
pub(crate) fn most_severe(issues: Vec<Issue>) -> Option<Issue> {
    issues.into_iter().rev().max_by_key(|i| i.severity)
}

/// A rule that could not be evaluated for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleFailure {
    pub rule_name: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub reason: String,
}

/// Result of one rule for one entity.
pub(crate) struct EntityCheck {
    pub entity_id: String,
    pub outcome: Result<Option<Finding>>,
}

/// What a rule sees.
pub(crate) struct RuleInput<'a> {
    pub graph: &'a EntityGraph,
    pub as_of: NaiveDate,
}

/// A predicate over the entity graph.
pub(crate) trait Rule: Send + Sync {
    fn name(&self) -> &str;

    /// Entity type whose members this rule checks.
    fn entity_type(&self) -> EntityType {
        EntityType::Provider
    }

    /// Checks every entity of [`Rule::entity_type`] in the graph.
    fn check(&self, input: &RuleInput<'_>) -> Vec<EntityCheck>;
}

/// Runs `check` once per provider golden record.
pub(crate) fn per_provider<F>(input: &RuleInput<'_>, mut check: F) -> Vec<EntityCheck>
where
    F: FnMut(&GoldenRecord) -> Result<Option<Finding>>,
{
    input
        .graph
        .providers
        .iter()
        .map(|provider| EntityCheck {
            entity_id: provider.cluster_id.clone(),
            outcome: check(provider),
        })
        .collect()
}

/// Text value of a golden field; other value types are an evaluation error.
pub(crate) fn text_field<'a>(
    rule: &str,
    record: &'a GoldenRecord,
    field: &str,
) -> Result<Option<&'a str>> {
    match record.value(field) {
        None => Ok(None),
        Some(FieldValue::Text(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(GoldrecError::rule_failed(
            rule,
            &record.cluster_id,
            format!("field '{}' holds {:?}, expected text", field, other),
        )),
    }
}

/// Integer value of a golden field; numeric text is accepted.
pub(crate) fn integer_field(rule: &str, record: &GoldenRecord, field: &str) -> Result<Option<i64>> {
    match record.value(field) {
        None => Ok(None),
        Some(FieldValue::Integer(n)) => Ok(Some(*n)),
        Some(FieldValue::Text(s)) => s.trim().parse::<i64>().map(Some).map_err(|_| {
            GoldrecError::rule_failed(
                rule,
                &record.cluster_id,
                format!("field '{}' is not an integer: '{}'", field, s),
            )
        }),
        Some(other) => Err(GoldrecError::rule_failed(
            rule,
            &record.cluster_id,
            format!("field '{}' holds {:?}, expected an integer", field, other),
        )),
    }
}

/// Date value of a golden field; ISO `YYYY-MM-DD` text is accepted.
pub(crate) fn date_field(rule: &str, record: &GoldenRecord, field: &str) -> Result<Option<NaiveDate>> {
    match record.value(field) {
        None => Ok(None),
        Some(FieldValue::Date(d)) => Ok(Some(*d)),
        Some(FieldValue::Text(s)) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map(Some)
            .map_err(|e| {
                GoldrecError::rule_failed(
                    rule,
                    &record.cluster_id,
                    format!("field '{}' is not a date: {}", field, e),
                )
            }),
        Some(other) => Err(GoldrecError::rule_failed(
            rule,
            &record.cluster_id,
            format!("field '{}' holds {:?}, expected a date", field, other),
        )),
    }
}

/// Output of one engine run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Current failures, at most one per (rule, entity)
    pub findings: Vec<Finding>,
    /// Rule/entity pairs that could not be evaluated
    pub failures: Vec<RuleFailure>,
    /// Rule/entity pairs evaluated without error, failing or passing
    pub checked: BTreeSet<ViolationKey>,
    /// Names of the rules that ran
    pub rules_run: BTreeSet<String>,
    /// Entities present in the evaluated graph
    pub entities: BTreeSet<(EntityType, String)>,
    pub as_of: NaiveDate,
    pub evaluated_at: DateTime<Utc>,
}

impl Evaluation {
    /// Finding for a violation key, if the rule currently fails.
    pub fn finding(&self, key: &ViolationKey) -> Option<&Finding> {
        self.findings.iter().find(|f| &f.key() == key)
    }

    /// Whether the rule was evaluated for the entity and passed.
    pub fn passed(&self, key: &ViolationKey) -> bool {
        self.checked.contains(key) && self.finding(key).is_none()
    }

    /// Whether the rule could not be evaluated for the entity.
    pub fn failed(&self, key: &ViolationKey) -> bool {
        self.failures.iter().any(|f| {
            f.rule_name == key.rule_name
                && f.entity_type == key.entity_type
                && f.entity_id == key.entity_id
        })
    }

    /// Whether the entity was part of the evaluated graph.
    pub fn contains_entity(&self, entity_type: EntityType, entity_id: &str) -> bool {
        self.entities
            .contains(&(entity_type, entity_id.to_string()))
    }

    /// Findings counted per severity.
    pub fn severity_counts(&self) -> BTreeMap<Severity, usize> {
        let mut counts = BTreeMap::new();
        for finding in &self.findings {
            *counts.entry(finding.severity).or_insert(0) += 1;
        }
        counts
    }
}

/// Evaluates enabled rules over an entity graph.
pub struct RuleEngine {
    rules: Vec<Box<dyn Rule>>,
    as_of: Option<NaiveDate>,
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("rules", &self.rule_names())
            .field("as_of", &self.as_of)
            .finish()
    }
}

impl RuleEngine {
    /// Builds the enabled rules of a rule set.
    ///
    /// # Errors
    /// Returns a configuration error if the rule set is invalid.
    pub fn new(config: &RuleSetConfig) -> Result<Self> {
        config.validate()?;
        let rules = config
            .rules
            .iter()
            .filter(|definition| definition.enabled)
            .map(|definition| definition.kind.build(&definition.name))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules, as_of: None })
    }

    /// Engine with the default rule set.
    pub fn with_defaults() -> Result<Self> {
        Self::new(&RuleSetConfig::default())
    }

    /// Builder method to pin the reference date for time-relative rules.
    pub fn with_as_of(mut self, as_of: NaiveDate) -> Self {
        self.as_of = Some(as_of);
        self
    }

    /// Names of the enabled rules in evaluation order.
    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Evaluates golden records and affiliations without activity data.
    pub fn evaluate(&self, golden_records: &[GoldenRecord], affiliations: &[Affiliation]) -> Evaluation {
        let (providers, facilities): (Vec<_>, Vec<_>) = golden_records
            .iter()
            .filter(|g| g.active)
            .cloned()
            .partition(|g| g.entity_type == EntityType::Provider);
        let graph = EntityGraph {
            providers,
            facilities,
            affiliations: affiliations.to_vec(),
            ..EntityGraph::default()
        };
        self.evaluate_graph(&graph)
    }

    /// Evaluates every enabled rule over a graph snapshot.
    pub fn evaluate_graph(&self, graph: &EntityGraph) -> Evaluation {
        let evaluated_at = Utc::now();
        let as_of = self
            .as_of
            .or_else(|| graph.taken_at.map(|t| t.date_naive()))
            .unwrap_or_else(|| evaluated_at.date_naive());
        let input = RuleInput { graph, as_of };

        let entities: BTreeSet<(EntityType, String)> = graph
            .providers
            .iter()
            .chain(graph.facilities.iter())
            .map(|g| (g.entity_type, g.cluster_id.clone()))
            .collect();

        let mut findings = Vec::new();
        let mut failures = Vec::new();
        let mut checked = BTreeSet::new();
        let mut rules_run = BTreeSet::new();

        for rule in &self.rules {
            rules_run.insert(rule.name().to_string());
            let entity_type = rule.entity_type();
            for check in rule.check(&input) {
                match check.outcome {
                    Ok(finding) => {
                        checked.insert(ViolationKey {
                            rule_name: rule.name().to_string(),
                            entity_type,
                            entity_id: check.entity_id,
                        });
                        findings.extend(finding);
                    }
                    Err(e) => {
                        tracing::warn!(
                            rule = rule.name(),
                            entity = %check.entity_id,
                            "Rule evaluation failed, skipping entity: {}",
                            e
                        );
                        failures.push(RuleFailure {
                            rule_name: rule.name().to_string(),
                            entity_type,
                            entity_id: check.entity_id,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        findings.sort_by(|a, b| a.key().cmp(&b.key()));
        tracing::info!(
            rules = rules_run.len(),
            entities = entities.len(),
            findings = findings.len(),
            failures = failures.len(),
            "Rule evaluation complete"
        );

        Evaluation {
            findings,
            failures,
            checked,
            rules_run,
            entities,
            as_of,
            evaluated_at,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::models::{ResolutionRule, ResolvedField};

    /// Active provider golden record with the given text/integer/date fields.
    pub fn provider(id: &str, fields: &[(&str, FieldValue)]) -> GoldenRecord {
        GoldenRecord {
            cluster_id: id.to_string(),
            entity_type: EntityType::Provider,
            fields: fields
                .iter()
                .map(|(name, value)| {
                    (
                        (*name).to_string(),
                        ResolvedField {
                            value: Some(value.clone()),
                            winning_source: Some("A".to_string()),
                            winning_record: None,
                            rule: ResolutionRule::Unanimous,
                            conflict: false,
                            candidates: 1,
                        },
                    )
                })
                .collect(),
            source_records: Vec::new(),
            last_captured_at: None,
            version: 1,
            active: true,
            created_at: None,
            superseded_at: None,
        }
    }

    pub fn text(value: &str) -> FieldValue {
        FieldValue::Text(value.to_string())
    }

    pub fn affiliation(provider: &str, facility: &str, primary: bool) -> Affiliation {
        Affiliation {
            provider_id: provider.to_string(),
            facility_id: facility.to_string(),
            start_date: None,
            end_date: None,
            is_primary: primary,
            source: "A".to_string(),
        }
    }

    pub fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    pub fn graph(providers: Vec<GoldenRecord>, affiliations: Vec<Affiliation>) -> EntityGraph {
        EntityGraph {
            providers,
            affiliations,
            ..EntityGraph::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn engine() -> RuleEngine {
        RuleEngine::with_defaults().unwrap().with_as_of(as_of())
    }

    fn well_formed(id: &str, npi: &str) -> GoldenRecord {
        provider(
            id,
            &[
                ("npi", text(npi)),
                ("email", text(&format!("{}@clinic.org", id.replace(':', "")))),
                ("phone", text("(555) 201-3344")),
            ],
        )
    }

    #[test]
    fn test_default_rule_set() {
        let config = RuleSetConfig::default();
        assert_eq!(config.rules.len(), 6);
        assert!(config.validate().is_ok());
        assert_eq!(engine().rule_names()[0], "npi_format");
    }

    #[test]
    fn test_duplicate_rule_names_rejected() {
        let config = RuleSetConfig::default().with_rule(RuleDefinition::new(
            "npi_format",
            RuleKind::NpiDuplicate(NpiDuplicateParams::default()),
        ));
        // with_rule replaces by name
        assert!(config.validate().is_ok());

        let mut config = RuleSetConfig::default();
        config.rules.push(config.rules[0].clone());
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::DuplicateRule { .. })
        ));
    }

    #[test]
    fn test_rule_definitions_deserialize_with_defaults() {
        let config: RuleSetConfig = serde_json::from_str(
            r#"{"rules": [
                {"name": "npi_format", "kind": {"type": "npi_format"}},
                {"name": "too_many", "enabled": false,
                 "kind": {"type": "affiliation_cardinality", "max_affiliations": 3}}
            ]}"#,
        )
        .unwrap();

        assert_eq!(config.rules.len(), 2);
        assert!(config.rules[0].enabled);
        assert!(!config.rules[1].enabled);
        match &config.rules[1].kind {
            RuleKind::AffiliationCardinality(p) => assert_eq!(p.max_affiliations, 3),
            other => panic!("unexpected kind {:?}", other),
        }
        let engine = RuleEngine::new(&config).unwrap();
        assert_eq!(engine.rule_names(), vec!["npi_format"]);
    }

    #[test]
    fn test_scenario_three_primaries_and_short_npi() {
        let provider = well_formed("prov:rec:A:1", "12345");
        let affiliations = vec![
            affiliation("prov:rec:A:1", "fac:id:F1", true),
            affiliation("prov:rec:A:1", "fac:id:F2", true),
            affiliation("prov:rec:A:1", "fac:id:F3", true),
        ];

        let evaluation = engine().evaluate(&[provider], &affiliations);

        let found: Vec<(&str, Severity)> = evaluation
            .findings
            .iter()
            .map(|f| (f.rule_name.as_str(), f.severity))
            .collect();
        assert_eq!(
            found,
            vec![
                ("affiliation_cardinality", Severity::High),
                ("npi_format", Severity::High),
            ]
        );
        assert!(evaluation.failures.is_empty());
    }

    #[test]
    fn test_clean_provider_has_no_findings() {
        let provider = well_formed("prov:npi:1234567893", "1234567893");
        let affiliations = vec![affiliation("prov:npi:1234567893", "fac:id:F1", true)];

        let evaluation = engine().evaluate(&[provider], &affiliations);
        assert!(evaluation.findings.is_empty());
        assert_eq!(evaluation.checked.len(), 6);
    }

    #[test]
    fn test_inactive_golden_records_are_not_evaluated() {
        let mut retired = well_formed("prov:rec:A:1", "bad");
        retired.active = false;

        let evaluation = engine().evaluate(&[retired], &[]);
        assert!(evaluation.findings.is_empty());
        assert!(evaluation.entities.is_empty());
    }

    #[test]
    fn test_malformed_field_isolated_to_rule_and_entity() {
        let mut broken = well_formed("prov:rec:A:1", "1234567893");
        broken
            .fields
            .get_mut("npi")
            .unwrap()
            .value = Some(FieldValue::Integer(1234567893));
        let affiliations = vec![affiliation("prov:rec:A:1", "fac:id:F1", true)];

        let evaluation = engine().evaluate(&[broken], &affiliations);

        assert_eq!(evaluation.failures.len(), 2);
        assert!(
            evaluation
                .failures
                .iter()
                .all(|f| f.rule_name.starts_with("npi_"))
        );
        let key = ViolationKey {
            rule_name: "affiliation_cardinality".to_string(),
            entity_type: EntityType::Provider,
            entity_id: "prov:rec:A:1".to_string(),
        };
        assert!(evaluation.passed(&key));
    }

    #[test]
    fn test_disabled_rule_is_skipped() {
        let config = RuleSetConfig::default().with_rule_enabled("npi_format", false);
        let engine = RuleEngine::new(&config).unwrap().with_as_of(as_of());
        let provider = well_formed("prov:rec:A:1", "12345");
        let affiliations = vec![affiliation("prov:rec:A:1", "fac:id:F1", true)];

        let evaluation = engine.evaluate(&[provider], &affiliations);
        assert!(evaluation.findings.is_empty());
        assert!(!evaluation.rules_run.contains("npi_format"));
    }

    #[test]
    fn test_fold_issues_keeps_first_most_severe() {
        let finding = fold_issues(
            "r",
            EntityType::Provider,
            "p",
            vec![
                Issue::new(Severity::Medium, "first").detected("1"),
                Issue::new(Severity::High, "second").detected("2"),
                Issue::new(Severity::High, "third").detected("3"),
            ],
        )
        .unwrap();

        assert_eq!(finding.severity, Severity::High);
        assert_eq!(finding.detected_value.as_deref(), Some("2"));
        assert_eq!(finding.description, "first; second; third");
        assert!(fold_issues("r", EntityType::Provider, "p", vec![]).is_none());
    }
}
