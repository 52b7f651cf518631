//! Affiliation cardinality rule.
//!
//! Every provider needs at least one active affiliation, exactly one of them
//! primary, and no more than a configured number of affiliations overall.

use serde::{Deserialize, Serialize};

use super::{EntityCheck, Issue, Rule, RuleInput, fold_issues, most_severe, per_provider};
use crate::models::{EntityType, Severity};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AffiliationCardinalityParams {
    /// Upper bound on affiliations per provider, ended ones included
    pub max_affiliations: usize,
    pub no_active: Severity,
    pub no_primary: Severity,
    pub multiple_primary: Severity,
    pub too_many: Severity,
}

impl Default for AffiliationCardinalityParams {
    fn default() -> Self {
        Self {
            max_affiliations: 10,
            no_active: Severity::Critical,
            no_primary: Severity::Critical,
            multiple_primary: Severity::High,
            too_many: Severity::Medium,
        }
    }
}

impl AffiliationCardinalityParams {
    pub(crate) fn problem(&self) -> Option<String> {
        (self.max_affiliations == 0).then(|| "max_affiliations must be at least 1".to_string())
    }
}

pub(crate) struct AffiliationCardinalityRule {
    name: String,
    params: AffiliationCardinalityParams,
}

impl AffiliationCardinalityRule {
    pub(crate) fn new(name: String, params: AffiliationCardinalityParams) -> Self {
        Self { name, params }
    }
}

impl Rule for AffiliationCardinalityRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, input: &RuleInput<'_>) -> Vec<EntityCheck> {
        per_provider(input, |provider| {
            let mut total = 0usize;
            let mut active = 0usize;
            let mut primary = 0usize;
            for affiliation in input.graph.affiliations_of(&provider.cluster_id) {
                total += 1;
                if affiliation.is_active() {
                    active += 1;
                    if affiliation.is_primary {
                        primary += 1;
                    }
                }
            }
            let counts = format!("active={} primary={} total={}", active, primary, total);

            let mut issues = Vec::new();
            if active == 0 {
                issues.push(
                    Issue::new(self.params.no_active, "provider has no active affiliation")
                        .detected(&counts)
                        .expected("at least one active affiliation"),
                );
            } else if primary == 0 {
                issues.push(
                    Issue::new(self.params.no_primary, "provider has no primary affiliation")
                        .detected(&counts)
                        .expected("exactly one active primary affiliation"),
                );
            } else if primary > 1 {
                issues.push(
                    Issue::new(
                        self.params.multiple_primary,
                        format!("provider has {} active primary affiliations", primary),
                    )
                    .detected(&counts)
                    .expected("exactly one active primary affiliation"),
                );
            }
            if total > self.params.max_affiliations {
                issues.push(
                    Issue::new(
                        self.params.too_many,
                        format!(
                            "provider has {} affiliations, more than {}",
                            total, self.params.max_affiliations
                        ),
                    )
                    .detected(&counts)
                    .expected(format!("at most {} affiliations", self.params.max_affiliations)),
                );
            }

            // One violation per provider, carrying the most severe case
            Ok(fold_issues(
                &self.name,
                EntityType::Provider,
                &provider.cluster_id,
                most_severe(issues).into_iter().collect(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Affiliation;
    use crate::rules::Finding;
    use crate::rules::test_support::*;
    use chrono::NaiveDate;

    fn evaluate(affiliations: Vec<Affiliation>) -> Option<Finding> {
        evaluate_with(AffiliationCardinalityParams::default(), affiliations)
    }

    fn evaluate_with(
        params: AffiliationCardinalityParams,
        affiliations: Vec<Affiliation>,
    ) -> Option<Finding> {
        let rule = AffiliationCardinalityRule::new("affiliation_cardinality".to_string(), params);
        let graph = graph(vec![provider("p1", &[])], affiliations);
        let mut checks = rule.check(&RuleInput {
            graph: &graph,
            as_of: as_of(),
        });
        checks.remove(0).outcome.unwrap()
    }

    fn ended(mut affiliation: Affiliation) -> Affiliation {
        affiliation.end_date = NaiveDate::from_ymd_opt(2023, 12, 31);
        affiliation
    }

    #[test]
    fn test_single_primary_passes() {
        let finding = evaluate(vec![
            affiliation("p1", "f1", true),
            affiliation("p1", "f2", false),
        ]);
        assert!(finding.is_none());
    }

    #[test]
    fn test_no_affiliations_is_critical() {
        let finding = evaluate(vec![]).unwrap();
        assert_eq!(finding.severity, Severity::Critical);
        assert_eq!(finding.description, "provider has no active affiliation");
    }

    #[test]
    fn test_only_ended_affiliations_is_critical() {
        let finding = evaluate(vec![ended(affiliation("p1", "f1", true))]).unwrap();
        assert_eq!(finding.severity, Severity::Critical);
        assert_eq!(
            finding.detected_value.as_deref(),
            Some("active=0 primary=0 total=1")
        );
    }

    #[test]
    fn test_no_primary_is_critical() {
        let finding = evaluate(vec![
            affiliation("p1", "f1", false),
            ended(affiliation("p1", "f2", true)),
        ])
        .unwrap();
        assert_eq!(finding.severity, Severity::Critical);
        assert_eq!(finding.description, "provider has no primary affiliation");
    }

    #[test]
    fn test_three_primaries_is_high() {
        let finding = evaluate(vec![
            affiliation("p1", "f1", true),
            affiliation("p1", "f2", true),
            affiliation("p1", "f3", true),
        ])
        .unwrap();
        assert_eq!(finding.severity, Severity::High);
        assert_eq!(finding.description, "provider has 3 active primary affiliations");
    }

    #[test]
    fn test_too_many_is_medium() {
        let mut affiliations = vec![affiliation("p1", "f0", true)];
        for i in 1..=3 {
            affiliations.push(affiliation("p1", &format!("f{}", i), false));
        }
        let params = AffiliationCardinalityParams {
            max_affiliations: 3,
            ..AffiliationCardinalityParams::default()
        };

        let finding = evaluate_with(params, affiliations).unwrap();
        assert_eq!(finding.severity, Severity::Medium);
    }

    #[test]
    fn test_most_severe_case_wins() {
        let mut affiliations = vec![
            affiliation("p1", "f0", true),
            affiliation("p1", "f1", true),
        ];
        for i in 2..12 {
            affiliations.push(affiliation("p1", &format!("f{}", i), false));
        }

        let finding = evaluate(affiliations).unwrap();
        assert_eq!(finding.severity, Severity::High);
        assert_eq!(finding.description, "provider has 2 active primary affiliations");
    }

    #[test]
    fn test_other_providers_affiliations_ignored() {
        let finding = evaluate(vec![
            affiliation("p1", "f1", true),
            affiliation("p2", "f1", true),
            affiliation("p2", "f2", true),
        ]);
        assert!(finding.is_none());
    }
}
