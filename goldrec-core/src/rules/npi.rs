//! NPI format and duplicate rules.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{EntityCheck, Issue, Rule, RuleInput, fold_issues, per_provider, text_field};
use crate::Result;
use crate::matching::normalize::{normalize_npi, strip_npi_separators};
use crate::models::{EntityType, Severity, provider_fields};

/// Severities for the NPI format rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NpiFormatParams {
    /// No NPI at all
    pub missing: Severity,
    /// Wrong length or non-numeric
    pub malformed: Severity,
}

impl Default for NpiFormatParams {
    fn default() -> Self {
        Self {
            missing: Severity::Critical,
            malformed: Severity::High,
        }
    }
}

pub(crate) struct NpiFormatRule {
    name: String,
    params: NpiFormatParams,
}

impl NpiFormatRule {
    pub(crate) fn new(name: String, params: NpiFormatParams) -> Self {
        Self { name, params }
    }
}

impl Rule for NpiFormatRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, input: &RuleInput<'_>) -> Vec<EntityCheck> {
        per_provider(input, |provider| {
            let issue = match text_field(&self.name, provider, provider_fields::NPI)? {
                None => Some(
                    Issue::new(self.params.missing, "provider has no NPI")
                        .expected("10-digit NPI"),
                ),
                Some(npi) if normalize_npi(npi).is_none() => {
                    let digits = strip_npi_separators(npi);
                    let reason = if digits.chars().all(|c| c.is_ascii_digit()) {
                        format!("NPI has {} digits", digits.chars().count())
                    } else {
                        "NPI contains non-numeric characters".to_string()
                    };
                    Some(
                        Issue::new(self.params.malformed, reason)
                            .detected(npi)
                            .expected("10-digit NPI"),
                    )
                }
                Some(_) => None,
            };
            Ok(fold_issues(
                &self.name,
                EntityType::Provider,
                &provider.cluster_id,
                issue.into_iter().collect(),
            ))
        })
    }
}

/// Severity for NPIs shared by distinct golden records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NpiDuplicateParams {
    pub severity: Severity,
}

impl Default for NpiDuplicateParams {
    fn default() -> Self {
        Self {
            severity: Severity::High,
        }
    }
}

pub(crate) struct NpiDuplicateRule {
    name: String,
    params: NpiDuplicateParams,
}

impl NpiDuplicateRule {
    pub(crate) fn new(name: String, params: NpiDuplicateParams) -> Self {
        Self { name, params }
    }
}

impl Rule for NpiDuplicateRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, input: &RuleInput<'_>) -> Vec<EntityCheck> {
        // First pass: valid NPIs per provider. Type errors surface per entity
        // in the second pass.
        let npis: Vec<(&str, Result<Option<String>>)> = input
            .graph
            .providers
            .iter()
            .map(|p| {
                let npi = text_field(&self.name, p, provider_fields::NPI)
                    .map(|npi| npi.and_then(normalize_npi));
                (p.cluster_id.as_str(), npi)
            })
            .collect();

        let mut holders: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        for (id, npi) in &npis {
            if let Ok(Some(npi)) = npi {
                holders.entry(npi.clone()).or_default().push(*id);
            }
        }

        npis.into_iter()
            .map(|(id, npi)| {
                let outcome = npi.map(|npi| {
                    let npi = npi?;
                    let others: Vec<&str> = holders
                        .get(&npi)
                        .map(|ids| ids.iter().copied().filter(|o| *o != id).collect())
                        .unwrap_or_default();
                    let issue = (!others.is_empty()).then(|| {
                        Issue::new(
                            self.params.severity,
                            format!("NPI also used by {}", others.join(", ")),
                        )
                        .detected(&npi)
                        .expected("NPI unique to one provider")
                    });
                    fold_issues(&self.name, EntityType::Provider, id, issue.into_iter().collect())
                });
                EntityCheck {
                    entity_id: id.to_string(),
                    outcome,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldValue, Severity};
    use crate::rules::test_support::*;

    fn run(rule: &dyn Rule, providers: Vec<crate::models::GoldenRecord>) -> Vec<EntityCheck> {
        let graph = graph(providers, vec![]);
        rule.check(&RuleInput {
            graph: &graph,
            as_of: as_of(),
        })
    }

    fn format_rule() -> NpiFormatRule {
        NpiFormatRule::new("npi_format".to_string(), NpiFormatParams::default())
    }

    fn severity_of(check: &EntityCheck) -> Option<Severity> {
        check
            .outcome
            .as_ref()
            .ok()
            .and_then(|f| f.as_ref())
            .map(|f| f.severity)
    }

    #[test]
    fn test_missing_npi_is_critical() {
        let checks = run(&format_rule(), vec![provider("p1", &[])]);
        assert_eq!(severity_of(&checks[0]), Some(Severity::Critical));
    }

    #[test]
    fn test_short_and_non_numeric_npi_are_high() {
        let checks = run(
            &format_rule(),
            vec![
                provider("p1", &[("npi", text("12345"))]),
                provider("p2", &[("npi", text("12345abcde"))]),
            ],
        );

        let first = checks[0].outcome.as_ref().unwrap().as_ref().unwrap();
        assert_eq!(first.severity, Severity::High);
        assert_eq!(first.description, "NPI has 5 digits");
        assert_eq!(first.detected_value.as_deref(), Some("12345"));

        let second = checks[1].outcome.as_ref().unwrap().as_ref().unwrap();
        assert_eq!(second.description, "NPI contains non-numeric characters");
    }

    #[test]
    fn test_separated_npi_passes() {
        let checks = run(&format_rule(), vec![provider("p1", &[("npi", text("123-456-7890"))])]);
        assert_eq!(severity_of(&checks[0]), None);
        assert!(checks[0].outcome.is_ok());
    }

    #[test]
    fn test_wrong_type_is_evaluation_failure() {
        let checks = run(
            &format_rule(),
            vec![provider("p1", &[("npi", FieldValue::Integer(42))])],
        );
        assert!(checks[0].outcome.is_err());
    }

    #[test]
    fn test_duplicate_npi_flags_every_holder() {
        let rule = NpiDuplicateRule::new("npi_duplicate".to_string(), NpiDuplicateParams::default());
        let checks = run(
            &rule,
            vec![
                provider("p1", &[("npi", text("1234567890"))]),
                provider("p2", &[("npi", text("1234-567-890"))]),
                provider("p3", &[("npi", text("1234567891"))]),
                provider("p4", &[]),
            ],
        );

        assert_eq!(severity_of(&checks[0]), Some(Severity::High));
        assert_eq!(severity_of(&checks[1]), Some(Severity::High));
        assert_eq!(severity_of(&checks[2]), None);
        assert_eq!(severity_of(&checks[3]), None);

        let finding = checks[0].outcome.as_ref().unwrap().as_ref().unwrap();
        assert_eq!(finding.description, "NPI also used by p2");
    }
}
