//! Temporal consistency rule.
//!
//! Checks birth year, graduation year, years in practice and license expiry
//! against each other and against the evaluation date.

use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use super::{
    EntityCheck, Issue, Rule, RuleInput, date_field, fold_issues, integer_field, per_provider,
};
use crate::models::{EntityType, Severity, provider_fields};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalConsistencyParams {
    /// Reference date; the evaluation date when unset
    pub as_of: Option<NaiveDate>,
    pub min_age: i64,
    pub max_age: i64,
    pub min_graduation_age: i64,
    pub max_graduation_age: i64,
    pub max_years_in_practice: i64,
    /// License expiry further ahead than this is implausible
    pub max_license_horizon_years: u32,
    pub birth_year_severity: Severity,
    pub graduation_severity: Severity,
    pub practice_severity: Severity,
    pub expired_license_severity: Severity,
    pub license_horizon_severity: Severity,
}

impl Default for TemporalConsistencyParams {
    fn default() -> Self {
        Self {
            as_of: None,
            min_age: 21,
            max_age: 100,
            min_graduation_age: 22,
            max_graduation_age: 45,
            max_years_in_practice: 70,
            max_license_horizon_years: 10,
            birth_year_severity: Severity::High,
            graduation_severity: Severity::Medium,
            practice_severity: Severity::Medium,
            expired_license_severity: Severity::High,
            license_horizon_severity: Severity::Medium,
        }
    }
}

impl TemporalConsistencyParams {
    pub(crate) fn problem(&self) -> Option<String> {
        if self.min_age > self.max_age {
            Some("min_age must not exceed max_age".to_string())
        } else if self.min_graduation_age > self.max_graduation_age {
            Some("min_graduation_age must not exceed max_graduation_age".to_string())
        } else if self.max_years_in_practice < 0 {
            Some("max_years_in_practice must not be negative".to_string())
        } else {
            None
        }
    }
}

pub(crate) struct TemporalConsistencyRule {
    name: String,
    params: TemporalConsistencyParams,
}

impl TemporalConsistencyRule {
    pub(crate) fn new(name: String, params: TemporalConsistencyParams) -> Self {
        Self { name, params }
    }
}

impl Rule for TemporalConsistencyRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, input: &RuleInput<'_>) -> Vec<EntityCheck> {
        use provider_fields as f;
        let p = &self.params;
        let as_of = p.as_of.unwrap_or(input.as_of);
        let current_year = i64::from(as_of.year());

        per_provider(input, |provider| {
            let birth_year = integer_field(&self.name, provider, f::BIRTH_YEAR)?;
            let graduation_year = integer_field(&self.name, provider, f::GRADUATION_YEAR)?;
            let years_in_practice = integer_field(&self.name, provider, f::YEARS_IN_PRACTICE)?;
            let license_expiry = date_field(&self.name, provider, f::LICENSE_EXPIRY)?;

            let mut issues = Vec::new();

            if let Some(birth) = birth_year {
                let earliest = current_year - p.max_age;
                let latest = current_year - p.min_age;
                if birth < earliest || birth > latest {
                    issues.push(
                        Issue::new(p.birth_year_severity, "birth year outside plausible range")
                            .detected(birth)
                            .expected(format!("{}-{}", earliest, latest)),
                    );
                }
            }

            if let (Some(birth), Some(graduation)) = (birth_year, graduation_year) {
                let age = graduation - birth;
                if age < p.min_graduation_age || age > p.max_graduation_age {
                    issues.push(
                        Issue::new(
                            p.graduation_severity,
                            format!("graduated at age {}", age),
                        )
                        .detected(graduation)
                        .expected(format!(
                            "{}-{}",
                            birth + p.min_graduation_age,
                            birth + p.max_graduation_age
                        )),
                    );
                }
            }

            if let Some(years) = years_in_practice
                && (years < 0 || years > p.max_years_in_practice)
            {
                issues.push(
                    Issue::new(p.practice_severity, "implausible years in practice")
                        .detected(years)
                        .expected(format!("0-{}", p.max_years_in_practice)),
                );
            }

            if let Some(expiry) = license_expiry {
                let horizon = as_of.checked_add_months(Months::new(12 * p.max_license_horizon_years));
                if expiry < as_of {
                    issues.push(
                        Issue::new(p.expired_license_severity, "license expired")
                            .detected(expiry)
                            .expected(format!("on or after {}", as_of)),
                    );
                } else if let Some(horizon) = horizon
                    && expiry > horizon
                {
                    issues.push(
                        Issue::new(
                            p.license_horizon_severity,
                            "license expiry implausibly far in the future",
                        )
                        .detected(expiry)
                        .expected(format!("on or before {}", horizon)),
                    );
                }
            }

            Ok(fold_issues(
                &self.name,
                EntityType::Provider,
                &provider.cluster_id,
                issues,
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldValue, GoldenRecord};
    use crate::rules::Finding;
    use crate::rules::test_support::*;

    fn evaluate(record: GoldenRecord) -> crate::Result<Option<Finding>> {
        let rule = TemporalConsistencyRule::new(
            "temporal_consistency".to_string(),
            TemporalConsistencyParams::default(),
        );
        let graph = graph(vec![record], vec![]);
        let mut checks = rule.check(&RuleInput {
            graph: &graph,
            as_of: as_of(),
        });
        checks.remove(0).outcome
    }

    fn date(y: i32, m: u32, d: u32) -> FieldValue {
        FieldValue::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    #[test]
    fn test_plausible_record_passes() {
        let record = provider(
            "p1",
            &[
                ("birth_year", FieldValue::Integer(1975)),
                ("graduation_year", FieldValue::Integer(2001)),
                ("years_in_practice", FieldValue::Integer(20)),
                ("license_expiry", date(2026, 3, 31)),
            ],
        );
        assert_eq!(evaluate(record).unwrap(), None);
    }

    #[test]
    fn test_missing_fields_pass() {
        assert_eq!(evaluate(provider("p1", &[])).unwrap(), None);
    }

    #[test]
    fn test_birth_year_window() {
        // as_of 2024: plausible birth years are 1924-2003
        let too_young = provider("p1", &[("birth_year", FieldValue::Integer(2004))]);
        let finding = evaluate(too_young).unwrap().unwrap();
        assert_eq!(finding.severity, Severity::High);
        assert_eq!(finding.expected_value.as_deref(), Some("1924-2003"));

        let edge = provider("p1", &[("birth_year", FieldValue::Integer(1924))]);
        assert_eq!(evaluate(edge).unwrap(), None);
    }

    #[test]
    fn test_graduation_too_young() {
        let record = provider(
            "p1",
            &[
                ("birth_year", FieldValue::Integer(1980)),
                ("graduation_year", FieldValue::Integer(1995)),
            ],
        );
        let finding = evaluate(record).unwrap().unwrap();
        assert_eq!(finding.severity, Severity::Medium);
        assert_eq!(finding.description, "graduated at age 15");
    }

    #[test]
    fn test_negative_years_in_practice() {
        let record = provider("p1", &[("years_in_practice", FieldValue::Integer(-2))]);
        let finding = evaluate(record).unwrap().unwrap();
        assert_eq!(finding.severity, Severity::Medium);
        assert_eq!(finding.detected_value.as_deref(), Some("-2"));
    }

    #[test]
    fn test_expired_license_is_high() {
        let record = provider("p1", &[("license_expiry", date(2024, 5, 31))]);
        let finding = evaluate(record).unwrap().unwrap();
        assert_eq!(finding.severity, Severity::High);
        assert_eq!(finding.description, "license expired");
    }

    #[test]
    fn test_far_future_license_is_medium() {
        let record = provider("p1", &[("license_expiry", date(2034, 6, 2))]);
        let finding = evaluate(record).unwrap().unwrap();
        assert_eq!(finding.severity, Severity::Medium);

        let at_horizon = provider("p1", &[("license_expiry", date(2034, 6, 1))]);
        assert_eq!(evaluate(at_horizon).unwrap(), None);
    }

    #[test]
    fn test_multiple_issues_fold_into_one_finding() {
        let record = provider(
            "p1",
            &[
                ("years_in_practice", FieldValue::Integer(90)),
                ("license_expiry", date(2020, 1, 1)),
            ],
        );
        let finding = evaluate(record).unwrap().unwrap();
        assert_eq!(finding.severity, Severity::High);
        assert_eq!(
            finding.description,
            "implausible years in practice; license expired"
        );
    }

    #[test]
    fn test_text_license_expiry_is_parsed_or_fails() {
        let parsed = provider("p1", &[("license_expiry", text("2025-01-01"))]);
        assert_eq!(evaluate(parsed).unwrap(), None);

        let garbage = provider("p1", &[("license_expiry", text("next spring"))]);
        assert!(evaluate(garbage).is_err());
    }

    #[test]
    fn test_params_problem() {
        let params = TemporalConsistencyParams {
            min_age: 50,
            max_age: 40,
            ..TemporalConsistencyParams::default()
        };
        assert!(params.problem().is_some());
        assert!(TemporalConsistencyParams::default().problem().is_none());
    }
}
