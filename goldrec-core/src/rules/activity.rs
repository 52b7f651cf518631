//! Activity anomaly rule.
//!
//! Flags a provider whose latest period count sits more than `k` population
//! standard deviations above the mean of the preceding window. Over a flat
//! window any count above the mean (plus `min_delta`) is anomalous.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;

use super::{EntityCheck, Issue, Rule, RuleInput, fold_issues, per_provider};
use crate::GoldrecError;
use crate::models::{EntityType, Severity};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityAnomalyParams {
    /// Number of prior periods in the rolling window
    pub window: usize,
    /// Standard deviations above the mean that count as anomalous
    pub k: f64,
    /// Prior periods required before the rule judges a provider
    pub min_history: usize,
    /// Smallest absolute rise over the mean that can be flagged
    pub min_delta: f64,
    pub severity: Severity,
}

impl Default for ActivityAnomalyParams {
    fn default() -> Self {
        Self {
            window: 6,
            k: 3.0,
            min_history: 3,
            min_delta: 0.0,
            severity: Severity::Medium,
        }
    }
}

impl ActivityAnomalyParams {
    pub(crate) fn problem(&self) -> Option<String> {
        if self.window == 0 {
            Some("window must be at least 1".to_string())
        } else if !(self.k.is_finite() && self.k > 0.0) {
            Some(format!("k must be a positive number, got {}", self.k))
        } else if !(self.min_delta.is_finite() && self.min_delta >= 0.0) {
            Some(format!("min_delta must be zero or more, got {}", self.min_delta))
        } else if self.min_history > self.window {
            Some("min_history must not exceed window".to_string())
        } else {
            None
        }
    }
}

/// Calculates mean and population standard deviation for a set of values.
///
/// Uses population standard deviation (divides by n, not n-1). Empty input
/// yields `(0.0, 0.0)`.
pub fn population_statistics(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;

    (mean, variance.sqrt())
}

pub(crate) struct ActivityAnomalyRule {
    name: String,
    params: ActivityAnomalyParams,
}

impl ActivityAnomalyRule {
    pub(crate) fn new(name: String, params: ActivityAnomalyParams) -> Self {
        Self { name, params }
    }
}

impl Rule for ActivityAnomalyRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, input: &RuleInput<'_>) -> Vec<EntityCheck> {
        let mut series: HashMap<&str, Vec<(NaiveDate, u64)>> = HashMap::new();
        for count in &input.graph.activity {
            series
                .entry(count.entity_id.as_str())
                .or_default()
                .push((count.period, count.count));
        }

        per_provider(input, |provider| {
            let Some(points) = series.get(provider.cluster_id.as_str()) else {
                return Ok(None);
            };

            let mut by_period: BTreeMap<NaiveDate, u64> = BTreeMap::new();
            for (period, count) in points {
                if by_period.insert(*period, *count).is_some() {
                    return Err(GoldrecError::rule_failed(
                        &self.name,
                        &provider.cluster_id,
                        format!("activity reported twice for period {}", period),
                    ));
                }
            }

            let Some((latest_period, latest)) = by_period.iter().next_back() else {
                return Ok(None);
            };
            let prior: Vec<f64> = by_period
                .values()
                .rev()
                .skip(1)
                .take(self.params.window)
                .map(|c| *c as f64)
                .collect();
            if prior.len() < self.params.min_history.max(1) {
                return Ok(None);
            }

            let (mean, std_dev) = population_statistics(&prior);
            let limit = mean + (self.params.k * std_dev).max(self.params.min_delta);
            let latest = *latest as f64;
            let issue = (latest > limit).then(|| {
                let message = if std_dev > 0.0 {
                    format!(
                        "activity for {} is {:.1} standard deviations above the {}-period mean",
                        latest_period,
                        (latest - mean) / std_dev,
                        prior.len()
                    )
                } else {
                    format!(
                        "activity for {} rose from a flat {:.1} over {} periods",
                        latest_period,
                        mean,
                        prior.len()
                    )
                };
                Issue::new(self.params.severity, message)
                    .detected(latest)
                    .expected(format!("at most {:.1}", limit))
            });

            Ok(fold_issues(
                &self.name,
                EntityType::Provider,
                &provider.cluster_id,
                issue.into_iter().collect(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActivityCount, EntityGraph};
    use crate::rules::Finding;
    use crate::rules::test_support::*;

    fn counts(id: &str, values: &[u64]) -> Vec<ActivityCount> {
        values
            .iter()
            .enumerate()
            .map(|(i, count)| ActivityCount {
                entity_id: id.to_string(),
                period: NaiveDate::from_ymd_opt(2024, 1 + i as u32, 1).unwrap(),
                count: *count,
            })
            .collect()
    }

    fn evaluate(activity: Vec<ActivityCount>) -> crate::Result<Option<Finding>> {
        evaluate_with(activity, ActivityAnomalyParams::default())
    }

    fn evaluate_with(
        activity: Vec<ActivityCount>,
        params: ActivityAnomalyParams,
    ) -> crate::Result<Option<Finding>> {
        let rule = ActivityAnomalyRule::new("activity_anomaly".to_string(), params);
        let graph = EntityGraph {
            providers: vec![provider("p1", &[])],
            activity,
            ..EntityGraph::default()
        };
        let mut checks = rule.check(&RuleInput {
            graph: &graph,
            as_of: as_of(),
        });
        checks.remove(0).outcome
    }

    #[test]
    fn test_population_statistics() {
        let (mean, std_dev) = population_statistics(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((mean - 5.0).abs() < 1e-9);
        assert!((std_dev - 2.0).abs() < 1e-9);
        assert_eq!(population_statistics(&[]), (0.0, 0.0));
    }

    #[test]
    fn test_spike_is_flagged() {
        let finding = evaluate(counts("p1", &[10, 12, 11, 9, 10, 12, 80]))
            .unwrap()
            .unwrap();
        assert_eq!(finding.severity, Severity::Medium);
        assert_eq!(finding.detected_value.as_deref(), Some("80"));
    }

    #[test]
    fn test_normal_variation_passes() {
        assert_eq!(evaluate(counts("p1", &[10, 12, 11, 9, 10, 12, 13])).unwrap(), None);
    }

    #[test]
    fn test_window_only_uses_recent_periods() {
        // the early 500 would inflate the spread if it were in the window
        let history = [500, 10, 12, 11, 9, 10, 12, 40];
        assert!(evaluate(counts("p1", &history)).unwrap().is_some());
    }

    #[test]
    fn test_short_history_passes() {
        assert_eq!(evaluate(counts("p1", &[10, 11, 90])).unwrap(), None);
        assert_eq!(evaluate(vec![]).unwrap(), None);
    }

    #[test]
    fn test_rise_over_flat_history_is_flagged() {
        let finding = evaluate(counts("p1", &[5, 5, 5, 5, 500])).unwrap().unwrap();
        assert_eq!(finding.detected_value.as_deref(), Some("500"));
        assert_eq!(finding.expected_value.as_deref(), Some("at most 5.0"));

        assert_eq!(evaluate(counts("p1", &[5, 5, 5, 5, 5])).unwrap(), None);
        assert_eq!(evaluate(counts("p1", &[5, 5, 5, 5, 2])).unwrap(), None);
    }

    #[test]
    fn test_min_delta_damps_small_rises() {
        let params = ActivityAnomalyParams {
            min_delta: 10.0,
            ..ActivityAnomalyParams::default()
        };
        assert_eq!(
            evaluate_with(counts("p1", &[5, 5, 5, 5, 12]), params.clone()).unwrap(),
            None
        );
        assert!(
            evaluate_with(counts("p1", &[5, 5, 5, 5, 16]), params)
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_duplicate_period_fails_evaluation() {
        let mut activity = counts("p1", &[1, 2, 3]);
        activity.push(activity[0].clone());
        assert!(evaluate(activity).is_err());
    }

    #[test]
    fn test_params_problem() {
        let params = ActivityAnomalyParams {
            k: 0.0,
            ..ActivityAnomalyParams::default()
        };
        assert!(params.problem().is_some());
        let params = ActivityAnomalyParams {
            min_delta: -1.0,
            ..ActivityAnomalyParams::default()
        };
        assert!(params.problem().is_some());
    }
}
