//! Trend analysis over the stored quality series.

use serde::{Deserialize, Serialize};

use super::config::TrendConfig;
use super::models::{QualityDimension, QualityMetric};

/// Direction of the latest score relative to its baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Improving,
    Declining,
    Stable,
}

/// Summary of how one score moved over recent batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityTrend {
    /// `None` for the aggregate score
    pub dimension: Option<QualityDimension>,
    pub latest: f64,
    pub previous: Option<f64>,
    /// `latest - previous`, zero without a previous point
    pub delta: f64,
    /// Mean of up to `window` points before the latest
    pub moving_average: Option<f64>,
    pub direction: TrendDirection,
    /// Points considered, latest included
    pub points: usize,
}

/// Trend of the aggregate score.
///
/// `history` must be in measurement order, oldest first. Returns `None` for
/// an empty history.
pub fn analyze_trend(history: &[QualityMetric], config: &TrendConfig) -> Option<QualityTrend> {
    let values: Vec<f64> = history.iter().map(|m| m.aggregate).collect();
    trend_of(None, &values, config)
}

/// Trend of one dimension's score.
pub fn analyze_dimension_trend(
    history: &[QualityMetric],
    dimension: QualityDimension,
    config: &TrendConfig,
) -> Option<QualityTrend> {
    let values: Vec<f64> = history.iter().map(|m| m.scores.get(dimension)).collect();
    trend_of(Some(dimension), &values, config)
}

fn trend_of(
    dimension: Option<QualityDimension>,
    values: &[f64],
    config: &TrendConfig,
) -> Option<QualityTrend> {
    let (&latest, earlier) = values.split_last()?;
    let previous = earlier.last().copied();

    let window = config.window.max(1);
    let baseline = &earlier[earlier.len().saturating_sub(window)..];
    let moving_average = if baseline.is_empty() {
        None
    } else {
        Some(baseline.iter().sum::<f64>() / baseline.len() as f64)
    };

    let direction = match moving_average {
        Some(avg) if latest - avg > config.tolerance => TrendDirection::Improving,
        Some(avg) if avg - latest > config.tolerance => TrendDirection::Declining,
        _ => TrendDirection::Stable,
    };

    Some(QualityTrend {
        dimension,
        latest,
        previous,
        delta: previous.map_or(0.0, |p| latest - p),
        moving_average,
        direction,
        points: baseline.len() + 1,
    })
}
