//! Completeness: share of required fields that carry a value.

use super::models::{DimensionMeasure, QualityDimension, TableSnapshot};

/// Scores populated required fields over `rows × required fields`.
///
/// Null, missing and blank-string values count as unpopulated.
pub fn analyze_completeness(snapshot: &TableSnapshot, required_fields: &[String]) -> DimensionMeasure {
    let total = (snapshot.rows.len() * required_fields.len()) as u64;
    let missing = snapshot
        .rows
        .iter()
        .map(|row| {
            required_fields
                .iter()
                .filter(|field| !is_populated(row.values.get(field.as_str())))
                .count() as u64
        })
        .sum();

    DimensionMeasure::from_failures(QualityDimension::Completeness, missing, total)
}

pub(crate) fn is_populated(value: Option<&serde_json::Value>) -> bool {
    match value {
        None | Some(serde_json::Value::Null) => false,
        Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::models::SnapshotRow;
    use chrono::NaiveDate;
    use serde_json::json;

    fn create_snapshot(rows: Vec<serde_json::Value>) -> TableSnapshot {
        let rows = rows
            .into_iter()
            .enumerate()
            .map(|(i, values)| SnapshotRow {
                entity_id: format!("e{}", i),
                key: None,
                values: values.as_object().cloned().unwrap_or_default(),
                verified_at: None,
            })
            .collect();
        TableSnapshot::new("providers", "b1", NaiveDate::from_ymd_opt(2024, 6, 1).unwrap())
            .with_rows(rows)
    }

    fn required() -> Vec<String> {
        vec!["npi".to_string(), "last_name".to_string()]
    }

    #[test]
    fn test_completeness_all_present() {
        let snapshot = create_snapshot(vec![
            json!({"npi": "1234567890", "last_name": "Smith"}),
            json!({"npi": "1234567891", "last_name": "Jones"}),
        ]);

        let measure = analyze_completeness(&snapshot, &required());

        assert_eq!(measure.score, 100.0);
        assert_eq!(measure.total, 4);
        assert_eq!(measure.failing, 0);
    }

    #[test]
    fn test_completeness_with_nulls_and_blanks() {
        let snapshot = create_snapshot(vec![
            json!({"npi": null, "last_name": "Smith"}),
            json!({"npi": "1234567891", "last_name": "   "}),
            json!({"npi": "1234567892"}),
            json!({"npi": "1234567893", "last_name": "Lee"}),
        ]);

        let measure = analyze_completeness(&snapshot, &required());

        assert_eq!(measure.failing, 3);
        assert!((measure.score - 62.5).abs() < 1e-9);
    }

    #[test]
    fn test_completeness_empty_snapshot() {
        let measure = analyze_completeness(&create_snapshot(vec![]), &required());
        assert_eq!(measure.score, 100.0);
    }

    #[test]
    fn test_completeness_without_required_fields() {
        let snapshot = create_snapshot(vec![json!({"npi": null})]);
        assert_eq!(analyze_completeness(&snapshot, &[]).score, 100.0);
    }

    #[test]
    fn test_numbers_count_as_populated() {
        assert!(is_populated(Some(&json!(0))));
        assert!(!is_populated(Some(&json!(""))));
        assert!(!is_populated(None));
    }
}
