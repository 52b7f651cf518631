//! Golden record synthesis.
//!
//! Each field is resolved independently from the values the cluster members
//! carry. When members disagree, the tie-break chain is:
//!
//! 1. highest source credibility,
//! 2. most recent capture,
//! 3. most complete (longest) value.
//!
//! If candidates are still tied the field stays null and is marked as a
//! conflict. Nothing here reads the clock, so the same cluster and table
//! always produce the same record.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::config::CredibilityTable;
use crate::models::{Cluster, FieldValue, GoldenRecord, RecordKey, ResolutionRule, ResolvedField, SourceRecord};
use crate::{GoldrecError, Result};

/// One member's value for a field.
#[derive(Debug, Clone)]
struct Contribution {
    value: FieldValue,
    source: String,
    record: RecordKey,
    weight: f64,
    captured_at: DateTime<Utc>,
}

/// Builds the golden record for a cluster.
pub fn synthesize<R: SourceRecord>(
    cluster: &Cluster<R>,
    credibility: &CredibilityTable,
) -> GoldenRecord {
    let records: Vec<&R> = cluster.records().collect();

    let fields: BTreeMap<String, ResolvedField> = R::field_names()
        .iter()
        .map(|field| {
            let resolved = resolve_field(field, &records, credibility);
            if resolved.conflict {
                tracing::debug!(
                    cluster_id = %cluster.id,
                    field = %field,
                    candidates = resolved.candidates,
                    "Field left unresolved"
                );
            }
            ((*field).to_string(), resolved)
        })
        .collect();

    GoldenRecord {
        cluster_id: cluster.id.clone(),
        entity_type: cluster.entity_type,
        fields,
        source_records: cluster.member_keys(),
        last_captured_at: records.iter().map(|r| r.captured_at()).max(),
        version: 0,
        active: true,
        created_at: None,
        superseded_at: None,
    }
}

/// Like [`synthesize`], but refuses clusters flagged as ambiguous.
pub fn try_synthesize<R: SourceRecord>(
    cluster: &Cluster<R>,
    credibility: &CredibilityTable,
) -> Result<GoldenRecord> {
    if let Some(reason) = &cluster.ambiguity {
        return Err(GoldrecError::AmbiguousMatch {
            cluster_id: cluster.id.clone(),
            reason: reason.clone(),
        });
    }
    Ok(synthesize(cluster, credibility))
}

/// Unresolved fields of a golden record as errors, for reporting.
pub fn conflict_errors(golden: &GoldenRecord) -> Vec<GoldrecError> {
    golden
        .conflicted_fields()
        .into_iter()
        .map(|field| GoldrecError::ConflictUnresolved {
            cluster_id: golden.cluster_id.clone(),
            field: field.to_string(),
        })
        .collect()
}

/// Resolves one field across the given records.
pub fn resolve_field<R: SourceRecord>(
    field: &str,
    records: &[&R],
    credibility: &CredibilityTable,
) -> ResolvedField {
    let mut contributions: Vec<Contribution> = records
        .iter()
        .filter_map(|record| {
            let value = record.field_value(field)?;
            Some(Contribution {
                value,
                source: record.source().to_string(),
                record: record.record_key(),
                weight: credibility.weight_for(record.source(), record.reported_confidence()),
                captured_at: record.captured_at(),
            })
        })
        .collect();
    // Stable order: preferred representative first within equal values
    contributions.sort_by(|a, b| {
        b.weight
            .total_cmp(&a.weight)
            .then(b.captured_at.cmp(&a.captured_at))
            .then(a.record.cmp(&b.record))
    });

    let candidates = u32::try_from(contributions.len()).unwrap_or(u32::MAX);
    let Some(first) = contributions.first() else {
        return ResolvedField::absent();
    };

    if contributions.iter().all(|c| c.value == first.value) {
        return winner(first, ResolutionRule::Unanimous, candidates);
    }

    let steps: [(ResolutionRule, fn(&Contribution, &Contribution) -> std::cmp::Ordering); 3] = [
        (ResolutionRule::Credibility, |a, b| a.weight.total_cmp(&b.weight)),
        (ResolutionRule::Recency, |a, b| a.captured_at.cmp(&b.captured_at)),
        (ResolutionRule::Completeness, |a, b| {
            a.value.completeness_len().cmp(&b.value.completeness_len())
        }),
    ];

    let mut remaining: Vec<&Contribution> = contributions.iter().collect();
    for (rule, compare) in steps {
        let Some(best) = remaining.iter().copied().max_by(|a, b| compare(a, b)) else {
            break;
        };
        remaining.retain(|c| compare(c, best).is_eq());
        if let Some(top) = remaining.first()
            && remaining.iter().all(|c| c.value == top.value)
        {
            return winner(top, rule, candidates);
        }
    }

    ResolvedField {
        value: None,
        winning_source: None,
        winning_record: None,
        rule: ResolutionRule::Unresolved,
        conflict: true,
        candidates,
    }
}

fn winner(contribution: &Contribution, rule: ResolutionRule, candidates: u32) -> ResolvedField {
    ResolvedField {
        value: Some(contribution.value.clone()),
        winning_source: Some(contribution.source.clone()),
        winning_record: Some(contribution.record.clone()),
        rule,
        conflict: false,
        candidates,
    }
}
