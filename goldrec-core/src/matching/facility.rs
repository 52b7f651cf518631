//! Facility matching: shared identifier, else same name at the same postal
//! code.

use std::collections::{BTreeMap, BTreeSet};

use super::MatchOutcome;
use super::cluster::{Candidate, ClusterNaming, latest_by_key, resolve};
use super::normalize::{normalize_code, normalize_postal_code, normalize_text};
use crate::config::MatchConfig;
use crate::models::{FacilityRecord, MatchTier};

const FACILITY_NAMING: ClusterNaming = ClusterNaming {
    anchored: "fac:id",
    fallback: "fac:rec",
};

/// Confidence of a name and postal code match.
const NAME_POSTAL_CONFIDENCE: f64 = 0.90;

/// Facility matcher.
#[derive(Debug, Clone, Default)]
pub struct FacilityMatcher {
    config: MatchConfig,
}

impl FacilityMatcher {
    pub fn new(config: MatchConfig) -> Self {
        Self { config }
    }

    /// Clusters the given facility records.
    pub fn match_records(&self, records: &[FacilityRecord]) -> MatchOutcome<FacilityRecord> {
        let records = latest_by_key(records);
        let identifiers: Vec<Option<String>> = records
            .iter()
            .map(|r| r.identifier.as_deref().and_then(normalize_code))
            .collect();

        let mut by_identifier: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, identifier) in identifiers.iter().enumerate() {
            if let Some(identifier) = identifier {
                by_identifier.entry(identifier.as_str()).or_default().push(i);
            }
        }
        let exact = by_identifier
            .values()
            .flat_map(|group| {
                let seed = group[0];
                group[1..]
                    .iter()
                    .map(move |&i| Candidate::new(seed, i, MatchTier::Exact, 1.0))
            })
            .collect();

        let mut by_location: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();
        for (i, record) in records.iter().enumerate() {
            if let Some(key) = location_key(record) {
                by_location.entry(key).or_default().push(i);
            }
        }
        let mut pairs = BTreeSet::new();
        for group in by_location.values() {
            for (pos, &a) in group.iter().enumerate() {
                for &b in &group[pos + 1..] {
                    let contradicting = matches!(
                        (&identifiers[a], &identifiers[b]),
                        (Some(x), Some(y)) if x != y
                    );
                    if !contradicting {
                        pairs.insert((a, b));
                    }
                }
            }
        }
        let candidates = pairs
            .into_iter()
            .map(|(a, b)| Candidate::new(a, b, MatchTier::Fuzzy, NAME_POSTAL_CONFIDENCE))
            .collect();

        let outcome = resolve(
            records,
            identifiers,
            exact,
            candidates,
            self.config.min_confidence,
            FACILITY_NAMING,
        );
        tracing::debug!(
            clusters = outcome.clusters.len(),
            "Facility matching complete"
        );
        outcome
    }
}

fn location_key(record: &FacilityRecord) -> Option<(String, String)> {
    let name = record
        .name
        .as_deref()
        .map(normalize_text)
        .filter(|s| !s.is_empty())?;
    let postal = record.postal_code.as_deref().and_then(normalize_postal_code)?;
    Some((name, postal))
}

/// Keys under which a facility record can meet its potential matches.
pub fn facility_blocking_keys(record: &FacilityRecord) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(identifier) = record.identifier.as_deref().and_then(normalize_code) {
        keys.push(format!("fid:{}", identifier));
    }
    if let Some((name, postal)) = location_key(record) {
        keys.push(format!("floc:{}|{}", name, postal));
    }
    keys
}
