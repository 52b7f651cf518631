//! Entity resolution.
//!
//! Groups raw records from all sources into clusters that describe one
//! real-world provider or facility. Provider matching runs three tiers:
//!
//! 1. **Exact**: records sharing a valid NPI, confidence 1.0.
//! 2. **Fuzzy**: records blocked on (Soundex of last name, first initial,
//!    normalized license number); confidence depends on how many of name
//!    similarity, license and specialty agree. Records without a license
//!    never get a fuzzy edge.
//! 3. **Relational**: records without a fuzzy edge that share a facility
//!    affiliation and have similar names.
//!
//! Results depend only on the input set and configuration.

mod cluster;
mod facility;
pub mod normalize;
pub mod similarity;

pub use facility::{FacilityMatcher, facility_blocking_keys};
pub use similarity::{JaroWinklerNames, LevenshteinNames, Similarity, SoundexEquality, soundex};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::MatchConfig;
use crate::models::{Cluster, MatchEdge, MatchTier, RawProviderRecord, RecordKey, SourceRecord};
use cluster::{Candidate, ClusterNaming, latest_by_key, resolve};
use normalize::{normalize_code, normalize_npi, normalize_text, provider_name_parts};

const PROVIDER_NAMING: ClusterNaming = ClusterNaming {
    anchored: "prov:npi",
    fallback: "prov:rec",
};

/// Result of one matching run.
#[derive(Debug, Clone)]
pub struct MatchOutcome<R> {
    /// Clusters ordered by id
    pub clusters: Vec<Cluster<R>>,
    /// Edges refused because they would merge two anchored entities
    pub rejected: Vec<MatchEdge>,
    /// Edges dropped for falling below the confidence threshold
    pub discarded: usize,
}

impl<R: SourceRecord> MatchOutcome<R> {
    /// Cluster containing a record.
    pub fn cluster_of(&self, key: &RecordKey) -> Option<&Cluster<R>> {
        self.clusters
            .iter()
            .find(|c| c.records().any(|r| &r.record_key() == key))
    }

    /// Clusters that need manual review.
    pub fn ambiguous(&self) -> impl Iterator<Item = &Cluster<R>> {
        self.clusters.iter().filter(|c| c.is_ambiguous())
    }
}

/// Provider matcher with a pluggable name comparison.
#[derive(Clone)]
pub struct ProviderMatcher {
    config: MatchConfig,
    names: Arc<dyn Similarity>,
}

impl std::fmt::Debug for ProviderMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderMatcher")
            .field("config", &self.config)
            .field("names", &self.names.name())
            .finish()
    }
}

impl Default for ProviderMatcher {
    fn default() -> Self {
        Self::new(MatchConfig::default())
    }
}

impl ProviderMatcher {
    /// Creates a matcher using Jaro-Winkler name similarity.
    pub fn new(config: MatchConfig) -> Self {
        Self {
            config,
            names: Arc::new(JaroWinklerNames),
        }
    }

    /// Replaces the name comparison.
    pub fn with_similarity(mut self, names: Arc<dyn Similarity>) -> Self {
        self.names = names;
        self
    }

    /// Matching configuration in use.
    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Clusters the given records.
    pub fn match_records(&self, records: &[RawProviderRecord]) -> MatchOutcome<RawProviderRecord> {
        let records = latest_by_key(records);
        let npis: Vec<Option<String>> = records
            .iter()
            .map(|r| r.npi.as_deref().and_then(normalize_npi))
            .collect();

        let mut by_npi: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, npi) in npis.iter().enumerate() {
            if let Some(npi) = npi {
                by_npi.entry(npi.as_str()).or_default().push(i);
            }
        }
        let mut clustered = vec![false; records.len()];
        let mut exact = Vec::new();
        for indexes in by_npi.values().filter(|group| group.len() > 1) {
            let seed = indexes[0];
            for &i in indexes {
                clustered[i] = true;
                if i != seed {
                    exact.push(Candidate::new(seed, i, MatchTier::Exact, 1.0));
                }
            }
        }

        let fuzzy = self.fuzzy_edges(&records, &npis, &clustered);
        let mut linked = clustered.clone();
        for edge in fuzzy
            .iter()
            .filter(|e| e.confidence >= self.config.min_confidence)
        {
            linked[edge.a] = true;
            linked[edge.b] = true;
        }
        let relational = self.relational_edges(&records, &npis, &linked);

        let mut candidates = fuzzy;
        candidates.extend(relational);
        let outcome = resolve(
            records,
            npis,
            exact,
            candidates,
            self.config.min_confidence,
            PROVIDER_NAMING,
        );

        tracing::debug!(
            clusters = outcome.clusters.len(),
            rejected = outcome.rejected.len(),
            discarded = outcome.discarded,
            similarity = self.names.name(),
            "Provider matching complete"
        );
        outcome
    }

    fn fuzzy_edges(
        &self,
        records: &[RawProviderRecord],
        npis: &[Option<String>],
        clustered: &[bool],
    ) -> Vec<Candidate> {
        let mut blocks: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, record) in records.iter().enumerate() {
            if clustered[i] {
                continue;
            }
            if let Some(key) = identity_key(record) {
                blocks.entry(key).or_default().push(i);
            }
        }

        let mut edges = Vec::new();
        for members in blocks.values() {
            for (pos, &a) in members.iter().enumerate() {
                for &b in &members[pos + 1..] {
                    if conflicting_npis(npis, a, b) {
                        continue;
                    }
                    if let Some(confidence) = self.fuzzy_confidence(&records[a], &records[b]) {
                        edges.push(Candidate::new(a, b, MatchTier::Fuzzy, confidence));
                    }
                }
            }
        }
        edges
    }

    fn fuzzy_confidence(&self, a: &RawProviderRecord, b: &RawProviderRecord) -> Option<f64> {
        let license_a = a.license_number.as_deref().and_then(normalize_code);
        let license_b = b.license_number.as_deref().and_then(normalize_code);
        let license_agrees = match (&license_a, &license_b) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        };
        if !license_agrees {
            return None;
        }

        let name_agrees = self
            .names
            .similarity(&a.comparison_name(), &b.comparison_name())
            >= self.config.name_agreement_threshold;

        let specialty = |r: &RawProviderRecord| {
            r.specialty
                .as_deref()
                .map(normalize_text)
                .filter(|s| !s.is_empty())
        };
        let specialty_agrees = matches!(
            (specialty(a), specialty(b)),
            (Some(x), Some(y)) if x == y
        );

        let agreeing = [name_agrees, license_agrees, specialty_agrees]
            .into_iter()
            .filter(|agrees| *agrees)
            .count();
        (agreeing > 0).then(|| self.config.fuzzy_confidence_for(agreeing))
    }

    fn relational_edges(
        &self,
        records: &[RawProviderRecord],
        npis: &[Option<String>],
        linked: &[bool],
    ) -> Vec<Candidate> {
        let mut by_facility: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, record) in records.iter().enumerate() {
            if linked[i] {
                continue;
            }
            let refs: BTreeSet<String> = record
                .affiliations
                .iter()
                .filter_map(|hint| normalize_code(&hint.facility_ref))
                .collect();
            for facility in refs {
                by_facility.entry(facility).or_default().push(i);
            }
        }

        let mut pairs: BTreeSet<(usize, usize)> = BTreeSet::new();
        for members in by_facility.values() {
            for (pos, &a) in members.iter().enumerate() {
                for &b in &members[pos + 1..] {
                    pairs.insert((a.min(b), a.max(b)));
                }
            }
        }

        pairs
            .into_iter()
            .filter(|&(a, b)| !conflicting_npis(npis, a, b))
            .filter_map(|(a, b)| {
                let similarity = self
                    .names
                    .similarity(&records[a].comparison_name(), &records[b].comparison_name());
                (similarity >= self.config.relational_name_threshold).then(|| {
                    Candidate::new(
                        a,
                        b,
                        MatchTier::Relational,
                        similarity.min(self.config.relational_confidence_cap),
                    )
                })
            })
            .collect()
    }
}

/// Clusters provider records with default similarity.
pub fn match_records(
    records: &[RawProviderRecord],
    config: &MatchConfig,
) -> MatchOutcome<RawProviderRecord> {
    ProviderMatcher::new(config.clone()).match_records(records)
}

/// Fuzzy-tier blocking key: Soundex of the last name, first initial and
/// normalized license number. `None` when any part is missing.
pub fn identity_key(record: &RawProviderRecord) -> Option<String> {
    let (first, last) = provider_name_parts(record);
    let code = soundex(&last?)?;
    let initial = first?.chars().next()?;
    let license = record.license_number.as_deref().and_then(normalize_code)?;
    Some(format!("{}|{}|{}", code, initial, license))
}

/// Keys under which a provider record can meet its potential matches.
///
/// Two records can only end up in one cluster if they share at least one
/// key, directly or through other records.
pub fn provider_blocking_keys(record: &RawProviderRecord) -> Vec<String> {
    let mut keys = BTreeSet::new();
    if let Some(npi) = record.npi.as_deref().and_then(normalize_npi) {
        keys.insert(format!("npi:{}", npi));
    }
    if let Some(identity) = identity_key(record) {
        keys.insert(format!("ident:{}", identity));
    }
    for hint in &record.affiliations {
        if let Some(facility) = normalize_code(&hint.facility_ref) {
            keys.insert(format!("fac:{}", facility));
        }
    }
    keys.into_iter().collect()
}

fn conflicting_npis(npis: &[Option<String>], a: usize, b: usize) -> bool {
    matches!((&npis[a], &npis[b]), (Some(x), Some(y)) if x != y)
}
