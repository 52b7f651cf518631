//! Provider-to-facility affiliations derived from member hints.

use std::collections::BTreeMap;

use crate::matching::normalize::normalize_code;
use crate::models::{Affiliation, ProviderCluster, SourceRecord};

/// Golden id of the facility a hint refers to.
pub fn facility_id(facility_ref: &str) -> Option<String> {
    normalize_code(facility_ref).map(|code| format!("fac:id:{}", code))
}

/// Unions the affiliation hints of all cluster members.
///
/// One affiliation per facility; when members disagree about the same
/// facility the most recent capture wins, then the smaller record key.
pub fn derive_affiliations(cluster: &ProviderCluster) -> Vec<Affiliation> {
    let mut records: Vec<_> = cluster.records().collect();
    records.sort_by(|a, b| {
        b.captured_at
            .cmp(&a.captured_at)
            .then(a.record_key().cmp(&b.record_key()))
    });

    let mut by_facility: BTreeMap<String, Affiliation> = BTreeMap::new();
    for record in records {
        for hint in &record.affiliations {
            let Some(facility_id) = facility_id(&hint.facility_ref) else {
                tracing::debug!(
                    record = %record.record_key(),
                    facility_ref = %hint.facility_ref,
                    "Ignoring affiliation hint without usable facility reference"
                );
                continue;
            };
            by_facility
                .entry(facility_id.clone())
                .or_insert_with(|| Affiliation {
                    provider_id: cluster.id.clone(),
                    facility_id,
                    start_date: hint.start_date,
                    end_date: hint.end_date,
                    is_primary: hint.is_primary,
                    source: record.source.clone(),
                });
        }
    }
    by_facility.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AffiliationHint, ClusterMember, EntityType, RawProviderRecord};
    use chrono::{NaiveDate, TimeZone, Utc};

    fn hint(facility: &str, primary: bool, end: Option<NaiveDate>) -> AffiliationHint {
        AffiliationHint {
            facility_ref: facility.to_string(),
            is_primary: primary,
            start_date: NaiveDate::from_ymd_opt(2020, 1, 1),
            end_date: end,
        }
    }

    fn member(source: &str, month: u32, hints: Vec<AffiliationHint>) -> ClusterMember<RawProviderRecord> {
        let mut record = RawProviderRecord::new(
            source,
            "1",
            Utc.with_ymd_and_hms(2024, month, 1, 0, 0, 0).unwrap(),
        );
        record.affiliations = hints;
        ClusterMember {
            record,
            tier: None,
            confidence: 1.0,
        }
    }

    fn cluster(members: Vec<ClusterMember<RawProviderRecord>>) -> ProviderCluster {
        ProviderCluster {
            id: "prov:npi:1234567890".to_string(),
            entity_type: EntityType::Provider,
            members,
            edges: Vec::new(),
            ambiguity: None,
        }
    }

    #[test]
    fn test_union_of_member_hints() {
        let cluster = cluster(vec![
            member("cms", 1, vec![hint("F-1", true, None)]),
            member("state", 2, vec![hint("F-2", false, None)]),
        ]);

        let affiliations = derive_affiliations(&cluster);

        assert_eq!(affiliations.len(), 2);
        assert_eq!(affiliations[0].facility_id, "fac:id:F1");
        assert_eq!(affiliations[0].provider_id, "prov:npi:1234567890");
        assert!(affiliations[0].is_primary);
        assert_eq!(affiliations[1].source, "state");
    }

    #[test]
    fn test_most_recent_capture_wins_per_facility() {
        let ended = NaiveDate::from_ymd_opt(2023, 12, 31);
        let cluster = cluster(vec![
            member("cms", 1, vec![hint("F-1", true, None)]),
            member("state", 5, vec![hint("f1", false, ended)]),
        ]);

        let affiliations = derive_affiliations(&cluster);

        assert_eq!(affiliations.len(), 1);
        assert_eq!(affiliations[0].source, "state");
        assert_eq!(affiliations[0].end_date, ended);
        assert!(!affiliations[0].is_active());
    }

    #[test]
    fn test_blank_facility_refs_are_ignored() {
        let cluster = cluster(vec![member("cms", 1, vec![hint(" - ", true, None)])]);
        assert!(derive_affiliations(&cluster).is_empty());
    }
}
