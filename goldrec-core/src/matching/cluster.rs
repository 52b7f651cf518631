//! Connected components over scored edges.
//!
//! Edges are unioned greedily in precedence order (confidence, then tier,
//! then record key order). A union that would put two different anchors in
//! one component is rejected.

use std::collections::BTreeMap;

use crate::models::{Cluster, ClusterMember, MatchEdge, MatchTier, RecordKey, SourceRecord};

use super::MatchOutcome;

/// A scored edge between two record indexes (`a < b`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Candidate {
    pub a: usize,
    pub b: usize,
    pub tier: MatchTier,
    pub confidence: f64,
}

impl Candidate {
    pub fn new(a: usize, b: usize, tier: MatchTier, confidence: f64) -> Self {
        let (a, b) = if a <= b { (a, b) } else { (b, a) };
        Self {
            a,
            b,
            tier,
            confidence,
        }
    }

    fn precedence(&self, other: &Self) -> std::cmp::Ordering {
        other
            .confidence
            .total_cmp(&self.confidence)
            .then(self.tier.cmp(&other.tier))
            .then(self.a.cmp(&other.a))
            .then(self.b.cmp(&other.b))
    }
}

/// Cluster id prefixes for one entity type.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClusterNaming {
    /// Prefix for clusters carrying an anchor, e.g. `prov:npi`
    pub anchored: &'static str,
    /// Prefix for clusters named after their smallest member key
    pub fallback: &'static str,
}

/// Union-find with one optional anchor value per component.
struct Components {
    parent: Vec<usize>,
    anchor: Vec<Option<String>>,
}

impl Components {
    fn new(anchors: Vec<Option<String>>) -> Self {
        Self {
            parent: (0..anchors.len()).collect(),
            anchor: anchors,
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    /// Joins the components of `a` and `b` unless their anchors differ.
    fn try_union(&mut self, a: usize, b: usize) -> bool {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return true;
        }
        if let (Some(x), Some(y)) = (&self.anchor[ra], &self.anchor[rb])
            && x != y
        {
            return false;
        }
        let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
        if self.anchor[root].is_none() {
            self.anchor[root] = self.anchor[child].take();
        }
        self.parent[child] = root;
        true
    }
}

/// Runs the greedy union and assembles clusters.
///
/// `records` must be sorted by record key and free of duplicates; indexes in
/// the candidates refer to that order.
pub(crate) fn resolve<R: SourceRecord>(
    records: Vec<R>,
    anchors: Vec<Option<String>>,
    exact: Vec<Candidate>,
    mut candidates: Vec<Candidate>,
    min_confidence: f64,
    naming: ClusterNaming,
) -> MatchOutcome<R> {
    let keys: Vec<RecordKey> = records.iter().map(SourceRecord::record_key).collect();
    let mut components = Components::new(anchors);
    let mut best: Vec<Option<(MatchTier, f64)>> = vec![None; records.len()];
    let mut accepted: Vec<Candidate> = Vec::new();

    for edge in exact {
        components.try_union(edge.a, edge.b);
        best[edge.a] = Some((MatchTier::Exact, 1.0));
        best[edge.b] = Some((MatchTier::Exact, 1.0));
        accepted.push(edge);
    }

    let before = candidates.len();
    candidates.retain(|c| c.confidence >= min_confidence);
    let discarded = before - candidates.len();
    candidates.sort_by(Candidate::precedence);

    let mut rejected: Vec<Candidate> = Vec::new();
    for edge in candidates {
        if components.try_union(edge.a, edge.b) {
            for x in [edge.a, edge.b] {
                if best[x].is_none() {
                    best[x] = Some((edge.tier, edge.confidence));
                }
            }
            accepted.push(edge);
        } else {
            rejected.push(edge);
        }
    }

    let mut ambiguity: BTreeMap<usize, String> = BTreeMap::new();
    for edge in &rejected {
        for (x, other) in [(edge.a, edge.b), (edge.b, edge.a)] {
            let Some((tier, confidence)) = best[x] else {
                continue;
            };
            if tier == edge.tier && (confidence - edge.confidence).abs() < f64::EPSILON {
                let root = components.find(x);
                ambiguity.entry(root).or_insert_with(|| {
                    format!(
                        "record {} also matches {} at equal {} confidence {:.2}",
                        keys[x],
                        keys[other],
                        tier.as_str(),
                        confidence
                    )
                });
            }
        }
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..records.len() {
        let root = components.find(i);
        groups.entry(root).or_default().push(i);
    }
    let mut edges_by_root: BTreeMap<usize, Vec<MatchEdge>> = BTreeMap::new();
    for edge in &accepted {
        let root = components.find(edge.a);
        edges_by_root.entry(root).or_default().push(MatchEdge {
            from: keys[edge.a].clone(),
            to: keys[edge.b].clone(),
            tier: edge.tier,
            confidence: edge.confidence,
        });
    }

    let mut slots: Vec<Option<R>> = records.into_iter().map(Some).collect();
    let mut clusters: Vec<Cluster<R>> = groups
        .into_iter()
        .map(|(root, indexes)| {
            let id = match &components.anchor[root] {
                Some(anchor) => format!("{}:{}", naming.anchored, anchor),
                None => format!("{}:{}", naming.fallback, keys[indexes[0]]),
            };
            let members = indexes
                .iter()
                .filter_map(|&i| {
                    let record = slots[i].take()?;
                    let (tier, confidence) = match best[i] {
                        Some((tier, confidence)) => (Some(tier), confidence),
                        None => (None, 1.0),
                    };
                    Some(ClusterMember {
                        record,
                        tier,
                        confidence,
                    })
                })
                .collect();
            Cluster {
                id,
                entity_type: R::ENTITY_TYPE,
                members,
                edges: edges_by_root.remove(&root).unwrap_or_default(),
                ambiguity: ambiguity.remove(&root),
            }
        })
        .collect();
    clusters.sort_by(|a, b| a.id.cmp(&b.id));

    let rejected = rejected
        .into_iter()
        .map(|edge| MatchEdge {
            from: keys[edge.a].clone(),
            to: keys[edge.b].clone(),
            tier: edge.tier,
            confidence: edge.confidence,
        })
        .collect();

    MatchOutcome {
        clusters,
        rejected,
        discarded,
    }
}

/// Sorts records by key and keeps the latest capture of duplicate keys.
pub(crate) fn latest_by_key<R: SourceRecord>(records: &[R]) -> Vec<R> {
    let mut latest: BTreeMap<RecordKey, &R> = BTreeMap::new();
    for record in records {
        let key = record.record_key();
        match latest.get(&key) {
            Some(existing) if existing.captured_at() >= record.captured_at() => {}
            _ => {
                latest.insert(key, record);
            }
        }
    }
    latest.into_values().cloned().collect()
}
