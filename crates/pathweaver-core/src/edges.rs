//! Concept edge items and normalization.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use crate::inventory::ConceptItem;
use crate::keys::normalize_concept_key;
use crate::models::EdgeType;

/// Strength of prerequisite edges derived from `required_by` metadata.
pub const REQUIRED_BY_STRENGTH: f64 = 0.85;

/// An edge as proposed by the edge prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeItem {
    #[serde(default)]
    pub from_key: String,
    #[serde(default)]
    pub to_key: String,
    #[serde(default)]
    pub edge_type: String,
    #[serde(default)]
    pub strength: f64,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub citations: Vec<String>,
}

impl EdgeItem {
    /// Parsed edge type; only valid after normalization.
    pub fn kind(&self) -> EdgeType {
        EdgeType::parse(&self.edge_type).unwrap_or(EdgeType::Related)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EdgeNormalizeReport {
    pub self_loops: usize,
    pub unknown_endpoints: usize,
    pub coerced_types: usize,
    pub duplicates: usize,
}

/// Normalize edges against a known key set.
///
/// Drops self-loops and edges with unknown endpoints, coerces unknown
/// types (and `composes`, which is reserved for compound promotion) to
/// `related`, clamps strength to `[0, 1]`, filters citations to allowed
/// chunks, and dedupes by `(from, to, type)` keeping the highest strength
/// and the longest rationale. Output is sorted by `(from, to, type)`.
pub fn normalize_concept_edges(
    edges: Vec<EdgeItem>,
    known_keys: &HashSet<String>,
    allowed_chunks: Option<&HashSet<Uuid>>,
) -> (Vec<EdgeItem>, EdgeNormalizeReport) {
    let mut report = EdgeNormalizeReport::default();
    let mut out: BTreeMap<(String, String, EdgeType), EdgeItem> = BTreeMap::new();

    for mut e in edges {
        e.from_key = normalize_concept_key(&e.from_key);
        e.to_key = normalize_concept_key(&e.to_key);
        if e.from_key == e.to_key {
            report.self_loops += 1;
            continue;
        }
        if !known_keys.contains(&e.from_key) || !known_keys.contains(&e.to_key) {
            report.unknown_endpoints += 1;
            continue;
        }
        let kind = match EdgeType::parse(&e.edge_type) {
            Some(EdgeType::Composes) | None => {
                report.coerced_types += 1;
                EdgeType::Related
            }
            Some(k) => k,
        };
        e.edge_type = kind.as_str().to_string();
        e.strength = if e.strength.is_finite() { e.strength.clamp(0.0, 1.0) } else { 0.0 };
        e.rationale = e.rationale.trim().to_string();
        let mut ids = crate::keys::parse_uuids(&e.citations);
        if let Some(allowed) = allowed_chunks {
            ids.retain(|id| allowed.contains(id));
        }
        ids.sort();
        e.citations = ids.iter().map(|id| id.to_string()).collect();

        let key = (e.from_key.clone(), e.to_key.clone(), kind);
        match out.get_mut(&key) {
            Some(existing) => {
                report.duplicates += 1;
                if e.strength > existing.strength {
                    existing.strength = e.strength;
                }
                if e.rationale.len() > existing.rationale.len() {
                    existing.rationale = e.rationale;
                }
                for c in e.citations {
                    if !existing.citations.contains(&c) {
                        existing.citations.push(c);
                    }
                }
                existing.citations.sort();
            }
            None => {
                out.insert(key, e);
            }
        }
    }

    (out.into_values().collect(), report)
}

/// Prerequisite edges implied by `required_by`: prerequisite → requirer.
pub fn prereq_edges_from_required_by(items: &[ConceptItem]) -> Vec<EdgeItem> {
    let mut edges = Vec::new();
    for item in items {
        for requirer in &item.required_by {
            edges.push(EdgeItem {
                from_key: item.key.clone(),
                to_key: requirer.clone(),
                edge_type: EdgeType::Prereq.as_str().to_string(),
                strength: REQUIRED_BY_STRENGTH,
                rationale: format!("{} is assumed knowledge for {}", item.key, requirer),
                citations: Vec::new(),
            });
        }
    }
    edges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(from: &str, to: &str, t: &str, s: f64, rationale: &str) -> EdgeItem {
        EdgeItem {
            from_key: from.into(),
            to_key: to.into(),
            edge_type: t.into(),
            strength: s,
            rationale: rationale.into(),
            citations: Vec::new(),
        }
    }

    fn keys(ks: &[&str]) -> HashSet<String> {
        ks.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_normalize_edges_invariants() {
        let known = keys(&["a", "b", "c"]);
        let input = vec![
            edge("a", "a", "related", 0.5, ""),
            edge("a", "zzz", "related", 0.5, ""),
            edge("A", "b", "prerequisite", 1.7, "short"),
            edge("a", "b", "prereq", 0.4, "a much longer rationale"),
            edge("b", "c", "teleports", -2.0, ""),
            edge("c", "a", "composes", 0.3, ""),
        ];
        let (out, report) = normalize_concept_edges(input, &known, None);
        assert_eq!(report.self_loops, 1);
        assert_eq!(report.unknown_endpoints, 1);
        assert_eq!(report.coerced_types, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(out.len(), 3);

        let ab = &out[0];
        assert_eq!((ab.from_key.as_str(), ab.to_key.as_str(), ab.edge_type.as_str()), ("a", "b", "prereq"));
        assert_eq!(ab.strength, 1.0);
        assert_eq!(ab.rationale, "a much longer rationale");

        let mut seen = HashSet::new();
        for e in &out {
            assert_ne!(e.from_key, e.to_key);
            assert!(known.contains(&e.from_key) && known.contains(&e.to_key));
            assert!(matches!(e.kind(), EdgeType::Prereq | EdgeType::Related | EdgeType::Analogy));
            assert!((0.0..=1.0).contains(&e.strength));
            assert!(seen.insert((e.from_key.clone(), e.to_key.clone(), e.edge_type.clone())));
        }
    }

    #[test]
    fn test_normalize_edges_filters_citations() {
        let ok = Uuid::new_v4();
        let mut e = edge("a", "b", "related", 0.5, "");
        e.citations = vec![ok.to_string(), Uuid::new_v4().to_string()];
        let allowed: HashSet<Uuid> = [ok].into_iter().collect();
        let (out, _) = normalize_concept_edges(vec![e], &keys(&["a", "b"]), Some(&allowed));
        assert_eq!(out[0].citations, vec![ok.to_string()]);
    }

    #[test]
    fn test_prereq_from_required_by_direction() {
        let item = ConceptItem {
            key: "conditional_probability".into(),
            required_by: vec!["bayes_theorem".into()],
            ..Default::default()
        };
        let edges = prereq_edges_from_required_by(&[item]);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].from_key, "conditional_probability");
        assert_eq!(edges[0].to_key, "bayes_theorem");
        assert_eq!(edges[0].kind(), EdgeType::Prereq);
        assert_eq!(edges[0].strength, REQUIRED_BY_STRENGTH);
    }
}
