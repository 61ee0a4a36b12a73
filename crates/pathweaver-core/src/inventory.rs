//! Concept inventory items and their deterministic normalization.
//!
//! Inventories arrive from the model as loosely shaped JSON. Everything a
//! stage persists passes through [`normalize_concept_inventory`], which
//! guarantees canonical keys, unique items, valid parent links, no parent
//! cycles, consistent depths, filtered citations and key ordering.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use uuid::Uuid;

use crate::keys::{dedupe_keys, dedupe_strings, normalize_concept_key};
use crate::text::shorten;

/// One concept as proposed by an inventory, delta, or alignment prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConceptItem {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parent_key: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub importance: i32,
    /// Chunk IDs backing this concept.
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub depth: i32,
    #[serde(default)]
    pub assumed: bool,
    #[serde(default)]
    pub required_by: Vec<String>,
    #[serde(default)]
    pub merged_from: Vec<String>,
    #[serde(default)]
    pub split_from: Option<String>,
    #[serde(default)]
    pub split_rationale: Option<String>,
}

impl ConceptItem {
    /// Parsed citation chunk IDs.
    pub fn citation_ids(&self) -> Vec<Uuid> {
        crate::keys::parse_uuids(&self.citations)
    }

    /// Text embedded for this concept: `name\nsummary\nkey points`, or the key.
    pub fn embedding_doc(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if !self.name.trim().is_empty() {
            parts.push(self.name.trim());
        }
        if !self.summary.trim().is_empty() {
            parts.push(self.summary.trim());
        }
        let points = self.key_points.join("; ");
        if !points.trim().is_empty() {
            parts.push(points.trim());
        }
        if parts.is_empty() {
            return self.key.clone();
        }
        parts.join("\n")
    }
}

/// Model self-assessment of how well an inventory covers the material.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub missing_topics: Vec<String>,
}

impl CoverageReport {
    pub fn normalized(mut self) -> Self {
        self.confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.missing_topics = dedupe_topics(&self.missing_topics);
        self
    }
}

/// Case-insensitive topic dedupe keeping first spelling and order.
pub fn dedupe_topics(topics: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    dedupe_strings(topics)
        .into_iter()
        .filter(|t| seen.insert(t.to_lowercase()))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConceptInventory {
    #[serde(default)]
    pub concepts: Vec<ConceptItem>,
    #[serde(default)]
    pub coverage: CoverageReport,
}

/// Counters surfaced to logs after normalization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeReport {
    pub dropped_empty_key: usize,
    pub merged_duplicates: usize,
    pub cleared_parents: usize,
    pub broken_cycles: usize,
    pub dropped_citations: usize,
}

fn clean_item(mut item: ConceptItem, allowed: Option<&HashSet<Uuid>>, report: &mut NormalizeReport) -> Option<ConceptItem> {
    let raw_key = if item.key.trim().is_empty() { &item.name } else { &item.key };
    let key = normalize_concept_key(raw_key);
    if key.is_empty() {
        report.dropped_empty_key += 1;
        return None;
    }
    item.key = key;
    item.name = item.name.trim().to_string();
    if item.name.is_empty() {
        item.name = item.key.replace('_', " ");
    }
    item.summary = item.summary.trim().to_string();
    item.parent_key = normalize_concept_key(&item.parent_key);
    item.key_points = dedupe_strings(&item.key_points);
    let own = item.key.clone();
    item.aliases = dedupe_keys(&item.aliases).into_iter().filter(|a| *a != own).collect();
    item.required_by = dedupe_keys(&item.required_by).into_iter().filter(|a| *a != own).collect();
    item.merged_from = dedupe_keys(&item.merged_from);
    item.split_from = item
        .split_from
        .as_deref()
        .map(normalize_concept_key)
        .filter(|s| !s.is_empty());
    item.importance = item.importance.clamp(0, 10);

    let before = item.citations.len();
    let mut ids: Vec<Uuid> = item.citation_ids();
    if let Some(allowed) = allowed {
        ids.retain(|id| allowed.contains(id));
    }
    ids.sort();
    item.citations = ids.iter().map(|id| id.to_string()).collect();
    report.dropped_citations += before.saturating_sub(item.citations.len());
    Some(item)
}

fn union_into(dst: &mut Vec<String>, src: &[String]) {
    for s in src {
        if !dst.contains(s) {
            dst.push(s.clone());
        }
    }
}

/// Merge `incoming` into `base` (same key).
pub fn merge_item(base: &mut ConceptItem, incoming: &ConceptItem) {
    if base.name.is_empty() {
        base.name = incoming.name.clone();
    }
    if incoming.summary.len() > base.summary.len() {
        base.summary = incoming.summary.clone();
    }
    if base.parent_key.is_empty() {
        base.parent_key = incoming.parent_key.clone();
    }
    union_into(&mut base.key_points, &incoming.key_points);
    union_into(&mut base.aliases, &incoming.aliases);
    union_into(&mut base.citations, &incoming.citations);
    union_into(&mut base.required_by, &incoming.required_by);
    union_into(&mut base.merged_from, &incoming.merged_from);
    base.citations.sort();
    base.importance = base.importance.max(incoming.importance);
    base.assumed = base.assumed && incoming.assumed;
    if base.split_from.is_none() {
        base.split_from = incoming.split_from.clone();
        base.split_rationale = incoming.split_rationale.clone();
    }
}

/// Normalize an inventory.
///
/// `allowed_chunks` restricts citations; `None` keeps any well-formed ID.
pub fn normalize_concept_inventory(
    items: Vec<ConceptItem>,
    allowed_chunks: Option<&HashSet<Uuid>>,
) -> (Vec<ConceptItem>, NormalizeReport) {
    let mut report = NormalizeReport::default();

    let mut by_key: BTreeMap<String, ConceptItem> = BTreeMap::new();
    for item in items {
        let item = match clean_item(item, allowed_chunks, &mut report) {
            Some(i) => i,
            None => continue,
        };
        match by_key.get_mut(&item.key) {
            Some(existing) => {
                merge_item(existing, &item);
                report.merged_duplicates += 1;
            }
            None => {
                by_key.insert(item.key.clone(), item);
            }
        }
    }

    let keys: BTreeSet<String> = by_key.keys().cloned().collect();
    for item in by_key.values_mut() {
        if !item.parent_key.is_empty() && (item.parent_key == item.key || !keys.contains(&item.parent_key)) {
            item.parent_key.clear();
            report.cleared_parents += 1;
        }
        item.aliases.retain(|a| !keys.contains(a));
        item.required_by.retain(|r| keys.contains(r));
    }

    report.broken_cycles = break_parent_cycles(&mut by_key);
    assign_depths(&mut by_key);

    (by_key.into_values().collect(), report)
}

/// Clear the parent link that closes each cycle. Returns cycles broken.
fn break_parent_cycles(by_key: &mut BTreeMap<String, ConceptItem>) -> usize {
    let mut broken = 0;
    let keys: Vec<String> = by_key.keys().cloned().collect();
    for start in keys {
        let mut visited: HashSet<String> = HashSet::new();
        let mut current = start;
        loop {
            visited.insert(current.clone());
            let parent = match by_key.get(&current) {
                Some(item) if !item.parent_key.is_empty() => item.parent_key.clone(),
                _ => break,
            };
            if visited.contains(&parent) {
                if let Some(item) = by_key.get_mut(&current) {
                    item.parent_key.clear();
                }
                broken += 1;
                break;
            }
            current = parent;
        }
    }
    broken
}

fn assign_depths(by_key: &mut BTreeMap<String, ConceptItem>) {
    let parents: HashMap<String, String> = by_key
        .iter()
        .map(|(k, v)| (k.clone(), v.parent_key.clone()))
        .collect();
    for item in by_key.values_mut() {
        let mut depth = 0;
        let mut p = item.parent_key.clone();
        while !p.is_empty() && depth <= parents.len() as i32 {
            depth += 1;
            p = parents.get(&p).cloned().unwrap_or_default();
        }
        item.depth = depth;
    }
}

/// Union two inventories and renormalize.
pub fn merge_inventories(
    base: &[ConceptItem],
    incoming: &[ConceptItem],
    allowed_chunks: Option<&HashSet<Uuid>>,
) -> (Vec<ConceptItem>, NormalizeReport) {
    let mut all = base.to_vec();
    all.extend(incoming.iter().cloned());
    normalize_concept_inventory(all, allowed_chunks)
}

pub fn known_keys(items: &[ConceptItem]) -> BTreeSet<String> {
    items.iter().map(|i| i.key.clone()).collect()
}

// ─── Alignment ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AliasGroup {
    #[serde(default)]
    pub canonical_key: String,
    #[serde(default)]
    pub alias_keys: Vec<String>,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitGroup {
    #[serde(default)]
    pub ambiguous_key: String,
    #[serde(default)]
    pub meanings: Vec<ConceptItem>,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Alignment {
    #[serde(default)]
    pub aliases: Vec<AliasGroup>,
    #[serde(default)]
    pub splits: Vec<SplitGroup>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlignmentReport {
    pub merged: usize,
    pub split: usize,
}

fn repoint(items: &mut [ConceptItem], from: &str, to: &str) {
    for item in items.iter_mut() {
        if item.parent_key == from {
            item.parent_key = to.to_string();
        }
        for r in item.required_by.iter_mut() {
            if r == from {
                *r = to.to_string();
            }
        }
    }
}

/// Apply alias merges then meaning splits. The result is unnormalized.
pub fn apply_alignment(mut items: Vec<ConceptItem>, alignment: &Alignment) -> (Vec<ConceptItem>, AlignmentReport) {
    let mut report = AlignmentReport::default();

    for group in &alignment.aliases {
        let canonical = normalize_concept_key(&group.canonical_key);
        if !items.iter().any(|i| i.key == canonical) {
            continue;
        }
        for alias in dedupe_keys(&group.alias_keys) {
            if alias == canonical {
                continue;
            }
            let Some(ai) = items.iter().position(|i| i.key == alias) else {
                continue;
            };
            let alias_item = items.remove(ai);
            let Some(target) = items.iter_mut().find(|i| i.key == canonical) else {
                break;
            };
            merge_item(target, &alias_item);
            union_into(&mut target.aliases, std::slice::from_ref(&alias_item.key));
            union_into(&mut target.aliases, &alias_item.aliases);
            union_into(&mut target.merged_from, std::slice::from_ref(&alias_item.key));
            repoint(&mut items, &alias, &canonical);
            report.merged += 1;
        }
    }

    for split in &alignment.splits {
        let ambiguous = normalize_concept_key(&split.ambiguous_key);
        let Some(idx) = items.iter().position(|i| i.key == ambiguous) else {
            continue;
        };
        let meanings: Vec<ConceptItem> = split
            .meanings
            .iter()
            .filter(|m| !normalize_concept_key(if m.key.is_empty() { &m.name } else { &m.key }).is_empty())
            .cloned()
            .collect();
        if meanings.is_empty() {
            continue;
        }
        let original = items.remove(idx);
        let mut first_key = String::new();
        for mut m in meanings {
            m.key = normalize_concept_key(if m.key.is_empty() { &m.name } else { &m.key });
            if m.key == original.key {
                continue;
            }
            if m.citations.is_empty() {
                m.citations = original.citations.clone();
            }
            if m.parent_key.is_empty() {
                m.parent_key = original.parent_key.clone();
            }
            m.split_from = Some(original.key.clone());
            if m.split_rationale.as_deref().map(str::trim).unwrap_or("").is_empty() {
                m.split_rationale = Some(split.rationale.trim().to_string());
            }
            if first_key.is_empty() {
                first_key = m.key.clone();
            }
            items.push(m);
        }
        if first_key.is_empty() {
            items.insert(idx, original);
            continue;
        }
        repoint(&mut items, &original.key, &first_key);
        report.split += 1;
    }

    (items, report)
}

/// Add assumed prerequisite concepts.
///
/// Keys already present are merged (names, summaries, aliases and
/// `required_by`) without being flagged as assumed; new keys are added
/// with `assumed = true`.
pub fn apply_assumed_knowledge(mut items: Vec<ConceptItem>, assumed: &[ConceptItem]) -> (Vec<ConceptItem>, usize) {
    let mut added = 0;
    for a in assumed {
        let key = normalize_concept_key(if a.key.is_empty() { &a.name } else { &a.key });
        if key.is_empty() {
            continue;
        }
        let mut incoming = a.clone();
        incoming.key = key.clone();
        incoming.required_by = dedupe_keys(&a.required_by);
        match items.iter_mut().find(|i| i.key == key) {
            Some(existing) => {
                incoming.assumed = existing.assumed;
                merge_item(existing, &incoming);
            }
            None => {
                incoming.assumed = true;
                items.push(incoming);
                added += 1;
            }
        }
    }
    (items, added)
}

/// Compact concept listing for delta prompts: `key | name | parent | summary`.
pub fn summarize_for_prompt(items: &[ConceptItem], summary_chars: usize) -> String {
    items
        .iter()
        .map(|i| {
            let parent = if i.parent_key.is_empty() { "-" } else { i.parent_key.as_str() };
            format!("{} | {} | parent={} | {}", i.key, i.name, parent, shorten(&i.summary, summary_chars))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(key: &str, parent: &str) -> ConceptItem {
        ConceptItem {
            key: key.to_string(),
            name: key.to_string(),
            parent_key: parent.to_string(),
            ..Default::default()
        }
    }

    fn check_invariants(items: &[ConceptItem]) {
        let keys = known_keys(items);
        assert_eq!(keys.len(), items.len(), "duplicate keys");
        let by_key: HashMap<&str, &ConceptItem> = items.iter().map(|i| (i.key.as_str(), i)).collect();
        for i in items {
            if !i.parent_key.is_empty() {
                assert!(keys.contains(&i.parent_key), "dangling parent {}", i.parent_key);
            }
            let mut depth = 0;
            let mut p = i.parent_key.as_str();
            let mut seen = HashSet::new();
            while !p.is_empty() {
                assert!(seen.insert(p), "cycle through {}", p);
                depth += 1;
                p = by_key[p].parent_key.as_str();
            }
            assert_eq!(depth, i.depth, "depth of {}", i.key);
        }
        let mut sorted: Vec<&str> = items.iter().map(|i| i.key.as_str()).collect();
        sorted.sort();
        assert_eq!(sorted, items.iter().map(|i| i.key.as_str()).collect::<Vec<_>>());
    }

    #[test]
    fn test_normalize_merges_and_sorts() {
        let mut a = item("Linear Regression", "");
        a.summary = "short".into();
        let mut b = item("linear_regression", "statistics");
        b.summary = "a longer summary".into();
        let (out, report) = normalize_concept_inventory(vec![a, b, item("Statistics", ""), item("!!!", "")], None);
        assert_eq!(report.dropped_empty_key, 1);
        assert_eq!(report.merged_duplicates, 1);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].key, "linear_regression");
        assert_eq!(out[0].summary, "a longer summary");
        assert_eq!(out[0].parent_key, "statistics");
        assert_eq!(out[0].depth, 1);
        check_invariants(&out);
    }

    #[test]
    fn test_normalize_clears_unknown_and_self_parent() {
        let (out, report) = normalize_concept_inventory(vec![item("a", "a"), item("b", "missing")], None);
        assert_eq!(report.cleared_parents, 2);
        assert!(out.iter().all(|i| i.parent_key.is_empty() && i.depth == 0));
    }

    #[test]
    fn test_normalize_breaks_cycles() {
        let items = vec![item("a", "c"), item("b", "a"), item("c", "b"), item("d", "c")];
        let (out, report) = normalize_concept_inventory(items, None);
        assert_eq!(report.broken_cycles, 1);
        check_invariants(&out);
    }

    #[test]
    fn test_normalize_filters_citations() {
        let keep = Uuid::new_v4();
        let drop = Uuid::new_v4();
        let mut i = item("x", "");
        i.citations = vec![keep.to_string(), drop.to_string(), "junk".into()];
        let allowed: HashSet<Uuid> = [keep].into_iter().collect();
        let (out, report) = normalize_concept_inventory(vec![i], Some(&allowed));
        assert_eq!(out[0].citations, vec![keep.to_string()]);
        assert_eq!(report.dropped_citations, 2);
    }

    #[test]
    fn test_alignment_alias_merge() {
        let mut child = item("ols", "least_squares");
        child.citations = vec![Uuid::new_v4().to_string()];
        let items = vec![item("least_squares", ""), item("ordinary_least_squares", ""), child];
        let alignment = Alignment {
            aliases: vec![AliasGroup {
                canonical_key: "ordinary_least_squares".into(),
                alias_keys: vec!["least squares".into()],
                rationale: "same method".into(),
            }],
            splits: vec![],
        };
        let (out, report) = apply_alignment(items, &alignment);
        assert_eq!(report.merged, 1);
        let (out, _) = normalize_concept_inventory(out, None);
        let canon = out.iter().find(|i| i.key == "ordinary_least_squares").unwrap();
        assert!(canon.merged_from.contains(&"least_squares".to_string()));
        assert!(canon.aliases.contains(&"least_squares".to_string()));
        let ols = out.iter().find(|i| i.key == "ols").unwrap();
        assert_eq!(ols.parent_key, "ordinary_least_squares");
        check_invariants(&out);
    }

    #[test]
    fn test_alignment_split() {
        let cite = Uuid::new_v4().to_string();
        let mut amb = item("kernel", "");
        amb.citations = vec![cite.clone()];
        let items = vec![amb, item("svm", "kernel")];
        let alignment = Alignment {
            aliases: vec![],
            splits: vec![SplitGroup {
                ambiguous_key: "kernel".into(),
                meanings: vec![item("kernel_function", ""), item("os_kernel", "")],
                rationale: "two senses".into(),
            }],
        };
        let (out, report) = apply_alignment(items, &alignment);
        assert_eq!(report.split, 1);
        let (out, _) = normalize_concept_inventory(out, None);
        assert!(out.iter().all(|i| i.key != "kernel"));
        let kf = out.iter().find(|i| i.key == "kernel_function").unwrap();
        assert_eq!(kf.split_from.as_deref(), Some("kernel"));
        assert_eq!(kf.split_rationale.as_deref(), Some("two senses"));
        assert_eq!(kf.citations, vec![cite]);
        assert_eq!(out.iter().find(|i| i.key == "svm").unwrap().parent_key, "kernel_function");
    }

    #[test]
    fn test_assumed_knowledge() {
        let items = vec![item("bayes_theorem", "")];
        let mut pre = item("Conditional Probability", "");
        pre.required_by = vec!["bayes_theorem".into()];
        let mut existing = item("bayes_theorem", "");
        existing.aliases = vec!["bayes_rule".into()];
        let (out, added) = apply_assumed_knowledge(items, &[pre, existing]);
        assert_eq!(added, 1);
        let (out, _) = normalize_concept_inventory(out, None);
        let cp = out.iter().find(|i| i.key == "conditional_probability").unwrap();
        assert!(cp.assumed);
        assert_eq!(cp.required_by, vec!["bayes_theorem"]);
        let bt = out.iter().find(|i| i.key == "bayes_theorem").unwrap();
        assert!(!bt.assumed);
        assert_eq!(bt.aliases, vec!["bayes_rule"]);
    }

    #[test]
    fn test_embedding_doc_fallback() {
        let i = ConceptItem {
            key: "k".into(),
            ..Default::default()
        };
        assert_eq!(i.embedding_doc(), "k");
        let mut j = item("k", "");
        j.summary = "s".into();
        j.key_points = vec!["p1".into(), "p2".into()];
        assert_eq!(j.embedding_doc(), "k\ns\np1; p2");
    }

    #[test]
    fn test_coverage_report_normalized() {
        let c = CoverageReport {
            confidence: 1.7,
            missing_topics: vec!["Priors".into(), "priors ".into(), "".into(), "Loss".into()],
        }
        .normalized();
        assert_eq!(c.confidence, 1.0);
        assert_eq!(c.missing_topics, vec!["Priors", "Loss"]);
    }
}
