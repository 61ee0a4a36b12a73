//! Seed-concept quality from file signatures, and inventory weakness.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::keys::dedupe_keys;
use crate::models::MaterialFileSignature;

/// Text-quality label to score.
pub fn text_score(label: &str) -> f64 {
    match label.trim().to_ascii_lowercase().as_str() {
        "high" => 1.0,
        "medium" => 0.7,
        _ => 0.3,
    }
}

/// `((text_score + coverage) / 2) × (0.6 if fewer than 6 keys)`.
pub fn signature_quality_score(sig: &MaterialFileSignature) -> f64 {
    let coverage = if sig.quality.coverage.is_finite() {
        sig.quality.coverage.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let base = (text_score(&sig.quality.text_quality) + coverage) / 2.0;
    if dedupe_keys(&sig.concept_keys).len() < 6 {
        base * 0.6
    } else {
        base
    }
}

#[derive(Debug, Clone)]
pub struct SeedThresholds {
    pub min_files: usize,
    pub min_keys: usize,
    pub min_quality: f64,
}

impl Default for SeedThresholds {
    fn default() -> Self {
        Self {
            min_files: 1,
            min_keys: 8,
            min_quality: 0.55,
        }
    }
}

/// Seed keys per file, plus the aggregate facts the usability check needs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SeedSet {
    pub by_file: BTreeMap<Uuid, Vec<String>>,
    pub files_with_seeds: usize,
    pub unique_keys: usize,
    pub avg_quality: f64,
}

impl SeedSet {
    pub fn from_signatures(signatures: &[MaterialFileSignature]) -> Self {
        let mut by_file = BTreeMap::new();
        let mut all: BTreeSet<String> = BTreeSet::new();
        let mut quality_sum = 0.0;
        for sig in signatures {
            let keys = dedupe_keys(&sig.concept_keys);
            if keys.is_empty() {
                continue;
            }
            quality_sum += signature_quality_score(sig);
            all.extend(keys.iter().cloned());
            by_file.insert(sig.material_file_id, keys);
        }
        let files_with_seeds = by_file.len();
        Self {
            by_file,
            files_with_seeds,
            unique_keys: all.len(),
            avg_quality: if files_with_seeds > 0 {
                quality_sum / files_with_seeds as f64
            } else {
                0.0
            },
        }
    }

    /// `min_quality` should already be content-type adjusted.
    pub fn is_usable(&self, t: &SeedThresholds) -> bool {
        self.files_with_seeds >= t.min_files.max(1) && self.unique_keys >= t.min_keys && self.avg_quality >= t.min_quality
    }

    pub fn all_keys(&self) -> BTreeSet<String> {
        self.by_file.values().flatten().cloned().collect()
    }

    pub fn for_file(&self, file_id: Uuid) -> &[String] {
        self.by_file.get(&file_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone)]
pub struct WeaknessThresholds {
    pub min_concepts: usize,
    pub min_coverage_conf: f64,
}

impl Default for WeaknessThresholds {
    fn default() -> Self {
        Self {
            min_concepts: 6,
            min_coverage_conf: 0.55,
        }
    }
}

/// An inventory is weak with too few concepts, under half the seed keys
/// surviving, or low self-reported coverage confidence.
pub fn inventory_is_weak(
    keys: &BTreeSet<String>,
    seed_keys: &BTreeSet<String>,
    coverage_confidence: f64,
    t: &WeaknessThresholds,
) -> bool {
    if keys.len() < t.min_concepts {
        return true;
    }
    if !seed_keys.is_empty() {
        let survived = seed_keys.intersection(keys).count();
        if survived * 2 < seed_keys.len() {
            return true;
        }
    }
    coverage_confidence < t.min_coverage_conf
}

/// True when seeded results disagree enough with their seeds to warrant
/// an unseeded rerun: fewer than a quarter of the seeds reappear.
pub fn seeded_result_disagrees(result_keys: &BTreeSet<String>, seeds: &[String]) -> bool {
    if seeds.is_empty() {
        return false;
    }
    let hits = seeds.iter().filter(|s| result_keys.contains(*s)).count();
    hits * 4 < seeds.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignatureQuality;
    use chrono::Utc;

    fn sig(keys: &[&str], q: &str, cov: f64) -> MaterialFileSignature {
        MaterialFileSignature {
            material_file_id: Uuid::new_v4(),
            version: 1,
            fingerprint: "f".into(),
            concept_keys: keys.iter().map(|s| s.to_string()).collect(),
            quality: SignatureQuality {
                text_quality: q.into(),
                coverage: cov,
            },
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_quality_score() {
        let many = ["a", "b", "c", "d", "e", "f"];
        assert!((signature_quality_score(&sig(&many, "high", 0.8)) - 0.9).abs() < 1e-9);
        assert!((signature_quality_score(&sig(&["a"], "high", 0.8)) - 0.54).abs() < 1e-9);
        assert!((signature_quality_score(&sig(&many, "medium", 0.7)) - 0.7).abs() < 1e-9);
        assert!((signature_quality_score(&sig(&many, "low", 0.3)) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_seed_set_usable() {
        let a = sig(&["a", "b", "c", "d", "e", "f"], "high", 0.9);
        let b = sig(&["g", "h", "i", "j", "k", "l"], "high", 0.9);
        let set = SeedSet::from_signatures(&[a, b, sig(&[], "high", 1.0)]);
        assert_eq!(set.files_with_seeds, 2);
        assert_eq!(set.unique_keys, 12);
        assert!(set.is_usable(&SeedThresholds::default()));
        let strict = SeedThresholds {
            min_files: 3,
            ..Default::default()
        };
        assert!(!set.is_usable(&strict));
    }

    #[test]
    fn test_inventory_weakness() {
        let t = WeaknessThresholds::default();
        let keys: BTreeSet<String> = ["a", "b", "c", "d", "e", "f"].iter().map(|s| s.to_string()).collect();
        let none = BTreeSet::new();
        assert!(!inventory_is_weak(&keys, &none, 0.8, &t));
        assert!(inventory_is_weak(&keys, &none, 0.2, &t));
        let seeds: BTreeSet<String> = ["x", "y", "z", "a"].iter().map(|s| s.to_string()).collect();
        assert!(inventory_is_weak(&keys, &seeds, 0.9, &t));
        let few: BTreeSet<String> = ["a"].iter().map(|s| s.to_string()).collect();
        assert!(inventory_is_weak(&few, &none, 0.9, &t));
    }

    #[test]
    fn test_seeded_disagreement() {
        let result: BTreeSet<String> = ["a"].iter().map(|s| s.to_string()).collect();
        let seeds: Vec<String> = ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect();
        assert!(seeded_result_disagrees(&result, &seeds));
        assert!(!seeded_result_disagrees(&result, &seeds[..2]));
    }
}
