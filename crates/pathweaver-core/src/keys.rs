//! Canonical keys, deduplication and deterministic hashing.
//!
//! Concept keys follow a small grammar: lowercase ASCII letters, digits
//! and `_`, at most [`MAX_KEY_LEN`] characters, runs of anything else
//! collapsed to a single `_`, no leading or trailing `_`.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use uuid::Uuid;

/// Maximum length of a normalized concept key.
pub const MAX_KEY_LEN: usize = 64;

/// Normalize free text into a canonical concept key.
///
/// Idempotent: `normalize_concept_key(normalize_concept_key(s)) ==
/// normalize_concept_key(s)`. Returns an empty string when the input has
/// no ASCII alphanumerics.
///
/// ```rust
/// use pathweaver_core::keys::normalize_concept_key;
///
/// assert_eq!(normalize_concept_key("  Bayes' Theorem! "), "bayes_theorem");
/// assert_eq!(normalize_concept_key("__k-means++__"), "k_means");
/// ```
pub fn normalize_concept_key(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_KEY_LEN + 1));
    let mut pending_sep = false;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch.to_ascii_lowercase());
            if out.len() >= MAX_KEY_LEN {
                break;
            }
        } else {
            pending_sep = true;
        }
    }
    out.truncate(MAX_KEY_LEN);
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Trim, drop empties and remove duplicates, keeping first occurrence order.
pub fn dedupe_strings<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let trimmed = item.as_ref().trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            out.push(trimmed.to_string());
        }
    }
    out
}

/// Normalize every entry as a concept key and dedupe, keeping order.
pub fn dedupe_keys<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    dedupe_strings(items.into_iter().map(|s| normalize_concept_key(s.as_ref())))
}

/// Remove duplicate and nil UUIDs, keeping first occurrence order.
pub fn dedupe_uuids<I>(items: I) -> Vec<Uuid>
where
    I: IntoIterator<Item = Uuid>,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|id| !id.is_nil() && seen.insert(*id))
        .collect()
}

/// Parse UUID strings, silently dropping malformed entries.
pub fn parse_uuids<I, S>(items: I) -> Vec<Uuid>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    dedupe_uuids(
        items
            .into_iter()
            .filter_map(|s| Uuid::parse_str(s.as_ref().trim()).ok()),
    )
}

/// Hex-encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// 64-bit FNV-1a.
pub fn fnv64a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Advisory lock key for `pg_advisory_xact_lock`: `FNV64a(namespace ":" path_id)`.
pub fn advisory_key64(namespace: &str, path_id: Uuid) -> i64 {
    let material = format!("{}:{}", namespace, path_id);
    fnv64a(material.as_bytes()) as i64
}

/// Order-independent signature of a group of concept IDs.
pub fn signature_for_concept_ids(ids: &[Uuid]) -> String {
    let mut sorted: Vec<String> = dedupe_uuids(ids.iter().copied())
        .into_iter()
        .map(|id| id.to_string())
        .collect();
    sorted.sort();
    sha256_hex(sorted.join(",").as_bytes())
}

/// Deterministic UUID for an entity derived from its natural key.
///
/// Stage outputs use this so that identical inputs produce bit-identical
/// row IDs across runs.
pub fn stable_id(namespace: Uuid, parts: &[&str]) -> Uuid {
    Uuid::new_v5(&namespace, parts.join("\u{1f}").as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_key(k: &str) -> bool {
        k.len() <= MAX_KEY_LEN
            && !k.starts_with('_')
            && !k.ends_with('_')
            && !k.contains("__")
            && k.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    }

    #[test]
    fn test_normalize_basic() {
        assert_eq!(normalize_concept_key("Linear Regression"), "linear_regression");
        assert_eq!(normalize_concept_key("  --A/B  testing--"), "a_b_testing");
        assert_eq!(normalize_concept_key("Gradient–Descent (SGD)"), "gradient_descent_sgd");
        assert_eq!(normalize_concept_key("!!!"), "");
        assert_eq!(normalize_concept_key(""), "");
    }

    #[test]
    fn test_normalize_idempotent_and_valid() {
        let inputs = [
            "Fourier Transform",
            "__already_normal__",
            "ÉCOLE normale supérieure",
            "a    b\t\tc",
            &"very long concept name ".repeat(10),
            "x_____________________________________________________________________y",
        ];
        for input in inputs {
            let once = normalize_concept_key(input);
            let twice = normalize_concept_key(&once);
            assert_eq!(once, twice, "not idempotent for {:?}", input);
            assert!(valid_key(&once), "invalid key {:?} from {:?}", once, input);
        }
    }

    #[test]
    fn test_normalize_truncates_without_trailing_underscore() {
        let input = format!("{} tail", "a".repeat(63));
        let key = normalize_concept_key(&input);
        assert_eq!(key.len(), 63);
        assert!(!key.ends_with('_'));
    }

    #[test]
    fn test_dedupe_strings_keeps_order() {
        let out = dedupe_strings(["b", " a ", "b", "", "c", "a"]);
        assert_eq!(out, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_dedupe_uuids_drops_nil() {
        let a = Uuid::new_v4();
        let out = dedupe_uuids([a, Uuid::nil(), a]);
        assert_eq!(out, vec![a]);
    }

    #[test]
    fn test_fnv64a_known_vectors() {
        assert_eq!(fnv64a(b""), 0xcbf29ce484222325);
        assert_eq!(fnv64a(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn test_advisory_namespaces_differ() {
        for _ in 0..32 {
            let p = Uuid::new_v4();
            assert_ne!(
                advisory_key64("concept_graph_build", p),
                advisory_key64("concept_canonicalize", p)
            );
        }
    }

    #[test]
    fn test_signature_permutation_invariant() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let base = signature_for_concept_ids(&[a, b, c]);
        for perm in [[a, c, b], [b, a, c], [b, c, a], [c, a, b], [c, b, a]] {
            assert_eq!(signature_for_concept_ids(&perm), base);
        }
        assert_eq!(signature_for_concept_ids(&[a, b, c, a]), base);
        assert_ne!(signature_for_concept_ids(&[a, b]), base);
    }

    #[test]
    fn test_stable_id_deterministic() {
        let ns = Uuid::new_v4();
        assert_eq!(stable_id(ns, &["x", "y"]), stable_id(ns, &["x", "y"]));
        assert_ne!(stable_id(ns, &["x", "y"]), stable_id(ns, &["xy"]));
    }
}
