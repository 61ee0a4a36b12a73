//! Typed view over the additive path metadata blob.
//!
//! Path metadata is a JSON object that several producers write into. Only
//! the keys in [`ALLOWED_KEYS`] may be merged by stages; everything else is
//! preserved untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::keys::parse_uuids;

/// Keys a stage may merge into path metadata.
pub const ALLOWED_KEYS: [&str; 6] = [
    "intake",
    "intake_md",
    "intake_material_filter",
    "charter",
    "web_resources_seed",
    "web_resources_consent",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Intake {
    #[serde(default)]
    pub paths_confirmed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaterialFilter {
    #[serde(default)]
    pub include_file_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebResourcesSeed {
    #[serde(default)]
    pub spec: Value,
    #[serde(default)]
    pub planned: i64,
    #[serde(default)]
    pub fetched: i64,
    #[serde(default)]
    pub updated: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub max_fetch: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebResourcesConsent {
    #[serde(default)]
    pub allowed: bool,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub version: i64,
}

/// Decoded path metadata. Malformed sections decode as absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathMeta {
    pub intake: Option<Intake>,
    pub intake_md: String,
    pub material_filter: Option<MaterialFilter>,
    pub charter: Option<Value>,
    pub web_resources_seed: Option<WebResourcesSeed>,
    pub web_resources_consent: Option<WebResourcesConsent>,
}

impl PathMeta {
    pub fn from_value(v: &Value) -> Self {
        let obj = match v.as_object() {
            Some(o) => o,
            None => return Self::default(),
        };
        fn section<T: serde::de::DeserializeOwned>(obj: &Map<String, Value>, key: &str) -> Option<T> {
            obj.get(key)
                .filter(|v| !v.is_null())
                .and_then(|v| serde_json::from_value(v.clone()).ok())
        }
        Self {
            intake: section(obj, "intake"),
            intake_md: obj
                .get("intake_md")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string(),
            material_filter: section(obj, "intake_material_filter"),
            charter: obj.get("charter").filter(|v| !v.is_null()).cloned(),
            web_resources_seed: section(obj, "web_resources_seed"),
            web_resources_consent: section(obj, "web_resources_consent"),
        }
    }

    /// Whether the learner confirmed the path. Missing intake counts as no.
    pub fn paths_confirmed(&self) -> bool {
        self.intake.as_ref().map(|i| i.paths_confirmed).unwrap_or(false)
    }

    /// Parsed file allowlist; empty means "all files".
    pub fn allowed_file_ids(&self) -> Vec<Uuid> {
        self.material_filter
            .as_ref()
            .map(|f| parse_uuids(&f.include_file_ids))
            .unwrap_or_default()
    }

    /// Charter rendered for prompts, empty when absent.
    pub fn charter_text(&self) -> String {
        match &self.charter {
            Some(Value::String(s)) => s.clone(),
            Some(v) => serde_json::to_string_pretty(v).unwrap_or_default(),
            None => String::new(),
        }
    }
}

/// Merge `patch` into `base`, accepting only allowlisted top-level keys.
///
/// Returns the names of the keys that were rejected. A non-object `base`
/// is replaced by an empty object before merging.
pub fn merge_allowed(base: &mut Value, patch: &Map<String, Value>) -> Vec<String> {
    if !base.is_object() {
        *base = Value::Object(Map::new());
    }
    let mut rejected = Vec::new();
    if let Some(obj) = base.as_object_mut() {
        for (k, v) in patch {
            if ALLOWED_KEYS.contains(&k.as_str()) {
                obj.insert(k.clone(), v.clone());
            } else {
                rejected.push(k.clone());
            }
        }
    }
    rejected.sort();
    rejected
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_full() {
        let id = Uuid::new_v4();
        let v = json!({
            "intake": {"paths_confirmed": true},
            "intake_md": "  learn stats  ",
            "intake_material_filter": {"include_file_ids": [id.to_string(), "bogus"]},
            "charter": {"tone": "friendly"},
            "other": 1
        });
        let m = PathMeta::from_value(&v);
        assert!(m.paths_confirmed());
        assert_eq!(m.intake_md, "learn stats");
        assert_eq!(m.allowed_file_ids(), vec![id]);
        assert!(m.charter_text().contains("friendly"));
    }

    #[test]
    fn test_decode_missing_and_malformed() {
        let m = PathMeta::from_value(&json!({"intake": "yes"}));
        assert!(!m.paths_confirmed());
        assert!(m.allowed_file_ids().is_empty());
        assert_eq!(PathMeta::from_value(&Value::Null), PathMeta::default());
    }

    #[test]
    fn test_merge_allowed_rejects_unknown() {
        let mut base = json!({"keep": 1, "intake_md": "old"});
        let patch = json!({"intake_md": "new", "secret_stuff": true, "charter": "c"});
        let rejected = merge_allowed(&mut base, patch.as_object().unwrap());
        assert_eq!(rejected, vec!["secret_stuff"]);
        assert_eq!(base["keep"], 1);
        assert_eq!(base["intake_md"], "new");
        assert_eq!(base["charter"], "c");
        assert!(base.get("secret_stuff").is_none());
    }
}
