//! Prompt builders and response decoders.
//!
//! Every prompt carries a JSON schema and a `schema_name`; responses are
//! decoded item by item so one malformed entry never discards the rest.
//! Dropped items are counted and logged by the callers.

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use pathweaver_core::edges::EdgeItem;
use pathweaver_core::formulas::{FormulaResult, FormulaTask};
use pathweaver_core::inventory::{Alignment, ConceptInventory, ConceptItem, CoverageReport};

use crate::llm::Prompt;

pub const INVENTORY_SCHEMA: &str = "concept_inventory";
pub const DELTA_SCHEMA: &str = "concept_inventory_delta";
pub const ASSUMED_SCHEMA: &str = "assumed_knowledge";
pub const ALIGNMENT_SCHEMA: &str = "concept_alignment";
pub const EDGES_SCHEMA: &str = "concept_edges";
pub const FORMULA_SCHEMA: &str = "formula_extraction";
pub const ACTIVITY_SCHEMA: &str = "activity_content";

/// Marker that precedes validator feedback on activity retries.
pub const VALIDATION_FEEDBACK_MARKER: &str = "VALIDATION_ERRORS_TO_FIX:";

const GROUNDING_RULES: &str = "Only use the excerpts provided. Cite chunk IDs exactly as given in \
[chunk_id=...] markers. Do not invent chunk IDs. Keys are lowercase snake_case.";

fn concept_item_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "key": {"type": "string"},
            "name": {"type": "string"},
            "parent_key": {"type": "string"},
            "summary": {"type": "string"},
            "key_points": {"type": "array", "items": {"type": "string"}},
            "aliases": {"type": "array", "items": {"type": "string"}},
            "importance": {"type": "integer"},
            "citations": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["key", "name", "parent_key", "summary", "key_points", "aliases", "importance", "citations"],
        "additionalProperties": false
    })
}

fn coverage_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "confidence": {"type": "number"},
            "missing_topics": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["confidence", "missing_topics"],
        "additionalProperties": false
    })
}

fn section(label: &str, body: &str) -> String {
    if body.trim().is_empty() {
        return String::new();
    }
    format!("{}:\n{}\n\n", label, body.trim())
}

/// Inputs shared by per-file, seeded and global inventory prompts.
#[derive(Debug, Default)]
pub struct InventoryRequest<'a> {
    pub intent_md: &'a str,
    pub charter: &'a str,
    pub excerpts: &'a str,
    /// Empty means unseeded.
    pub seed_keys: &'a [String],
    /// Rendered cross-document section graph, global pass only.
    pub section_graph: Option<&'a Value>,
    pub file_name: Option<&'a str>,
}

pub fn inventory_prompt(req: &InventoryRequest<'_>) -> Prompt {
    let scope = match req.file_name {
        Some(name) => format!("the file \"{}\"", name),
        None => "the whole material set".to_string(),
    };
    let system = format!(
        "You build a concept inventory for a learner from {}. List every teachable concept with a \
         parent_key for hierarchy (empty for roots). Then assess coverage: confidence in [0,1] that the \
         list covers the material, and missing_topics you saw but could not list. {}",
        scope, GROUNDING_RULES
    );
    let mut user = String::new();
    user.push_str(&section("LEARNER_GOAL", req.intent_md));
    user.push_str(&section("PATH_CHARTER", req.charter));
    if !req.seed_keys.is_empty() {
        user.push_str(&section(
            "SEED_CONCEPT_KEYS (known to appear; confirm, refine, extend)",
            &req.seed_keys.join("\n"),
        ));
    }
    if let Some(graph) = req.section_graph {
        user.push_str(&section(
            "CROSS_DOCUMENT_SECTIONS",
            &serde_json::to_string(graph).unwrap_or_default(),
        ));
    }
    user.push_str(&section("EXCERPTS", req.excerpts));
    Prompt {
        system,
        user,
        schema_name: INVENTORY_SCHEMA,
        schema: json!({
            "type": "object",
            "properties": {
                "concepts": {"type": "array", "items": concept_item_schema()},
                "coverage": coverage_schema()
            },
            "required": ["concepts", "coverage"],
            "additionalProperties": false
        }),
    }
}

pub fn delta_prompt(intent_md: &str, existing_summary: &str, excerpts: &str, missing_topics: &[String]) -> Prompt {
    let system = format!(
        "You extend an existing concept inventory. Propose ONLY concepts that are not already listed. \
         Report the topics still missing after your additions and your confidence in [0,1] that the \
         inventory now covers the material. {}",
        GROUNDING_RULES
    );
    let mut user = String::new();
    user.push_str(&section("LEARNER_GOAL", intent_md));
    user.push_str(&section("EXISTING_CONCEPTS (key | name | parent | summary)", existing_summary));
    user.push_str(&section("MISSING_TOPICS", &missing_topics.join("\n")));
    user.push_str(&section("EXCERPTS", excerpts));
    Prompt {
        system,
        user,
        schema_name: DELTA_SCHEMA,
        schema: json!({
            "type": "object",
            "properties": {
                "new_concepts": {"type": "array", "items": concept_item_schema()},
                "missing_topics": {"type": "array", "items": {"type": "string"}},
                "confidence": {"type": "number"}
            },
            "required": ["new_concepts", "missing_topics", "confidence"],
            "additionalProperties": false
        }),
    }
}

pub fn assumed_knowledge_prompt(intent_md: &str, concept_summary: &str) -> Prompt {
    let mut item = concept_item_schema();
    item["properties"]["required_by"] = json!({"type": "array", "items": {"type": "string"}});
    if let Some(req) = item["required"].as_array_mut() {
        req.push(json!("required_by"));
    }
    let mut user = String::new();
    user.push_str(&section("LEARNER_GOAL", intent_md));
    user.push_str(&section("CONCEPTS", concept_summary));
    Prompt {
        system: "List prerequisite knowledge the material assumes but does not teach. For each, \
                 give required_by: the keys of listed concepts that depend on it. Reuse an existing \
                 key when the prerequisite is already listed."
            .to_string(),
        user,
        schema_name: ASSUMED_SCHEMA,
        schema: json!({
            "type": "object",
            "properties": {"concepts": {"type": "array", "items": item}},
            "required": ["concepts"],
            "additionalProperties": false
        }),
    }
}

pub fn alignment_prompt(concept_summary: &str) -> Prompt {
    Prompt {
        system: "Review a concept list for naming problems. Report alias groups (different keys for \
                 the same concept; pick one canonical_key) and splits (one key covering distinct \
                 meanings; give one item per meaning). Report nothing when the list is clean."
            .to_string(),
        user: section("CONCEPTS", concept_summary),
        schema_name: ALIGNMENT_SCHEMA,
        schema: json!({
            "type": "object",
            "properties": {
                "aliases": {"type": "array", "items": {
                    "type": "object",
                    "properties": {
                        "canonical_key": {"type": "string"},
                        "alias_keys": {"type": "array", "items": {"type": "string"}},
                        "rationale": {"type": "string"}
                    },
                    "required": ["canonical_key", "alias_keys", "rationale"],
                    "additionalProperties": false
                }},
                "splits": {"type": "array", "items": {
                    "type": "object",
                    "properties": {
                        "ambiguous_key": {"type": "string"},
                        "meanings": {"type": "array", "items": concept_item_schema()},
                        "rationale": {"type": "string"}
                    },
                    "required": ["ambiguous_key", "meanings", "rationale"],
                    "additionalProperties": false
                }}
            },
            "required": ["aliases", "splits"],
            "additionalProperties": false
        }),
    }
}

pub fn edges_prompt(concept_summary: &str, excerpts: &str) -> Prompt {
    let system = format!(
        "Connect the listed concepts. edge_type is one of prereq (from must be learned before to), \
         related, analogy. strength in [0,1]. Use only listed keys. {}",
        GROUNDING_RULES
    );
    let mut user = String::new();
    user.push_str(&section("CONCEPTS", concept_summary));
    user.push_str(&section("EXCERPTS", excerpts));
    Prompt {
        system,
        user,
        schema_name: EDGES_SCHEMA,
        schema: json!({
            "type": "object",
            "properties": {"edges": {"type": "array", "items": {
                "type": "object",
                "properties": {
                    "from_key": {"type": "string"},
                    "to_key": {"type": "string"},
                    "edge_type": {"type": "string", "enum": ["prereq", "related", "analogy"]},
                    "strength": {"type": "number"},
                    "rationale": {"type": "string"},
                    "citations": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["from_key", "to_key", "edge_type", "strength", "rationale", "citations"],
                "additionalProperties": false
            }}},
            "required": ["edges"],
            "additionalProperties": false
        }),
    }
}

pub fn formula_prompt(tasks: &[FormulaTask]) -> Prompt {
    Prompt {
        system: "For each chunk, turn the candidate expressions into LaTeX (formula_latex) and a plain \
                 symbolic form (formula_symbolic). Skip candidates that are not formulas. Echo chunk_id."
            .to_string(),
        user: section("CANDIDATES", &serde_json::to_string_pretty(tasks).unwrap_or_default()),
        schema_name: FORMULA_SCHEMA,
        schema: json!({
            "type": "object",
            "properties": {"formulas": {"type": "array", "items": {
                "type": "object",
                "properties": {
                    "chunk_id": {"type": "string"},
                    "formula_latex": {"type": "array", "items": {"type": "string"}},
                    "formula_symbolic": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["chunk_id", "formula_latex", "formula_symbolic"],
                "additionalProperties": false
            }}},
            "required": ["formulas"],
            "additionalProperties": false
        }),
    }
}

/// Inputs to the activity-content prompt.
#[derive(Debug, Default)]
pub struct ActivityRequest<'a> {
    pub kind: &'a str,
    pub node_title: &'a str,
    pub node_goal: &'a str,
    pub concept_keys: &'a [String],
    pub excerpts: &'a str,
    pub user_profile_doc: &'a str,
    pub charter: &'a str,
    pub knowledge_context: &'a str,
    pub estimated_minutes: i32,
    /// Validator errors from the previous attempt.
    pub validation_errors: &'a [String],
}

pub fn activity_prompt(req: &ActivityRequest<'_>) -> Prompt {
    let system = format!(
        "Write a {} activity as content blocks (heading, paragraph, callout, list, code, equation, \
         divider). Start with a heading. Lessons include a \"Worked example\" section and a \"Quick check\" \
         section. Ground every claim in the excerpts and list the chunk IDs you used in citations. {}",
        req.kind, GROUNDING_RULES
    );
    let mut user = String::new();
    user.push_str(&section("USER_PROFILE", req.user_profile_doc));
    user.push_str(&section("PATH_CHARTER", req.charter));
    user.push_str(&section("LEARNER_KNOWLEDGE", req.knowledge_context));
    user.push_str(&section("NODE", &format!("{}\n{}", req.node_title, req.node_goal)));
    user.push_str(&section("CONCEPT_KEYS", &req.concept_keys.join(", ")));
    user.push_str(&format!("TARGET_MINUTES: {}\n\n", req.estimated_minutes.max(1)));
    user.push_str(&section("EXCERPTS", req.excerpts));
    if !req.validation_errors.is_empty() {
        user.push_str(VALIDATION_FEEDBACK_MARKER);
        user.push('\n');
        for e in req.validation_errors {
            user.push_str("- ");
            user.push_str(e);
            user.push('\n');
        }
    }
    Prompt {
        system,
        user,
        schema_name: ACTIVITY_SCHEMA,
        schema: json!({
            "type": "object",
            "properties": {
                "title": {"type": "string"},
                "estimated_minutes": {"type": "integer"},
                "content_json": {
                    "type": "object",
                    "properties": {"blocks": {"type": "array", "items": {"type": "object"}}},
                    "required": ["blocks"]
                },
                "citations": {"type": "array", "items": {"type": "string"}},
                "concept_keys": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["title", "estimated_minutes", "content_json", "citations", "concept_keys"]
        }),
    }
}

// ─── decoding ───────────────────────────────────────────────────────

/// Decode `value[field]` item by item. Returns the items and how many
/// were malformed. A missing or non-array field yields nothing.
pub fn decode_list<T: DeserializeOwned>(value: &Value, field: &str) -> (Vec<T>, usize) {
    let Some(items) = value.get(field).and_then(Value::as_array) else {
        return (Vec::new(), 0);
    };
    let mut out = Vec::with_capacity(items.len());
    let mut dropped = 0;
    for item in items {
        match serde_json::from_value::<T>(item.clone()) {
            Ok(v) => out.push(v),
            Err(_) => dropped += 1,
        }
    }
    (out, dropped)
}

pub fn decode_inventory(value: &Value) -> (ConceptInventory, usize) {
    let (concepts, dropped) = decode_list::<ConceptItem>(value, "concepts");
    let coverage = value
        .get("coverage")
        .and_then(|c| serde_json::from_value::<CoverageReport>(c.clone()).ok())
        .unwrap_or_default()
        .normalized();
    (ConceptInventory { concepts, coverage }, dropped)
}

pub fn decode_delta(value: &Value) -> (Vec<ConceptItem>, CoverageReport, usize) {
    let (concepts, dropped) = decode_list::<ConceptItem>(value, "new_concepts");
    let (missing_topics, _) = decode_list::<String>(value, "missing_topics");
    let confidence = value.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
    let coverage = CoverageReport {
        confidence,
        missing_topics,
    }
    .normalized();
    (concepts, coverage, dropped)
}

pub fn decode_assumed(value: &Value) -> (Vec<ConceptItem>, usize) {
    decode_list(value, "concepts")
}

pub fn decode_alignment(value: &Value) -> Alignment {
    let (aliases, _) = decode_list(value, "aliases");
    let (splits, _) = decode_list(value, "splits");
    Alignment { aliases, splits }
}

pub fn decode_edges(value: &Value) -> (Vec<EdgeItem>, usize) {
    decode_list(value, "edges")
}

pub fn decode_formulas(value: &Value) -> (Vec<FormulaResult>, usize) {
    decode_list(value, "formulas")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_list_drops_malformed_items() {
        let v = json!({"edges": [
            {"from_key": "a", "to_key": "b", "edge_type": "prereq", "strength": 0.9},
            "garbage",
            {"from_key": "b", "to_key": "c", "strength": "high"}
        ]});
        let (edges, dropped) = decode_edges(&v);
        assert_eq!(edges.len(), 1);
        assert_eq!(dropped, 2);
        assert_eq!(decode_edges(&json!({})).0.len(), 0);
    }

    #[test]
    fn decode_inventory_normalizes_coverage() {
        let v = json!({
            "concepts": [{"key": "bayes", "name": "Bayes"}],
            "coverage": {"confidence": 1.7, "missing_topics": ["Priors", "priors", " "]}
        });
        let (inv, dropped) = decode_inventory(&v);
        assert_eq!(dropped, 0);
        assert_eq!(inv.concepts[0].key, "bayes");
        assert_eq!(inv.coverage.confidence, 1.0);
        assert_eq!(inv.coverage.missing_topics, vec!["Priors"]);
    }

    #[test]
    fn decode_delta_reads_flat_shape() {
        let v = json!({"new_concepts": [], "missing_topics": ["x"], "confidence": 0.4});
        let (items, cov, _) = decode_delta(&v);
        assert!(items.is_empty());
        assert_eq!(cov.missing_topics, vec!["x"]);
        assert!((cov.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn activity_prompt_appends_feedback() {
        let errors = vec!["word count 300 < 350".to_string()];
        let p = activity_prompt(&ActivityRequest {
            kind: "drill",
            node_title: "Node",
            validation_errors: &errors,
            ..Default::default()
        });
        assert!(p.user.contains(VALIDATION_FEEDBACK_MARKER));
        assert!(p.user.contains("word count 300 < 350"));
        assert_eq!(p.schema_name, ACTIVITY_SCHEMA);

        let clean = activity_prompt(&ActivityRequest {
            kind: "drill",
            ..Default::default()
        });
        assert!(!clean.user.contains(VALIDATION_FEEDBACK_MARKER));
    }

    #[test]
    fn seeded_inventory_mentions_seeds() {
        let seeds = vec!["bayes_theorem".to_string()];
        let p = inventory_prompt(&InventoryRequest {
            excerpts: "[chunk_id=x] text",
            seed_keys: &seeds,
            file_name: Some("notes.pdf"),
            ..Default::default()
        });
        assert!(p.user.contains("bayes_theorem"));
        assert!(p.system.contains("notes.pdf"));
    }
}
