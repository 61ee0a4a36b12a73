//! Activity content blocks: decoding, validation and auto-repair.
//!
//! [`repair`] is a fixed point: running it on its own output returns the
//! same blocks. Padding is deterministic for a given offset so reruns with
//! identical model output produce identical content.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::text::word_count;

/// One block of activity content, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Heading {
        #[serde(default = "default_heading_level")]
        level: u8,
        text: String,
    },
    Paragraph {
        text: String,
    },
    Callout {
        #[serde(default)]
        variant: String,
        #[serde(default)]
        title: String,
        text: String,
    },
    List {
        #[serde(default)]
        ordered: bool,
        items: Vec<String>,
    },
    Code {
        #[serde(default)]
        language: String,
        code: String,
    },
    Equation {
        latex: String,
    },
    Divider,
}

fn default_heading_level() -> u8 {
    2
}

impl ContentBlock {
    fn words(&self) -> usize {
        match self {
            ContentBlock::Heading { text, .. } | ContentBlock::Paragraph { text } => word_count(text),
            ContentBlock::Callout { title, text, .. } => word_count(title) + word_count(text),
            ContentBlock::List { items, .. } => items.iter().map(|i| word_count(i)).sum(),
            ContentBlock::Code { .. } | ContentBlock::Equation { .. } | ContentBlock::Divider => 0,
        }
    }

    fn heading_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Heading { text, .. } => Some(text.as_str()),
            _ => None,
        }
    }

    fn is_paragraph(&self) -> bool {
        matches!(self, ContentBlock::Paragraph { text } if !text.trim().is_empty())
    }

    fn is_callout(&self) -> bool {
        matches!(self, ContentBlock::Callout { text, .. } if !text.trim().is_empty())
    }
}

/// Decode blocks from `{"blocks": [...]}` or a bare array.
///
/// Malformed blocks are dropped; the second value counts them.
pub fn decode_blocks(value: &Value) -> (Vec<ContentBlock>, usize) {
    let items = match value {
        Value::Array(items) => items.as_slice(),
        Value::Object(obj) => match obj.get("blocks") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };
    let mut blocks = Vec::with_capacity(items.len());
    let mut dropped = 0;
    for item in items {
        match serde_json::from_value::<ContentBlock>(item.clone()) {
            Ok(b) => blocks.push(b),
            Err(_) => dropped += 1,
        }
    }
    (blocks, dropped)
}

pub fn encode_blocks(blocks: &[ContentBlock]) -> Value {
    serde_json::json!({ "blocks": blocks })
}

/// Plain text of the blocks, used for embeddings.
pub fn blocks_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Heading { text, .. } | ContentBlock::Paragraph { text } => Some(text.clone()),
            ContentBlock::Callout { title, text, .. } => Some(format!("{} {}", title, text).trim().to_string()),
            ContentBlock::List { items, .. } => Some(items.join("\n")),
            ContentBlock::Code { code, .. } => Some(code.clone()),
            ContentBlock::Equation { latex } => Some(latex.clone()),
            ContentBlock::Divider => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Structural minima for an activity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindMinima {
    pub min_words: usize,
    pub min_paragraphs: usize,
    pub min_callouts: usize,
    pub lesson_like: bool,
}

impl KindMinima {
    /// Unknown kinds are held to the drill minima.
    pub fn for_kind(kind: &str) -> Self {
        match kind.trim().to_ascii_lowercase().as_str() {
            "reading" | "case" | "lesson" => Self {
                min_words: 900,
                min_paragraphs: 6,
                min_callouts: 1,
                lesson_like: true,
            },
            "quiz" => Self {
                min_words: 220,
                min_paragraphs: 1,
                min_callouts: 0,
                lesson_like: false,
            },
            _ => Self {
                min_words: 350,
                min_paragraphs: 2,
                min_callouts: 1,
                lesson_like: false,
            },
        }
    }
}

/// Counts the validator checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContentStats {
    pub headings: usize,
    pub paragraphs: usize,
    pub callouts: usize,
    pub words: usize,
    pub worked_example: bool,
    pub quick_check: bool,
}

pub fn content_stats(blocks: &[ContentBlock]) -> ContentStats {
    ContentStats {
        headings: blocks.iter().filter(|b| b.heading_text().is_some()).count(),
        paragraphs: blocks.iter().filter(|b| b.is_paragraph()).count(),
        callouts: blocks.iter().filter(|b| b.is_callout()).count(),
        words: blocks.iter().map(ContentBlock::words).sum(),
        worked_example: section_with_body(blocks, is_worked_example_heading).is_some(),
        quick_check: section_with_body(blocks, is_quick_check_heading).is_some(),
    }
}

fn is_worked_example_heading(text: &str) -> bool {
    text.to_lowercase().contains("worked example")
}

fn is_quick_check_heading(text: &str) -> bool {
    let t = text.to_lowercase();
    t.contains("quick check") || t.contains("self-check") || t.contains("self check")
}

/// Index of the first heading matching `pred` that is followed by a paragraph.
fn section_with_body(blocks: &[ContentBlock], pred: fn(&str) -> bool) -> Option<usize> {
    blocks.iter().enumerate().find_map(|(i, b)| {
        let text = b.heading_text()?;
        (pred(text) && blocks.get(i + 1).map(ContentBlock::is_paragraph).unwrap_or(false)).then_some(i)
    })
}

fn heading_index(blocks: &[ContentBlock], pred: fn(&str) -> bool) -> Option<usize> {
    blocks
        .iter()
        .position(|b| b.heading_text().map(pred).unwrap_or(false))
}

/// Validation errors for `blocks` under `kind`; empty when valid.
pub fn validate(blocks: &[ContentBlock], kind: &str) -> Vec<String> {
    let m = KindMinima::for_kind(kind);
    let s = content_stats(blocks);
    let mut errors = Vec::new();
    if s.headings == 0 {
        errors.push("content must contain at least one heading block".to_string());
    }
    if s.paragraphs < m.min_paragraphs {
        errors.push(format!("need at least {} paragraph blocks, found {}", m.min_paragraphs, s.paragraphs));
    }
    if s.callouts < m.min_callouts {
        errors.push(format!("need at least {} callout blocks, found {}", m.min_callouts, s.callouts));
    }
    if s.words < m.min_words {
        errors.push(format!("need at least {} words, found {}", m.min_words, s.words));
    }
    if m.lesson_like {
        if !s.worked_example {
            errors.push("missing a \"Worked example\" heading followed by a paragraph".to_string());
        }
        if !s.quick_check {
            errors.push("missing a \"Quick check\" heading followed by a paragraph".to_string());
        }
    }
    errors
}

const PADDING_SENTENCES: [&str; 10] = [
    "Restate {topic} in your own words before moving on, and note which part felt least familiar.",
    "Connect {topic} to an example from the source material and check that each step follows from the previous one.",
    "When reviewing {topic}, separate the definition from the conditions under which it applies.",
    "Try predicting the outcome of a small variation on the example above, then verify your prediction against {topic}.",
    "A common slip with {topic} is to apply it outside its assumptions, so list those assumptions explicitly.",
    "Summarize {topic} as a short checklist you could use to solve a fresh problem without notes.",
    "Compare {topic} with the closest idea you already know and name one difference that matters in practice.",
    "Return to the cited passages on {topic} and underline the sentence that carries the key claim.",
    "Explain {topic} to an imaginary peer in three sentences, keeping each sentence concrete.",
    "Write down one question about {topic} that the material leaves open, and revisit it after the next activity.",
];

const SENTENCES_PER_PAD: usize = 4;

fn padding_paragraph(topic: &str, offset: u64, n: usize) -> String {
    let len = PADDING_SENTENCES.len();
    let start = (offset as usize).wrapping_add(n.wrapping_mul(SENTENCES_PER_PAD)) % len;
    (0..SENTENCES_PER_PAD)
        .map(|i| PADDING_SENTENCES[(start + i) % len].replace("{topic}", topic))
        .collect::<Vec<_>>()
        .join(" ")
}

fn topic_for(title: &str) -> String {
    let t = title.trim();
    if t.is_empty() {
        "this topic".to_string()
    } else {
        t.to_string()
    }
}

/// Repair `blocks` toward the minima for `kind`.
///
/// `offset` rotates the padding sentences so different activities do not
/// receive identical filler.
pub fn repair(blocks: Vec<ContentBlock>, title: &str, kind: &str, offset: u64) -> Vec<ContentBlock> {
    let m = KindMinima::for_kind(kind);
    let topic = topic_for(title);
    let mut out: Vec<ContentBlock> = blocks
        .into_iter()
        .filter(|b| match b {
            ContentBlock::Heading { text, .. } | ContentBlock::Paragraph { text } => !text.trim().is_empty(),
            ContentBlock::Callout { text, .. } => !text.trim().is_empty(),
            ContentBlock::List { items, .. } => !items.is_empty(),
            _ => true,
        })
        .collect();

    if !matches!(out.first(), Some(ContentBlock::Heading { .. })) {
        out.insert(
            0,
            ContentBlock::Heading {
                level: 1,
                text: topic.clone(),
            },
        );
    }

    let mut pads = 0usize;

    if m.lesson_like {
        ensure_section(&mut out, is_worked_example_heading, "Worked example", || {
            format!(
                "Work through {} step by step: state what is given, choose the relevant rule from the material, apply it, and check the result against the source passages.",
                topic
            )
        });
        ensure_section(&mut out, is_quick_check_heading, "Quick check", || {
            format!(
                "Without looking back, answer: what is the central idea of {}, and in which situation would it not apply?",
                topic
            )
        });
    }

    // New body content goes before the closing sections so they stay last.
    let insert_at = |blocks: &[ContentBlock]| -> usize {
        [
            heading_index(blocks, is_worked_example_heading),
            heading_index(blocks, is_quick_check_heading),
        ]
        .into_iter()
        .flatten()
        .min()
        .filter(|_| m.lesson_like)
        .unwrap_or(blocks.len())
    };

    while content_stats(&out).callouts < m.min_callouts {
        let at = insert_at(&out);
        out.insert(
            at,
            ContentBlock::Callout {
                variant: "tip".to_string(),
                title: "Key takeaway".to_string(),
                text: padding_paragraph(&topic, offset, pads),
            },
        );
        pads += 1;
    }

    while content_stats(&out).paragraphs < m.min_paragraphs {
        let at = insert_at(&out);
        out.insert(
            at,
            ContentBlock::Paragraph {
                text: padding_paragraph(&topic, offset, pads),
            },
        );
        pads += 1;
    }

    while content_stats(&out).words < m.min_words {
        let at = insert_at(&out);
        out.insert(
            at,
            ContentBlock::Paragraph {
                text: padding_paragraph(&topic, offset, pads),
            },
        );
        pads += 1;
    }

    out
}

fn ensure_section<F: Fn() -> String>(blocks: &mut Vec<ContentBlock>, pred: fn(&str) -> bool, heading: &str, body: F) {
    if section_with_body(blocks, pred).is_some() {
        return;
    }
    match heading_index(blocks, pred) {
        Some(i) => blocks.insert(i + 1, ContentBlock::Paragraph { text: body() }),
        None => {
            blocks.push(ContentBlock::Heading {
                level: 2,
                text: heading.to_string(),
            });
            blocks.push(ContentBlock::Paragraph { text: body() });
        }
    }
}

/// Model output for one activity slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityDraft {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub estimated_minutes: i32,
    #[serde(default)]
    pub content_json: Value,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub concept_keys: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn para(words: usize) -> ContentBlock {
        ContentBlock::Paragraph {
            text: vec!["word"; words].join(" "),
        }
    }

    #[test]
    fn test_decode_drops_malformed() {
        let v = json!({"blocks": [
            {"type": "heading", "text": "Intro"},
            {"type": "paragraph", "text": "Body"},
            {"type": "hologram", "text": "?"},
            {"type": "paragraph"},
            {"type": "divider"}
        ]});
        let (blocks, dropped) = decode_blocks(&v);
        assert_eq!(blocks.len(), 3);
        assert_eq!(dropped, 2);
        assert_eq!(blocks[0], ContentBlock::Heading { level: 2, text: "Intro".into() });
    }

    #[test]
    fn test_near_miss_drill_is_padded() {
        let blocks = vec![
            ContentBlock::Heading { level: 1, text: "Drill".into() },
            para(150),
            para(150),
            ContentBlock::Callout {
                variant: "tip".into(),
                title: String::new(),
                text: vec!["word"; 24].join(" "),
            },
        ];
        assert_eq!(content_stats(&blocks).words, 325);
        assert!(!validate(&blocks, "drill").is_empty());
        let repaired = repair(blocks, "Gradient descent", "drill", 3);
        assert!(content_stats(&repaired).words >= 350);
        assert!(validate(&repaired, "drill").is_empty());
    }

    #[test]
    fn test_reading_repair_adds_sections_and_validates() {
        let blocks = vec![para(40)];
        let repaired = repair(blocks, "Bayes theorem", "reading", 0);
        assert!(validate(&repaired, "reading").is_empty(), "{:?}", validate(&repaired, "reading"));
        assert!(matches!(repaired[0], ContentBlock::Heading { level: 1, .. }));
        let n = repaired.len();
        assert_eq!(repaired[n - 2].heading_text(), Some("Quick check"));
    }

    #[test]
    fn test_repair_is_fixed_point() {
        for kind in ["reading", "drill", "quiz", "lesson", "mystery"] {
            for offset in [0u64, 7, 1234567] {
                let once = repair(vec![para(10)], "Topic", kind, offset);
                let twice = repair(once.clone(), "Topic", kind, offset);
                assert_eq!(once, twice, "kind {} offset {}", kind, offset);
            }
        }
    }

    #[test]
    fn test_padding_rotates_by_offset() {
        let a = repair(vec![], "T", "quiz", 0);
        let b = repair(vec![], "T", "quiz", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_existing_heading_without_body_gets_body() {
        let blocks = vec![
            ContentBlock::Heading { level: 1, text: "Lesson".into() },
            ContentBlock::Heading { level: 2, text: "Worked Example".into() },
        ];
        let repaired = repair(blocks, "L", "lesson", 0);
        assert!(content_stats(&repaired).worked_example);
        assert_eq!(
            repaired.iter().filter(|b| b.heading_text().map(is_worked_example_heading).unwrap_or(false)).count(),
            1
        );
    }
}
