//! Promotion rules for compound concept groups (PSUs) and misconception
//! signature inference.
//!
//! A PSU is a set of concepts that a learner masters together. Groups are
//! identified by [`signature_for_concept_ids`](crate::keys::signature_for_concept_ids),
//! so the same members in any order map to the same PSU.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::keys::signature_for_concept_ids;

pub const PROMOTE_MIN_MASTERY: f64 = 0.85;
pub const PROMOTE_MIN_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsuMember {
    pub concept_id: Uuid,
    pub mastery: f64,
    pub confidence: f64,
    #[serde(default)]
    pub has_misconception: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsuGroup {
    pub members: Vec<PsuMember>,
    /// Whether the PSU is currently promoted.
    #[serde(default)]
    pub active: bool,
}

impl PsuGroup {
    pub fn signature(&self) -> String {
        let ids: Vec<Uuid> = self.members.iter().map(|m| m.concept_id).collect();
        signature_for_concept_ids(&ids)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PsuDecision {
    Promote,
    Demote,
    Skip,
    Keep,
}

impl PsuDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            PsuDecision::Promote => "promote",
            PsuDecision::Demote => "demote",
            PsuDecision::Skip => "skip",
            PsuDecision::Keep => "keep",
        }
    }
}

/// Decide what to do with a PSU.
///
/// | misconception | active | all members mastered | decision |
/// |---|---|---|---|
/// | yes | yes | * | demote |
/// | yes | no | * | skip |
/// | no | * | yes | promote |
/// | no | * | no | keep |
pub fn psu_promotion_decision(group: &PsuGroup) -> PsuDecision {
    if group.members.is_empty() {
        return PsuDecision::Keep;
    }
    if group.members.iter().any(|m| m.has_misconception) {
        return if group.active {
            PsuDecision::Demote
        } else {
            PsuDecision::Skip
        };
    }
    let mastered = group
        .members
        .iter()
        .all(|m| m.mastery >= PROMOTE_MIN_MASTERY && m.confidence >= PROMOTE_MIN_CONFIDENCE);
    if mastered {
        PsuDecision::Promote
    } else {
        PsuDecision::Keep
    }
}

/// Map a misconception's polarity and scope to a structural signature:
/// `frame_error`, `procedural_gap`, or `unknown`.
pub fn infer_structure_misconception_signature(polarity: &str, scope: &str) -> &'static str {
    let p = polarity.trim().to_ascii_lowercase();
    let s = scope.trim().to_ascii_lowercase();
    let frame_words = ["frame", "structure", "relation", "concept", "model"];
    let inverted = ["invert", "reverse", "swap", "confus", "conflat"];
    let procedural = ["procedur", "step", "process", "method", "skill"];
    let missing = ["omit", "missing", "skip", "incomplete", "gap"];

    if inverted.iter().any(|w| p.contains(w)) || frame_words.iter().any(|w| s.contains(w)) {
        "frame_error"
    } else if missing.iter().any(|w| p.contains(w)) || procedural.iter().any(|w| s.contains(w)) {
        "procedural_gap"
    } else {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(mastery: f64, confidence: f64, mis: bool) -> PsuMember {
        PsuMember {
            concept_id: Uuid::new_v4(),
            mastery,
            confidence,
            has_misconception: mis,
        }
    }

    #[test]
    fn test_promote_when_mastered() {
        let g = PsuGroup {
            members: vec![member(0.9, 0.9, false), member(0.9, 0.9, false), member(0.9, 0.9, false)],
            active: false,
        };
        assert_eq!(psu_promotion_decision(&g), PsuDecision::Promote);
    }

    #[test]
    fn test_misconception_demotes_or_skips() {
        let mut g = PsuGroup {
            members: vec![member(0.9, 0.9, true), member(0.9, 0.9, false)],
            active: true,
        };
        assert_eq!(psu_promotion_decision(&g), PsuDecision::Demote);
        g.active = false;
        assert_eq!(psu_promotion_decision(&g), PsuDecision::Skip);
    }

    #[test]
    fn test_keep_below_threshold() {
        let g = PsuGroup {
            members: vec![member(0.9, 0.9, false), member(0.6, 0.9, false)],
            active: true,
        };
        assert_eq!(psu_promotion_decision(&g), PsuDecision::Keep);
        assert_eq!(psu_promotion_decision(&PsuGroup { members: vec![], active: true }), PsuDecision::Keep);
    }

    #[test]
    fn test_signature_stable_under_member_order() {
        let a = member(0.9, 0.9, false);
        let b = member(0.9, 0.9, false);
        let c = member(0.9, 0.9, false);
        let g1 = PsuGroup { members: vec![a.clone(), b.clone(), c.clone()], active: false };
        let g2 = PsuGroup { members: vec![c, a, b], active: false };
        assert_eq!(g1.signature(), g2.signature());
        assert_eq!(psu_promotion_decision(&g1), psu_promotion_decision(&g2));
    }

    #[test]
    fn test_misconception_signature() {
        assert_eq!(infer_structure_misconception_signature("inverted", "local"), "frame_error");
        assert_eq!(infer_structure_misconception_signature("", "relation between terms"), "frame_error");
        assert_eq!(infer_structure_misconception_signature("omitted", "local"), "procedural_gap");
        assert_eq!(infer_structure_misconception_signature("neutral", "procedure"), "procedural_gap");
        assert_eq!(infer_structure_misconception_signature("neutral", "local"), "unknown");
    }
}
