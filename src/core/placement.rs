//! Placement Planner (component C9): proposes topic placement for a
//! chunk by content similarity -- never by folder-name or slug -- with a
//! three-way confidence breakdown (spec.md §4.9).

use crate::core::candidates::{is_exercise_heading, EXERCISE_TOKENS};
use crate::core::manifest::nfc_fingerprint;
use crate::core::scorer::fold_for_must_not_heading;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Canonical topic_id for the exercises/applications family (spec.md
/// §4.9). The numeric prefix is a placeholder until the registry assigns
/// a real `T######`; callers resolve or create the concrete topic row.
pub const EXERCISES_TOPIC_SLUG: &str = "تمارين_وتطبيقات";

/// Tokenizes normalized Arabic text for similarity comparison:
/// diacritic-stripped, whitespace-split, short function words left in
/// (no stopword list is specified, and inventing one risks silently
/// changing placement -- see DESIGN.md).
pub fn tokenize(text: &str) -> Vec<String> {
    fold_for_must_not_heading(text)
        .split_whitespace()
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Token-set Jaccard similarity over normalized Arabic tokens.
pub fn jaccard_similarity(a: &[String], b: &[String]) -> f64 {
    let set_a: HashSet<&String> = a.iter().collect();
    let set_b: HashSet<&String> = b.iter().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicCandidate {
    pub topic_id: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementProposal {
    pub chunk_id: String,
    pub ranked_topics: Vec<TopicCandidate>,
    pub boundary_confidence: f64,
    pub topic_purity_confidence: f64,
    pub placement_confidence: f64,
    pub creates_new_topic: bool,
    pub review_required: bool,
    pub exercise_family: bool,
}

const REVIEW_THRESHOLD: f64 = 0.85;

/// A topic's representative text, used as the comparison basis for a
/// chunk's similarity score. `heading` and `body` are kept separate so
/// callers can weight them (the heading line carries a heavier lexical
/// signal than the body prose).
pub struct TopicProfile<'a> {
    pub topic_id: &'a str,
    pub representative_text: &'a str,
}

/// Proposes placement for one chunk against the registry's existing
/// topics. `heading_text` is the chunk's injected heading (if any);
/// `body_text` is the chunk body. `boundary_confidence` is supplied by
/// the caller (derived from scorer + oracle agreement upstream, spec.md
/// §4.9 -- this module doesn't re-derive it, since that agreement lives
/// in the scoring/oracle layers, not here).
pub fn propose_placement(
    chunk_id: &str,
    heading_text: &str,
    body_text: &str,
    boundary_confidence: f64,
    topics: &[TopicProfile],
) -> PlacementProposal {
    let chunk_tokens = {
        let mut t = tokenize(heading_text);
        t.extend(tokenize(body_text));
        t
    };

    let mut ranked: Vec<TopicCandidate> = topics
        .iter()
        .map(|t| TopicCandidate {
            topic_id: t.topic_id.to_string(),
            similarity: jaccard_similarity(&chunk_tokens, &tokenize(t.representative_text)),
        })
        .collect();
    ranked.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));

    let top1 = ranked.first().map(|t| t.similarity).unwrap_or(0.0);
    let top2 = ranked.get(1).map(|t| t.similarity).unwrap_or(0.0);
    let placement_confidence = (top1 - top2).clamp(0.0, 1.0);

    // Topic purity: homogeneity of the chunk body under its own
    // tokenization -- approximated here as the fraction of distinct
    // tokens that repeat at least once, a cheap proxy for "single-topic"
    // text without pulling in a full TF-IDF model (no corpus crate
    // supplies one; see DESIGN.md on the Jaccard-vs-TF-IDF choice).
    let topic_purity_confidence = topic_purity(&chunk_tokens);

    let creates_new_topic = top1 < 0.05;
    let exercise_family = is_exercise_heading(heading_text)
        || EXERCISE_TOKENS.iter().any(|tok| body_text.contains(tok));

    let review_required = creates_new_topic
        || boundary_confidence < REVIEW_THRESHOLD
        || topic_purity_confidence < REVIEW_THRESHOLD
        || placement_confidence < REVIEW_THRESHOLD
        || exercise_family;

    PlacementProposal {
        chunk_id: chunk_id.to_string(),
        ranked_topics: ranked,
        boundary_confidence,
        topic_purity_confidence,
        placement_confidence,
        creates_new_topic,
        review_required,
        exercise_family,
    }
}

fn topic_purity(tokens: &[String]) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }
    let distinct: HashSet<&String> = tokens.iter().collect();
    let repeated = distinct.iter().filter(|t| tokens.iter().filter(|x| x == *t).count() > 1).count();
    (repeated as f64 / distinct.len() as f64).clamp(0.0, 1.0)
}

/// NFC-normalizes a candidate topic display title for the exercises
/// family folder naming (`Txxxxxx__تمارين_وتطبيقات`, spec.md §4.9, §4.10).
pub fn exercises_folder_title() -> String {
    nfc_fingerprint(EXERCISES_TOPIC_SLUG)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_name_similarity_is_never_computed_here() {
        // propose_placement only ever consumes TopicProfile.representative_text,
        // never a folder path -- there is no code path in this module that
        // reads a path at all.
        let topics = vec![TopicProfile {
            topic_id: "T000001",
            representative_text: "باب الطهارة وأحكام الوضوء",
        }];
        let proposal = propose_placement("c1", "باب الصلاة", "أحكام الصلاة وشروطها", 0.9, &topics);
        assert_eq!(proposal.ranked_topics.len(), 1);
    }

    #[test]
    fn exercise_heading_routes_to_exercise_family_and_requires_review() {
        let topics = vec![];
        let proposal = propose_placement("c1", "تمارين الفصل الأول", "حل المسائل التالية", 0.9, &topics);
        assert!(proposal.exercise_family);
        assert!(proposal.review_required);
    }

    #[test]
    fn low_placement_confidence_requires_review() {
        let topics = vec![
            TopicProfile {
                topic_id: "T1",
                representative_text: "باب الصلاة وأحكامها الشروط",
            },
            TopicProfile {
                topic_id: "T2",
                representative_text: "باب الصلاة وأحكامها الأركان",
            },
        ];
        let proposal = propose_placement("c1", "باب الصلاة", "أحكامها الشروط والأركان", 0.95, &topics);
        assert!(proposal.placement_confidence < REVIEW_THRESHOLD);
        assert!(proposal.review_required);
    }

    #[test]
    fn new_topic_creation_always_requires_review() {
        let topics = vec![TopicProfile {
            topic_id: "T1",
            representative_text: "موضوع مختلف تماما عن غير ذلك",
        }];
        let proposal = propose_placement("c1", "باب فريد جدا", "نص غير مرتبط بأي موضوع معروف هنا إطلاقا", 0.95, &topics);
        assert!(proposal.creates_new_topic);
        assert!(proposal.review_required);
    }
}
