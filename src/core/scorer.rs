//! Deterministic candidate scoring (component C4, Layer B).
//!
//! Turns a [`Candidate`](crate::core::candidates::Candidate) into a bounded
//! [0,1] score plus a suggested heading decision, via a fixed, signed
//! feature vector and a logistic squash. No model weights, no training:
//! every feature and its sign is specified in spec.md §4.4.

use crate::core::candidates::{is_exercise_heading, Candidate, CandidateKind};
use crate::core::manifest::nfc_fingerprint;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Arabic combining diacritics (tashkīl) stripped for must-not-heading
/// comparison (spec.md §8: "differs only in diacritics ... MUST still
/// match"). No corpus crate folds Arabic diacritics; this table is
/// hand-rolled and narrowly scoped (see DESIGN.md).
fn is_arabic_diacritic(c: char) -> bool {
    matches!(c as u32,
        0x0610..=0x061A | 0x064B..=0x065F | 0x0670 | 0x06D6..=0x06ED)
}

/// NFC-normalizes then strips Arabic diacritics, for must-not-heading
/// equality comparison only. Never applied to stored candidate text.
pub fn fold_for_must_not_heading(text: &str) -> String {
    nfc_fingerprint(text.trim())
        .chars()
        .filter(|c| !is_arabic_diacritic(*c))
        .collect()
}

/// A curated set of surface forms that resemble headings but must never
/// be injected (spec.md §4.4, §8). Matching is NFC + diacritic-strip
/// equality, per the Open Question in spec.md §9 resolved at the
/// exact-equality end (no substring/regex) -- see DESIGN.md.
#[derive(Debug, Clone, Default)]
pub struct MustNotHeadingSet {
    folded: HashSet<String>,
}

impl MustNotHeadingSet {
    pub fn from_entries<I: IntoIterator<Item = S>, S: AsRef<str>>(entries: I) -> Self {
        Self {
            folded: entries
                .into_iter()
                .map(|s| fold_for_must_not_heading(s.as_ref()))
                .collect(),
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        self.folded.contains(&fold_for_must_not_heading(text))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Suggestion {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasonTag {
    Title,
    Metadata,
    Footnote,
    Pagehead,
    BodyLine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Score {
    pub candidate_id: String,
    pub score: f64,
    pub suggested_is_heading: Suggestion,
    pub suggested_level: u8,
    pub reason: ReasonTag,
    pub confidence: f64,
    pub must_not_match: bool,
}

const HIGH_THRESHOLD: f64 = 0.75;
const LOW_THRESHOLD: f64 = 0.25;

/// Raw, signed feature contributions before the logistic squash. Kept
/// separate from the final score so the scoring anomaly path
/// (conflicting signals, spec.md §7 `ScoringAnomaly`) can inspect the
/// vector without re-deriving it.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureVector {
    pub isolated_block: bool,
    pub centered: bool,
    pub bold: bool,
    pub title_span_class: bool,
    pub preceded_by_hr: bool,
    pub begins_with_heading_token: bool,
    pub followed_by_numeral: bool,
    pub length_in_preferred_range: bool,
    pub no_trailing_punctuation: bool,
    pub in_metadata_zone: bool,
    pub in_footnote_zone: bool,
    pub is_pagehead: bool,
    pub in_document_extremes: bool,
}

impl FeatureVector {
    /// Has at least one positive structural/lexical signal and at least
    /// one negative positional signal -- spec.md §4.4's `ScoringAnomaly`
    /// trigger ("conflicting features, e.g. centered but inside footnote
    /// zone"). Callers surface this as `suggested_is_heading = Unknown`,
    /// never as a fatal error (spec.md §7).
    pub fn is_conflicting(&self) -> bool {
        let positive = self.centered || self.bold || self.title_span_class || self.preceded_by_hr;
        let negative = self.in_metadata_zone || self.in_footnote_zone || self.is_pagehead;
        positive && negative
    }

    fn signed_sum(&self) -> f64 {
        let mut s = 0.0;
        if self.isolated_block {
            s += 1.0;
        }
        if self.centered {
            s += 1.0;
        }
        if self.bold {
            s += 1.0;
        }
        if self.title_span_class {
            s += 1.0;
        }
        if self.preceded_by_hr {
            s += 1.0;
        }
        if self.begins_with_heading_token {
            s += 1.0;
        }
        if self.followed_by_numeral {
            s += 1.0;
        }
        if self.length_in_preferred_range {
            s += 1.0;
        }
        if self.no_trailing_punctuation {
            s += 1.0;
        }
        if self.in_metadata_zone {
            s -= 1.0;
        }
        if self.in_footnote_zone {
            s -= 1.0;
        }
        if self.is_pagehead {
            s -= 1.0;
        }
        if self.in_document_extremes {
            s -= 0.5;
        }
        s
    }
}

fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Builds the feature vector for a candidate. `doc_position` is the
/// candidate's fractional offset into the file (0.0 start, 1.0 end), used
/// for the "first/last 2% of document" positional feature.
pub fn build_features(candidate: &Candidate, doc_position: f64) -> FeatureVector {
    let token_count = candidate.text.split_whitespace().count();
    let begins_with_token = crate::core::candidates::HEADING_TOKENS
        .iter()
        .any(|t| candidate.text.trim_start().starts_with(t));
    let followed_by_numeral = candidate
        .text
        .chars()
        .any(|c| c.is_ascii_digit() || ('\u{0660}'..='\u{0669}').contains(&c));
    let no_trailing_punct = !candidate
        .text
        .trim_end()
        .ends_with(['.', '،', '؛', ',', ';']);

    FeatureVector {
        isolated_block: matches!(candidate.kind, CandidateKind::Title | CandidateKind::Body),
        centered: candidate.signature.contains("c1"),
        bold: candidate.signature.contains("b1"),
        title_span_class: matches!(candidate.kind, CandidateKind::Title),
        preceded_by_hr: candidate.preceded_by_hr,
        begins_with_heading_token: begins_with_token,
        followed_by_numeral,
        length_in_preferred_range: (2..=8).contains(&token_count),
        no_trailing_punctuation: no_trailing_punct,
        in_metadata_zone: matches!(candidate.kind, CandidateKind::Metadata),
        in_footnote_zone: matches!(candidate.kind, CandidateKind::Footnote),
        is_pagehead: matches!(candidate.kind, CandidateKind::Pagehead),
        in_document_extremes: doc_position <= 0.02 || doc_position >= 0.98,
    }
}

/// Scores one candidate. `doc_position` is the candidate's fractional
/// offset into its file, `prior_level2_in_region` records whether a
/// level-2 heading was already emitted above in this document region
/// (spec.md §4.4's level policy), and `must_not_heading` is the curated
/// block set.
pub fn score_candidate(
    candidate: &Candidate,
    doc_position: f64,
    prior_level2_in_region: bool,
    must_not_heading: &MustNotHeadingSet,
) -> Score {
    let must_not_match = must_not_heading.matches(&candidate.text);
    if must_not_match {
        return Score {
            candidate_id: candidate.candidate_id.clone(),
            score: 0.0,
            suggested_is_heading: Suggestion::False,
            suggested_level: 2,
            reason: ReasonTag::BodyLine,
            confidence: 1.0,
            must_not_match: true,
        };
    }

    let features = build_features(candidate, doc_position);
    let raw = features.signed_sum();
    let score = logistic(raw).clamp(0.0, 1.0);

    let has_negative_structural = features.in_metadata_zone || features.in_footnote_zone || features.is_pagehead;

    let suggested_is_heading = if score >= HIGH_THRESHOLD && !has_negative_structural {
        Suggestion::True
    } else if score <= LOW_THRESHOLD {
        Suggestion::False
    } else {
        Suggestion::Unknown
    };

    let reason = match candidate.kind {
        CandidateKind::Title => ReasonTag::Title,
        CandidateKind::Metadata => ReasonTag::Metadata,
        CandidateKind::Footnote => ReasonTag::Footnote,
        CandidateKind::Pagehead => ReasonTag::Pagehead,
        CandidateKind::Body => ReasonTag::BodyLine,
    };

    // Level policy (spec.md §4.4): default 2; level 3 only with a
    // stronger ancestor heading already in this region AND hierarchical
    // evidence. When ambiguous, prefer 2.
    let suggested_level = if prior_level2_in_region
        && matches!(suggested_is_heading, Suggestion::True)
        && !is_exercise_heading(&candidate.text)
        && features.title_span_class
    {
        3
    } else {
        2
    };

    Score {
        candidate_id: candidate.candidate_id.clone(),
        score,
        suggested_is_heading,
        suggested_level,
        reason,
        confidence: score,
        must_not_match: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::candidates::generate_candidates;
    use crate::core::dom::parse_file;

    fn first_candidate(html: &str) -> Candidate {
        let parsed = parse_file(html);
        generate_candidates("book1", 0, &parsed.elements)
            .into_iter()
            .next()
            .expect("expected at least one candidate")
    }

    #[test]
    fn high_confidence_heading_scores_above_threshold() {
        let c = first_candidate(r#"<div align="center"><b>باب الإدغام</b></div>"#);
        let must_not = MustNotHeadingSet::default();
        let score = score_candidate(&c, 0.5, false, &must_not);
        assert!(score.score >= HIGH_THRESHOLD, "score was {}", score.score);
        assert_eq!(score.suggested_is_heading, Suggestion::True);
        assert_eq!(score.suggested_level, 2);
    }

    #[test]
    fn must_not_heading_forces_false_with_full_confidence() {
        let c = first_candidate(r#"<b>مسألة:</b>"#);
        let must_not = MustNotHeadingSet::from_entries(["مسألة:"]);
        let score = score_candidate(&c, 0.5, false, &must_not);
        assert!(score.must_not_match);
        assert_eq!(score.suggested_is_heading, Suggestion::False);
    }

    #[test]
    fn must_not_heading_matches_despite_diacritics() {
        let c = first_candidate("<b>مَسْأَلَةٌ</b>");
        let must_not = MustNotHeadingSet::from_entries(["مسألة"]);
        assert!(must_not.matches(&c.text));
    }

    #[test]
    fn pagehead_candidate_never_scores_true() {
        let mut parsed = parse_file(r#"<p class="PageHead">تفسير ابن كثير</p>"#);
        parsed.elements[0].noise = Some(crate::core::dom::NoiseTag::Pagehead);
        let c = generate_candidates("book1", 0, &parsed.elements)
            .into_iter()
            .next()
            .unwrap();
        let must_not = MustNotHeadingSet::default();
        let score = score_candidate(&c, 0.5, false, &must_not);
        assert_ne!(score.suggested_is_heading, Suggestion::True);
    }

    #[test]
    fn level_3_promoted_when_prior_level2_in_region_and_title_span_class() {
        let c = first_candidate(r#"<div align="center" class="title"><b>فصل أول</b></div>"#);
        let must_not = MustNotHeadingSet::default();
        let score = score_candidate(&c, 0.5, true, &must_not);
        assert_eq!(score.suggested_is_heading, Suggestion::True);
        assert_eq!(score.suggested_level, 3);
    }

    #[test]
    fn level_stays_2_without_a_prior_level_2_in_region() {
        let c = first_candidate(r#"<div align="center" class="title"><b>فصل أول</b></div>"#);
        let must_not = MustNotHeadingSet::default();
        let score = score_candidate(&c, 0.5, false, &must_not);
        assert_eq!(score.suggested_level, 2);
    }

    #[test]
    fn conflicting_features_are_detected_as_anomalous() {
        let mut f = FeatureVector::default();
        f.centered = true;
        f.in_footnote_zone = true;
        assert!(f.is_conflicting());
    }
}
