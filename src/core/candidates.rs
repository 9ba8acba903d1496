//! Heading candidate generation from DOM signatures (component C3, Layer A).

use crate::core::dom::{structural_signature, DomElement, NoiseTag};
use crate::core::manifest::{nfc_fingerprint, sha256_hex};
use serde::{Deserialize, Serialize};

/// Recognized Arabic heading tokens that lexically cue a heading (§4.3).
pub const HEADING_TOKENS: &[&str] = &[
    "باب", "فصل", "تنبيه", "قاعدة", "فائدة", "مسألة", "تمهيد", "خاتمة",
];

/// Tokens that mark an exercises/applications section (§4.9).
pub const EXERCISE_TOKENS: &[&str] = &["أسئلة", "سؤال", "تمرين", "تطبيق", "تدريبات", "اختبار"];

const TITLE_SPAN_CLASSES: &[&str] = &["title", "PartName", "PageHead", "PageText", "PageNumber", "footnote"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateKind {
    Title,
    Metadata,
    Pagehead,
    Footnote,
    Body,
}

/// A structural fingerprint tuple, serialized as a string for hashing and
/// storage: ancestor chain, sorted class tokens, emphasis flags, and
/// neighbor kinds.
pub type Signature = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate_id: String,
    pub text: String,
    pub kind: CandidateKind,
    pub signature: Signature,
    pub context_before: String,
    pub context_after: String,
    pub html_excerpt: String,
    pub dom_path: String,
    pub page_index: Option<u32>,
    pub file_index: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    pub preceded_by_hr: bool,
    pub followed_by_hr: bool,
}

/// Emits a candidate for every DOM node matching any of the §4.3 triggers:
/// centering, typographic emphasis, reference-specific spans, separator
/// adjacency, or a lexical heading cue.
pub fn generate_candidates(
    book_id: &str,
    file_index: usize,
    elements: &[DomElement],
) -> Vec<Candidate> {
    let mut out = Vec::new();

    for (i, el) in elements.iter().enumerate() {
        let text = el.text.trim();
        if text.is_empty() {
            continue;
        }

        let has_title_class = el
            .classes
            .iter()
            .any(|c| TITLE_SPAN_CLASSES.iter().any(|t| c.eq_ignore_ascii_case(t)));
        let separator_adjacent = el.preceded_by_hr || el.followed_by_hr || preceded_by_blank_lines(elements, i);
        let lexical_cue = starts_with_heading_token(text);

        if !(el.centered || el.bold || el.font_emphasis || has_title_class || separator_adjacent || lexical_cue) {
            continue;
        }

        let kind = classify_kind(el, has_title_class);
        let normalized_text = nfc_fingerprint(text);
        let dom_path = el.dom_path.clone();
        let candidate_id = compute_candidate_id(book_id, file_index, &dom_path, &normalized_text);
        let signature = structural_signature(el);

        out.push(Candidate {
            candidate_id,
            text: text.to_string(),
            kind,
            signature,
            context_before: context_window(elements, i, -1),
            context_after: context_window(elements, i, 1),
            html_excerpt: el.html_excerpt.clone(),
            dom_path,
            page_index: el.page_index,
            file_index,
            start_offset: el.start_offset,
            end_offset: el.end_offset,
            preceded_by_hr: el.preceded_by_hr,
            followed_by_hr: el.followed_by_hr,
        });
    }

    out
}

fn classify_kind(el: &DomElement, has_title_class: bool) -> CandidateKind {
    match el.noise {
        Some(NoiseTag::Pagehead) | Some(NoiseTag::PageMarker) => CandidateKind::Pagehead,
        Some(NoiseTag::Footnote) => CandidateKind::Footnote,
        Some(NoiseTag::Metadata) => CandidateKind::Metadata,
        None if has_title_class => CandidateKind::Title,
        None => CandidateKind::Body,
    }
}

fn starts_with_heading_token(text: &str) -> bool {
    let trimmed = text.trim_start();
    HEADING_TOKENS.iter().any(|tok| trimmed.starts_with(tok))
}

/// True when exercise-family lexical tokens open the text (§4.9).
pub fn is_exercise_heading(text: &str) -> bool {
    let trimmed = text.trim_start();
    EXERCISE_TOKENS.iter().any(|tok| trimmed.starts_with(tok))
}

fn preceded_by_blank_lines(elements: &[DomElement], i: usize) -> bool {
    if i == 0 {
        return false;
    }
    let mut blanks = 0;
    let mut j = i;
    while j > 0 {
        j -= 1;
        if elements[j].text.trim().is_empty() {
            blanks += 1;
        } else {
            break;
        }
        if blanks >= 2 {
            return true;
        }
    }
    blanks >= 2
}

fn context_window(elements: &[DomElement], i: usize, direction: isize) -> String {
    let idx = i as isize + direction;
    if idx < 0 || idx as usize >= elements.len() {
        return String::new();
    }
    elements[idx as usize].text.trim().chars().take(200).collect()
}

/// `candidate_id = sha256(book_id || file_index || dom_path || normalized_text)`.
pub fn compute_candidate_id(book_id: &str, file_index: usize, dom_path: &str, normalized_text: &str) -> String {
    let payload = format!("{}\u{1}{}\u{1}{}\u{1}{}", book_id, file_index, dom_path, normalized_text);
    sha256_hex(payload.as_bytes())
}
