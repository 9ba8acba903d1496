//! Plan Builder (component C6): assembles the proposal artifact and its
//! human-readable report from scored candidates and oracle outcomes.

use crate::core::candidates::Candidate;
use crate::core::oracle::OracleResult;
use crate::core::scorer::{ReasonTag, Score, Suggestion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionBasis {
    Rule,
    Oracle,
    RuleAndOracle,
    /// An auditor explicitly overrode a must-not-heading block for this
    /// candidate_id; the override is logged by the caller.
    Override,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedInjection {
    pub candidate_id: String,
    pub file_index: usize,
    pub insertion_offset: usize,
    pub level: u8,
    pub title_text: String,
    pub decision_basis: DecisionBasis,
    pub score: f64,
    pub oracle_result: Option<OracleResult>,
    pub review_required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedCandidate {
    pub candidate_id: String,
    pub text: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmbiguousCandidate {
    pub candidate_id: String,
    pub text: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub book_id: String,
    pub run_id: String,
    pub injections: Vec<ProposedInjection>,
    pub blocked: Vec<BlockedCandidate>,
    pub ambiguous_top_n: Vec<AmbiguousCandidate>,
    pub counts_by_kind: BTreeMap<String, usize>,
    pub counts_by_score_band: BTreeMap<String, usize>,
    pub anchors_before: usize,
    pub anchors_after: usize,
    pub anchor_miss_reduction: f64,
}

/// Regex-equivalent check for the sole permitted anchor form,
/// `^#{2,6}\s+` (spec.md §4.8, §8). Implemented without the `regex`
/// crate for this hot-path predicate since it is a fixed, simple prefix
/// scan; `regex` is still used elsewhere in the crate (injector.rs) where
/// matching against arbitrary derived markup benefits from it.
pub fn is_anchor_line(line: &str) -> bool {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if !(2..=6).contains(&hashes) {
        return false;
    }
    matches!(line.as_bytes().get(hashes), Some(b' ') | Some(b'\t'))
}

pub fn count_anchors(markup: &str) -> usize {
    markup.lines().filter(|l| is_anchor_line(l)).count()
}

/// One candidate's contribution to the proposal: decides the decision
/// basis, review flag, and injection eligibility. `score` is the Layer B
/// result; `oracle` is `Some` only when Layer C was consulted for this
/// candidate. `overridden` is true when an auditor explicitly overrode a
/// must-not-heading block for this candidate_id -- the caller is
/// responsible for logging that override; this function only honors it.
pub fn decide_candidate(
    candidate: &Candidate,
    score: &Score,
    oracle: Option<&OracleResult>,
    overridden: bool,
) -> (Option<ProposedInjection>, Option<BlockedCandidate>, bool) {
    if score.must_not_match {
        if overridden {
            return (
                Some(ProposedInjection {
                    candidate_id: candidate.candidate_id.clone(),
                    file_index: candidate.file_index,
                    insertion_offset: candidate.start_offset,
                    level: score.suggested_level,
                    title_text: candidate.text.clone(),
                    decision_basis: DecisionBasis::Override,
                    score: score.score,
                    oracle_result: None,
                    review_required: true,
                }),
                None,
                false,
            );
        }
        return (
            None,
            Some(BlockedCandidate {
                candidate_id: candidate.candidate_id.clone(),
                text: candidate.text.clone(),
                reason: "blocked by must-not-heading".to_string(),
            }),
            false,
        );
    }

    match (score.suggested_is_heading, oracle) {
        (Suggestion::True, None) => (
            Some(ProposedInjection {
                candidate_id: candidate.candidate_id.clone(),
                file_index: candidate.file_index,
                insertion_offset: candidate.start_offset,
                level: score.suggested_level,
                title_text: candidate.text.clone(),
                decision_basis: DecisionBasis::Rule,
                score: score.score,
                oracle_result: None,
                review_required: true,
            }),
            None,
            false,
        ),
        (Suggestion::True, Some(o)) => (
            Some(ProposedInjection {
                candidate_id: candidate.candidate_id.clone(),
                file_index: candidate.file_index,
                insertion_offset: candidate.start_offset,
                level: score.suggested_level,
                title_text: candidate.text.clone(),
                decision_basis: DecisionBasis::RuleAndOracle,
                score: score.score,
                oracle_result: Some(o.clone()),
                review_required: true,
            }),
            None,
            false,
        ),
        (Suggestion::Unknown, Some(o)) if o.is_heading => (
            Some(ProposedInjection {
                candidate_id: candidate.candidate_id.clone(),
                file_index: candidate.file_index,
                insertion_offset: candidate.start_offset,
                level: o.level,
                title_text: o.normalized_title.clone(),
                decision_basis: DecisionBasis::Oracle,
                score: score.score,
                oracle_result: Some(o.clone()),
                review_required: true,
            }),
            None,
            false,
        ),
        (Suggestion::Unknown, _) => (None, None, true),
        (Suggestion::False, _) => (None, None, false),
    }
}

/// Assembles the proposal artifact: ordered injections, blocked
/// candidates, top-N ambiguous candidates, counts, and the estimated
/// anchor-miss reduction (spec.md §4.6). `derived_markup_before` is the
/// unmodified derived plain markup for the whole book (concatenated per
/// spec ordering), used to count `anchors_before`.
pub fn build_proposal(
    book_id: &str,
    run_id: &str,
    derived_markup_before: &str,
    items: &[(Candidate, Score, Option<OracleResult>)],
    top_n: usize,
    overridden: &std::collections::HashSet<String>,
) -> Proposal {
    let mut injections = Vec::new();
    let mut blocked = Vec::new();
    let mut ambiguous: Vec<AmbiguousCandidate> = Vec::new();
    let mut counts_by_kind: BTreeMap<String, usize> = BTreeMap::new();
    let mut counts_by_score_band: BTreeMap<String, usize> = BTreeMap::new();

    for (candidate, score, oracle) in items {
        *counts_by_kind.entry(format!("{:?}", candidate.kind)).or_insert(0) += 1;
        *counts_by_score_band.entry(score_band(score.score)).or_insert(0) += 1;

        let is_overridden = overridden.contains(&candidate.candidate_id);
        let (injection, block, is_ambiguous) = decide_candidate(candidate, score, oracle.as_ref(), is_overridden);
        if let Some(i) = injection {
            injections.push(i);
        }
        if let Some(b) = block {
            blocked.push(b);
        }
        if is_ambiguous {
            ambiguous.push(AmbiguousCandidate {
                candidate_id: candidate.candidate_id.clone(),
                text: candidate.text.clone(),
                score: score.score,
            });
        }
    }

    // Stable order: (file_index, dom_path-derived start_offset) per §5.
    injections.sort_by_key(|i| (i.file_index, i.insertion_offset));
    ambiguous.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    ambiguous.truncate(top_n);

    let anchors_before = count_anchors(derived_markup_before);
    let anchors_after = anchors_before + injections.len();
    let anchor_miss_reduction = if anchors_before == 0 {
        if anchors_after > 0 { 1.0 } else { 0.0 }
    } else {
        (anchors_after - anchors_before) as f64 / anchors_before as f64
    };

    Proposal {
        book_id: book_id.to_string(),
        run_id: run_id.to_string(),
        injections,
        blocked,
        ambiguous_top_n: ambiguous,
        counts_by_kind,
        counts_by_score_band,
        anchors_before,
        anchors_after,
        anchor_miss_reduction,
    }
}

fn score_band(score: f64) -> String {
    if score >= 0.75 {
        "high".to_string()
    } else if score <= 0.25 {
        "low".to_string()
    } else {
        "ambiguous".to_string()
    }
}

/// Renders the human-readable `run_report.md` / `chunk_plan.proposed.md`
/// companion: injections with rationale, blocked items shown (never
/// omitted, spec.md §4.6), top-N ambiguous candidates, counts, and the
/// anchor-miss estimate.
pub fn render_report_markdown(proposal: &Proposal) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Heading proposal for {}\n\n", proposal.book_id));
    out.push_str(&format!("run_id: {}\n\n", proposal.run_id));

    out.push_str(&format!(
        "## Injections ({})\n\n",
        proposal.injections.len()
    ));
    for inj in &proposal.injections {
        out.push_str(&format!(
            "- [{:?}] level {} at file {} offset {}: \"{}\" (score {:.2})\n",
            inj.decision_basis, inj.level, inj.file_index, inj.insertion_offset, inj.title_text, inj.score
        ));
    }

    out.push_str(&format!("\n## Blocked ({})\n\n", proposal.blocked.len()));
    for b in &proposal.blocked {
        out.push_str(&format!("- \"{}\": {}\n", b.text, b.reason));
    }

    out.push_str(&format!(
        "\n## Top ambiguous candidates ({})\n\n",
        proposal.ambiguous_top_n.len()
    ));
    for a in &proposal.ambiguous_top_n {
        out.push_str(&format!("- \"{}\" (score {:.2})\n", a.text, a.score));
    }

    out.push_str("\n## Counts by kind\n\n");
    for (k, v) in &proposal.counts_by_kind {
        out.push_str(&format!("- {}: {}\n", k, v));
    }

    out.push_str("\n## Counts by score band\n\n");
    for (k, v) in &proposal.counts_by_score_band {
        out.push_str(&format!("- {}: {}\n", k, v));
    }

    out.push_str(&format!(
        "\n## Anchor coverage\n\nbefore: {}\nafter: {}\nestimated reduction: {:.2}\n",
        proposal.anchors_before, proposal.anchors_after, proposal.anchor_miss_reduction
    ));

    out
}

#[allow(dead_code)]
pub fn reason_from(reason: ReasonTag) -> &'static str {
    match reason {
        ReasonTag::Title => "title",
        ReasonTag::Metadata => "metadata",
        ReasonTag::Footnote => "footnote",
        ReasonTag::Pagehead => "pagehead",
        ReasonTag::BodyLine => "body_line",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::candidates::{generate_candidates, CandidateKind};
    use crate::core::dom::parse_file;
    use crate::core::scorer::{score_candidate, MustNotHeadingSet};

    #[test]
    fn anchor_regex_matches_only_hash_two_to_six_plus_space() {
        assert!(is_anchor_line("## باب الإدغام"));
        assert!(is_anchor_line("###### x"));
        assert!(!is_anchor_line("# x"));
        assert!(!is_anchor_line("####### x"));
        assert!(!is_anchor_line("##x"));
        assert!(!is_anchor_line("plain text"));
    }

    #[test]
    fn blocked_candidates_are_shown_not_omitted() {
        let parsed = parse_file(r#"<b>مسألة:</b>"#);
        let candidate = generate_candidates("book1", 0, &parsed.elements).remove(0);
        let must_not = MustNotHeadingSet::from_entries(["مسألة:"]);
        let score = score_candidate(&candidate, 0.5, false, &must_not);
        let (injection, blocked, ambiguous) = decide_candidate(&candidate, &score, None, false);
        assert!(injection.is_none());
        assert!(blocked.is_some());
        assert!(!ambiguous);
    }

    #[test]
    fn overridden_must_not_heading_injects_with_override_basis() {
        let parsed = parse_file(r#"<b>مسألة:</b>"#);
        let candidate = generate_candidates("book1", 0, &parsed.elements).remove(0);
        let must_not = MustNotHeadingSet::from_entries(["مسألة:"]);
        let score = score_candidate(&candidate, 0.5, false, &must_not);
        let (injection, blocked, ambiguous) = decide_candidate(&candidate, &score, None, true);
        let injection = injection.expect("override must inject despite must-not-heading match");
        assert_eq!(injection.decision_basis, DecisionBasis::Override);
        assert!(injection.review_required);
        assert!(blocked.is_none());
        assert!(!ambiguous);
    }

    #[test]
    fn ambiguous_candidate_never_injects_without_oracle_true() {
        let parsed = parse_file(r#"<b>تنبيه</b>"#);
        let candidate = generate_candidates("book1", 0, &parsed.elements)
            .into_iter()
            .find(|c| c.kind == CandidateKind::Body || c.kind == CandidateKind::Title)
            .unwrap();
        let score = Score {
            candidate_id: candidate.candidate_id.clone(),
            score: 0.55,
            suggested_is_heading: Suggestion::Unknown,
            suggested_level: 2,
            reason: ReasonTag::BodyLine,
            confidence: 0.55,
            must_not_match: false,
        };
        let (injection, _blocked, ambiguous) = decide_candidate(&candidate, &score, None, false);
        assert!(injection.is_none());
        assert!(ambiguous);
    }

    #[test]
    fn injections_are_sorted_by_file_then_offset() {
        let proposal = Proposal {
            book_id: "b".into(),
            run_id: "r".into(),
            injections: vec![],
            blocked: vec![],
            ambiguous_top_n: vec![],
            counts_by_kind: BTreeMap::new(),
            counts_by_score_band: BTreeMap::new(),
            anchors_before: 0,
            anchors_after: 0,
            anchor_miss_reduction: 0.0,
        };
        let rendered = render_report_markdown(&proposal);
        assert!(rendered.contains("Heading proposal for b"));
    }
}
