//! Integration coverage for injection + splitting (C8): proposed
//! injections from the plan builder apply onto derived markup in
//! reverse-offset order, and the resulting text splits into anchor-only
//! chunks that are byte-faithful to their source span (I3, I6).

use ibp::core::injector::{apply_injections, shift_spans_for_injections, split_file, verify_byte_faithfulness};
use ibp::core::plan::{DecisionBasis, ProposedInjection};

fn injection(offset: usize, title: &str) -> ProposedInjection {
    ProposedInjection {
        candidate_id: format!("c-{}", offset),
        file_index: 0,
        insertion_offset: offset,
        level: 2,
        title_text: title.to_string(),
        decision_basis: DecisionBasis::Rule,
        score: 0.9,
        oracle_result: None,
        review_required: true,
    }
}

#[test]
fn approved_injections_split_into_byte_faithful_chunks() {
    let derived = "مقدمة الكتاب بلا عنوان واضح.\nنص تمهيدي إضافي.\nنص الباب الثاني هنا.\n";
    let second_heading_offset = derived.find("نص الباب الثاني").unwrap();

    let injections = vec![injection(0, "المقدمة"), injection(second_heading_offset, "الباب الثاني")];
    let injected = apply_injections(derived, &injections);

    let result = split_file("book1", "page_0001.html", &injected, vec![], &[]);
    assert!(result.anchor_miss.is_none());
    assert_eq!(result.chunks.len(), 2);

    for chunk in &result.chunks {
        assert!(verify_byte_faithfulness(&injected, chunk));
    }
    assert!(result.chunks[0].body.contains("## المقدمة"));
    assert!(result.chunks[1].body.contains("## الباب الثاني"));
    assert!(!result.chunks[0].body.contains("الباب الثاني هنا"));
}

#[test]
fn text_with_no_injections_and_no_existing_anchors_is_entirely_an_anchor_miss() {
    let derived = "نص متصل من غير أي عنوان على الإطلاق.\n";
    let injected = apply_injections(derived, &[]);
    let result = split_file("book1", "page_0001.html", &injected, vec!["نص متصل".to_string()], &[]);

    assert!(result.chunks.is_empty());
    let miss = result.anchor_miss.expect("expected an anchor-miss diagnostic");
    assert_eq!(miss.file, "page_0001.html");
    assert_eq!(miss.candidate_snippets, vec!["نص متصل".to_string()]);
}

#[test]
fn injections_never_overwrite_or_drop_existing_bytes() {
    let derived = "AAAA\nBBBB\nCCCC\n";
    let injections = vec![injection(0, "one"), injection(5, "two"), injection(10, "three")];
    let injected = apply_injections(derived, &injections);

    assert!(injected.contains("AAAA"));
    assert!(injected.contains("BBBB"));
    assert!(injected.contains("CCCC"));
    assert!(injected.contains("## one"));
    assert!(injected.contains("## two"));
    assert!(injected.contains("## three"));
}

#[test]
fn footnote_spans_survive_injection_offset_shifting_and_relocate_to_trailing_section() {
    let derived = "باب الإدغام\nنص الباب الرئيسي.\nحاشية توضيحية صغيرة.\n";
    let footnote_start = derived.find("حاشية توضيحية صغيرة").unwrap();
    let footnote_end = footnote_start + "حاشية توضيحية صغيرة".len();
    let footnote_spans = vec![(footnote_start, footnote_end)];

    let injections = vec![injection(0, "باب الإدغام")];
    let injected = apply_injections(derived, &injections);
    let shifted = shift_spans_for_injections(&footnote_spans, &injections);

    let result = split_file("book1", "page_0001.html", &injected, vec![], &shifted);
    assert_eq!(result.chunks.len(), 1);
    let chunk = &result.chunks[0];
    assert!(!chunk.body.contains("حاشية توضيحية صغيرة"));
    let footnotes = chunk.footnotes_section.as_ref().expect("expected a relocated footnotes section");
    assert!(footnotes.starts_with("## FOOTNOTES"));
    assert!(footnotes.contains("حاشية توضيحية صغيرة"));
    assert!(verify_byte_faithfulness(&injected, chunk));
}

#[test]
fn chunk_ids_are_stable_across_an_identical_rerun() {
    let derived = "## باب الأول\nنص الباب الأول.\n## باب الثاني\nنص الباب الثاني.\n";
    let first = split_file("book1", "page_0001.html", derived, vec![], &[]);
    let second = split_file("book1", "page_0001.html", derived, vec![], &[]);

    assert_eq!(first.chunks[0].chunk_id, second.chunks[0].chunk_id);
    assert_eq!(first.chunks[1].chunk_id, second.chunks[1].chunk_id);
}
