//! HTML parsing into a stably-addressed node tree, with noise-region
//! annotation (component C2).
//!
//! `scraper` (html5ever-backed) gives us a tolerant parse; this module
//! walks the resulting tree once, depth-first, and assigns every element a
//! `dom_path` of the form `/tag[index]/tag[index]/...` where `index` is
//! the element's position among same-tagged siblings under the same
//! parent. That addressing is a pure function of document structure, so
//! it is stable across reruns on identical bytes.

use ego_tree::NodeRef;
use scraper::{ElementRef, Html, Node};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A noise classification attached to a node without removing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoiseTag {
    Pagehead,
    PageMarker,
    Footnote,
    Metadata,
}

/// One addressed element in the parsed tree, with its extracted text and
/// any noise annotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomElement {
    pub dom_path: String,
    pub tag: String,
    pub classes: Vec<String>,
    pub text: String,
    pub html_excerpt: String,
    pub centered: bool,
    pub bold: bool,
    pub font_emphasis: bool,
    pub preceded_by_hr: bool,
    pub followed_by_hr: bool,
    /// True when the immediately preceding `<hr>` is itself an
    /// end-of-page marker (`is_page_marker`), not just any separator.
    pub preceded_by_page_end_hr: bool,
    /// Typography smaller than ordinary body text: a legacy `<font
    /// size="1"|"2">`, an explicit smaller/x-small/xx-small or
    /// sub-baseline px/pt/% `font-size` style, or a "small"-named class.
    pub small_typography: bool,
    pub page_index: Option<u32>,
    pub noise: Option<NoiseTag>,
    pub start_offset: usize,
    pub end_offset: usize,
}

/// A parsed, addressed file ready for candidate generation.
pub struct ParsedFile {
    pub elements: Vec<DomElement>,
    pub raw_text_len: usize,
}

/// Parses one file's HTML, assigns `dom_path`es, and annotates noise
/// regions. `running_header_counts` carries per-signature occurrence
/// counts accumulated across the whole book so pagehead detection (a
/// book-wide property, §4.2) can be applied after a first pass.
pub fn parse_file(html: &str) -> ParsedFile {
    let document = Html::parse_document(html);
    let mut elements = Vec::new();
    let mut sibling_counters: HashMap<(String, String), usize> = HashMap::new();
    let mut cursor = 0usize;
    let mut seen_strong_heading = false;
    let mut page_index: Option<u32> = None;

    walk(
        document.tree.root(),
        "",
        &mut sibling_counters,
        &mut elements,
        &mut cursor,
        &mut seen_strong_heading,
        &mut page_index,
    );

    ParsedFile {
        elements,
        raw_text_len: html.len(),
    }
}

#[allow(clippy::too_many_arguments)]
fn walk(
    node: NodeRef<Node>,
    parent_path: &str,
    sibling_counters: &mut HashMap<(String, String), usize>,
    out: &mut Vec<DomElement>,
    cursor: &mut usize,
    seen_strong_heading: &mut bool,
    page_index: &mut Option<u32>,
) {
    for child in node.children() {
        if let Some(elem) = child.value().as_element() {
            let tag = elem.name().to_string();
            let key = (parent_path.to_string(), tag.clone());
            let idx = sibling_counters.entry(key).or_insert(0);
            let path = format!("{}/{}[{}]", parent_path, tag, idx);
            *idx += 1;

            if is_page_marker(&tag, &elem.classes().map(|c| c.to_string()).collect::<Vec<_>>()) {
                *page_index = Some(page_index.map(|p| p + 1).unwrap_or(0));
            }

            let classes: Vec<String> = elem.classes().map(|c| c.to_string()).collect();
            let element_ref = ElementRef::wrap(child).unwrap();
            let text: String = element_ref.text().collect::<Vec<_>>().join("");
            let html_excerpt = element_ref.html();

            let centered = is_centered(&tag, &classes, elem);
            let bold = tag == "b" || tag == "strong";
            let font_emphasis = tag == "font" && elem.attr("size").is_some();
            let small_typography = has_smaller_typography(&tag, &classes, elem);

            let start_offset = *cursor;
            *cursor += text.len().max(1);
            let end_offset = *cursor;

            if !text.trim().is_empty() && (centered || bold) {
                *seen_strong_heading = true;
            }

            out.push(DomElement {
                dom_path: path.clone(),
                tag: tag.clone(),
                classes,
                text,
                html_excerpt,
                centered,
                bold,
                font_emphasis,
                preceded_by_hr: false,
                followed_by_hr: false,
                preceded_by_page_end_hr: false,
                small_typography,
                page_index: *page_index,
                noise: None,
                start_offset,
                end_offset,
            });

            walk(
                child,
                &path,
                sibling_counters,
                out,
                cursor,
                seen_strong_heading,
                page_index,
            );
        }
    }
}

fn is_centered(tag: &str, classes: &[String], elem: &scraper::node::Element) -> bool {
    if tag == "center" {
        return true;
    }
    if elem.attr("align").map(|a| a.eq_ignore_ascii_case("center")).unwrap_or(false) {
        return true;
    }
    if let Some(style) = elem.attr("style") {
        if style.to_ascii_lowercase().replace(' ', "").contains("text-align:center") {
            return true;
        }
    }
    classes.iter().any(|c| c.eq_ignore_ascii_case("center"))
}

fn is_page_marker(tag: &str, classes: &[String]) -> bool {
    (tag == "hr" && classes.iter().any(|c| c.contains("page")))
        || classes.iter().any(|c| c.contains("PageBreak") || c.contains("page-break"))
}

/// A legacy `<font size="1"|"2">`, an explicit smaller/x-small/xx-small
/// (or sub-baseline px/pt/%) `font-size` style, or a "small"-named class.
/// No corpus crate parses CSS; this is a narrow, hand-rolled signal
/// scoped to the footnote-zone heuristic only.
fn has_smaller_typography(tag: &str, classes: &[String], elem: &scraper::node::Element) -> bool {
    if tag == "font" {
        if let Some(size) = elem.attr("size").and_then(|s| s.trim().parse::<i32>().ok()) {
            if size <= 2 {
                return true;
            }
        }
    }
    if let Some(style) = elem.attr("style") {
        let style_lc = style.to_ascii_lowercase().replace(' ', "");
        if let Some(idx) = style_lc.find("font-size:") {
            let rest = &style_lc[idx + "font-size:".len()..];
            if rest.starts_with("smaller") || rest.starts_with("x-small") || rest.starts_with("xx-small") {
                return true;
            }
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();
            if let Ok(value) = digits.parse::<f64>() {
                let unit = &rest[digits.len()..];
                if (unit.starts_with("px") && value < 11.0)
                    || (unit.starts_with("pt") && value < 9.0)
                    || (unit.starts_with('%') && value < 90.0)
                {
                    return true;
                }
            }
        }
    }
    classes.iter().any(|c| c.to_ascii_lowercase().contains("small"))
}

/// Annotates `preceded_by_hr`/`followed_by_hr`/`preceded_by_page_end_hr`
/// for every element in document order (needs a second pass since it
/// depends on siblings).
pub fn annotate_hr_adjacency(elements: &mut [DomElement]) {
    for i in 0..elements.len() {
        if i > 0 && elements[i - 1].tag == "hr" {
            elements[i].preceded_by_hr = true;
            if is_page_marker(&elements[i - 1].tag, &elements[i - 1].classes) {
                elements[i].preceded_by_page_end_hr = true;
            }
        }
        if i + 1 < elements.len() && elements[i + 1].tag == "hr" {
            elements[i].followed_by_hr = true;
        }
    }
}

/// Tags running headers/footers repeated across the book. A structural
/// signature (ancestor-tag chain + class tokens + emphasis flags) counted
/// across a high fraction of pages containing prose is `Pagehead` (§4.2,
/// repetition ratio >= 0.6 here conservatively applied per-file as the
/// per-book aggregation is driven by the caller across files).
pub fn tag_pageheads(elements: &mut [DomElement], signature_counts: &HashMap<String, usize>, page_count: usize) {
    if page_count == 0 {
        return;
    }
    for el in elements.iter_mut() {
        if el.text.trim().is_empty() {
            continue;
        }
        let sig = structural_signature(el);
        let count = signature_counts.get(&sig).copied().unwrap_or(0);
        let ratio = count as f64 / page_count as f64;
        if ratio >= 0.6 {
            el.noise = Some(NoiseTag::Pagehead);
        }
    }
}

/// Tags footnote zones: class/role-identified, or a block following an
/// end-of-page HR with typography smaller than ordinary body text. Bare
/// HR-adjacency alone is not enough: a centered bold chapter heading that
/// happens to follow a plain separator HR must not be swept into the
/// footnote zone (it has no smaller typography), while genuine footnote
/// text after a page-end HR does.
pub fn tag_footnotes(elements: &mut [DomElement]) {
    for el in elements.iter_mut() {
        if el.noise.is_some() {
            continue;
        }
        let is_footnote_class = el
            .classes
            .iter()
            .any(|c| c.to_ascii_lowercase().contains("footnote"));
        let end_of_page_with_smaller_type = el.preceded_by_page_end_hr && el.tag != "hr" && el.small_typography;
        if is_footnote_class || end_of_page_with_smaller_type {
            el.noise = Some(NoiseTag::Footnote);
        }
    }
}

/// Tags metadata zones: content before the first strong heading signal,
/// or containing title-page tokens.
pub fn tag_metadata(elements: &mut [DomElement]) {
    const TITLE_PAGE_TOKENS: &[&str] = &["المؤلف", "الناشر", "الطبعة", "تأليف"];
    let mut seen_strong_heading = false;
    for el in elements.iter_mut() {
        if el.noise.is_some() {
            continue;
        }
        if el.centered || el.bold || el.font_emphasis {
            if !el.text.trim().is_empty() {
                seen_strong_heading = true;
            }
        }
        let has_title_token = TITLE_PAGE_TOKENS.iter().any(|tok| el.text.contains(tok));
        if !seen_strong_heading || has_title_token {
            if !el.text.trim().is_empty() {
                el.noise = Some(NoiseTag::Metadata);
            }
        }
    }
}

/// A structural fingerprint used for pagehead detection: ancestor-tag
/// chain (from `dom_path`, up to 3 deep), sorted class tokens, and
/// emphasis flags. Two nodes with identical signatures are considered
/// structurally equivalent.
pub fn structural_signature(el: &DomElement) -> String {
    let segments: Vec<&str> = el.dom_path.trim_start_matches('/').split('/').collect();
    let tail: Vec<&str> = segments
        .iter()
        .rev()
        .take(3)
        .rev()
        .map(|s| s.split('[').next().unwrap_or(s))
        .collect();
    let mut classes = el.classes.clone();
    classes.sort();
    format!(
        "{}|{}|c{}b{}f{}",
        tail.join(">"),
        classes.join(","),
        el.centered as u8,
        el.bold as u8,
        el.font_emphasis as u8
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dom_path_is_stable_and_index_based() {
        let html = "<html><body><p>one</p><p>two</p></body></html>";
        let parsed = parse_file(html);
        let paths: Vec<&str> = parsed.elements.iter().map(|e| e.dom_path.as_str()).collect();
        assert!(paths.contains(&"/html[0]/body[0]/p[0]"));
        assert!(paths.contains(&"/html[0]/body[0]/p[1]"));
    }

    #[test]
    fn centered_detection_covers_all_three_forms() {
        let html = r#"<div align="center">a</div><div style="text-align: center;">b</div><center>c</center>"#;
        let parsed = parse_file(html);
        let centered: Vec<bool> = parsed
            .elements
            .iter()
            .filter(|e| e.tag == "div" || e.tag == "center")
            .map(|e| e.centered)
            .collect();
        assert!(centered.iter().all(|c| *c));
    }

    #[test]
    fn footnote_class_is_tagged() {
        let html = r#"<p class="footnote-text">ref 1</p>"#;
        let mut parsed = parse_file(html);
        tag_footnotes(&mut parsed.elements);
        assert_eq!(parsed.elements[0].noise, Some(NoiseTag::Footnote));
    }

    #[test]
    fn heading_after_plain_hr_is_not_swept_into_footnote_zone() {
        let html = r#"<hr/><div align="center"><b>باب الإدغام</b></div>"#;
        let mut parsed = parse_file(html);
        annotate_hr_adjacency(&mut parsed.elements);
        tag_footnotes(&mut parsed.elements);
        let heading = parsed.elements.iter().find(|e| e.tag == "div").unwrap();
        assert!(heading.preceded_by_hr);
        assert_ne!(heading.noise, Some(NoiseTag::Footnote));
    }

    #[test]
    fn smaller_typography_after_page_end_hr_is_tagged_footnote() {
        let html = r#"<hr class="page-end"/><p style="font-size: 8pt">١. حاشية توضيحية</p>"#;
        let mut parsed = parse_file(html);
        annotate_hr_adjacency(&mut parsed.elements);
        tag_footnotes(&mut parsed.elements);
        let note = parsed.elements.iter().find(|e| e.tag == "p").unwrap();
        assert!(note.preceded_by_page_end_hr);
        assert!(note.small_typography);
        assert_eq!(note.noise, Some(NoiseTag::Footnote));
    }

    #[test]
    fn plain_hr_without_page_class_never_sets_page_end_flag() {
        let html = r#"<hr/><p style="font-size: 8pt">نص صغير بعد فاصل عادي</p>"#;
        let mut parsed = parse_file(html);
        annotate_hr_adjacency(&mut parsed.elements);
        tag_footnotes(&mut parsed.elements);
        let note = parsed.elements.iter().find(|e| e.tag == "p").unwrap();
        assert!(!note.preceded_by_page_end_hr);
        assert_ne!(note.noise, Some(NoiseTag::Footnote));
    }

    #[test]
    fn structural_signature_is_deterministic() {
        let html = "<p>x</p>";
        let parsed = parse_file(html);
        let sig1 = structural_signature(&parsed.elements[0]);
        let sig2 = structural_signature(&parsed.elements[0]);
        assert_eq!(sig1, sig2);
    }
}
