//! Annotation Highlight Extractor (spec §4.6, §6).
//!
//! Notes embed annotations with machine-readable markers in one of two
//! styles — `<!-- KOHL {json} -->` (HTML) or `%% KOHL {json} %%`
//! (Markdown-comment). This module recognizes either delimiter, recovers
//! the visible text and user-note portion bounded between markers, and
//! fingerprints annotations for stable identity.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Annotation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkerStyle {
    Html,
    Markdown,
}

impl MarkerStyle {
    pub fn other(self) -> MarkerStyle {
        match self {
            MarkerStyle::Html => MarkerStyle::Markdown,
            MarkerStyle::Markdown => MarkerStyle::Html,
        }
    }
}

#[derive(Debug, Error)]
pub enum HighlightError {
    #[error("invalid marker JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Wire payload schema for a single marker (§6):
/// `{"v":1,"id":...,"p":page,"pos0":...,"pos1":...,"t":iso,"c":color?,"d":drawer?}`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MarkerPayload {
    v: u32,
    id: String,
    p: u32,
    pos0: String,
    pos1: String,
    t: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    c: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    d: Option<String>,
}

static HTML_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<!--\s*KOHL\s*(\{.*?\})\s*-->").unwrap());
static MD_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"%%\s*KOHL\s*(\{.*?\})\s*%%").unwrap());

fn regex_for(style: MarkerStyle) -> &'static Regex {
    match style {
        MarkerStyle::Html => &HTML_MARKER,
        MarkerStyle::Markdown => &MD_MARKER,
    }
}

/// Result of scanning a note body for embedded highlights.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub annotations: Vec<Annotation>,
    pub used_style: MarkerStyle,
    pub has_mixed_styles: bool,
    pub skipped_count: usize,
}

/// Small-string cache bypass threshold; content at or above this size is
/// cached by content hash instead of the raw string (§4.6 "caching layer").
const LARGE_CONTENT_THRESHOLD: usize = 4096;

static EXTRACTION_CACHE: Lazy<Mutex<HashMap<String, ExtractionCacheEntry>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Clone)]
struct ExtractionCacheEntry {
    annotations: Vec<Annotation>,
    used_style: MarkerStyle,
    has_mixed_styles: bool,
    skipped_count: usize,
}

fn cache_key(content: &str) -> String {
    if content.len() < LARGE_CONTENT_THRESHOLD {
        content.to_string()
    } else {
        blake3::hash(content.as_bytes()).to_hex().to_string()
    }
}

/// Extract every embedded highlight from `content`.
///
/// Infers the preferred style from which delimiter appears; on mixed
/// content HTML wins by legacy rule, falling back to the other style if the
/// preferred one yields no markers.
pub fn extract(content: &str) -> ExtractionResult {
    let key = cache_key(content);
    if let Some(entry) = EXTRACTION_CACHE.lock().unwrap().get(&key) {
        return ExtractionResult {
            annotations: entry.annotations.clone(),
            used_style: entry.used_style,
            has_mixed_styles: entry.has_mixed_styles,
            skipped_count: entry.skipped_count,
        };
    }

    let html_count = HTML_MARKER.find_iter(content).count();
    let md_count = MD_MARKER.find_iter(content).count();
    let has_mixed_styles = html_count > 0 && md_count > 0;

    let mut preferred = if html_count > 0 {
        MarkerStyle::Html
    } else {
        MarkerStyle::Markdown
    };
    let mut result = extract_with_style(content, preferred);
    if result.annotations.is_empty() && md_count == 0 && html_count == 0 {
        // Neither delimiter present at all — nothing to fall back to.
    } else if result.annotations.is_empty() {
        preferred = preferred.other();
        result = extract_with_style(content, preferred);
    }
    result.has_mixed_styles = has_mixed_styles;

    EXTRACTION_CACHE.lock().unwrap().insert(
        key,
        ExtractionCacheEntry {
            annotations: result.annotations.clone(),
            used_style: result.used_style,
            has_mixed_styles: result.has_mixed_styles,
            skipped_count: result.skipped_count,
        },
    );
    result
}

fn extract_with_style(content: &str, style: MarkerStyle) -> ExtractionResult {
    let re = regex_for(style);
    let mut annotations = Vec::new();
    let mut skipped_count = 0usize;

    let matches: Vec<_> = re.captures_iter(content).collect();
    for (idx, cap) in matches.iter().enumerate() {
        let payload_str = &cap[1];
        let payload: MarkerPayload = match serde_json::from_str(payload_str) {
            Ok(p) => p,
            Err(_) => {
                skipped_count += 1;
                continue;
            }
        };

        let marker_match = cap.get(0).unwrap();
        let text_start = marker_match.end();
        let text_end = matches
            .get(idx + 1)
            .map(|next| next.get(0).unwrap().start())
            .unwrap_or(content.len());
        let visible = content[text_start..text_end].trim();

        let (text, note) = split_text_and_note(visible);

        annotations.push(Annotation {
            id: payload.id,
            page: payload.p,
            pos0: payload.pos0,
            pos1: payload.pos1,
            datetime: payload.t,
            text,
            note,
            chapter: None,
            color: payload.c,
            drawer: payload.d,
        });
    }

    ExtractionResult {
        annotations,
        used_style: style,
        has_mixed_styles: false,
        skipped_count,
    }
}

/// Lines starting with `>` from the first such line onward are the user
/// note; everything before that is the highlight's visible text.
fn split_text_and_note(visible: &str) -> (String, Option<String>) {
    let lines: Vec<&str> = visible.lines().collect();
    let note_start = lines.iter().position(|l| l.trim_start().starts_with('>'));
    match note_start {
        Some(idx) => {
            let text = lines[..idx].join("\n").trim().to_string();
            let note: String = lines[idx..]
                .iter()
                .map(|l| l.trim_start().trim_start_matches('>').trim_start())
                .collect::<Vec<_>>()
                .join("\n");
            (text, Some(note.trim().to_string()).filter(|s| !s.is_empty()))
        }
        None => (visible.trim().to_string(), None),
    }
}

/// Render a single annotation as a marker + visible text block in the given
/// style.
pub fn render_marker(annotation: &Annotation, style: MarkerStyle) -> Result<String, HighlightError> {
    let payload = MarkerPayload {
        v: 1,
        id: annotation.id.clone(),
        p: annotation.page,
        pos0: annotation.pos0.clone(),
        pos1: annotation.pos1.clone(),
        t: annotation.datetime.clone(),
        c: annotation.color.clone(),
        d: annotation.drawer.clone(),
    };
    let json = serde_json::to_string(&payload)?;
    let marker = match style {
        MarkerStyle::Html => format!("<!-- KOHL {json} -->"),
        MarkerStyle::Markdown => format!("%% KOHL {json} %%"),
    };
    let mut block = format!("{marker}\n{}", annotation.text);
    if let Some(note) = &annotation.note {
        for line in note.lines() {
            block.push('\n');
            block.push_str("> ");
            block.push_str(line);
        }
    }
    Ok(block)
}

/// Rewrite every marker in `content` from its current style to `target`, or
/// strip markers entirely when `target` is `None`, re-serializing the JSON
/// payloads rather than copying raw text.
pub fn convert_style(content: &str, target: Option<MarkerStyle>) -> Result<String, HighlightError> {
    let extraction = extract(content);
    let Some(target) = target else {
        // Strip: keep only the concatenated visible text + notes.
        let mut out = String::new();
        for a in &extraction.annotations {
            out.push_str(&a.text);
            if let Some(note) = &a.note {
                out.push('\n');
                out.push_str(note);
            }
            out.push_str("\n\n");
        }
        return Ok(out.trim_end().to_string());
    };
    let mut out = String::new();
    for a in &extraction.annotations {
        out.push_str(&render_marker(a, target)?);
        out.push_str("\n\n");
    }
    Ok(out.trim_end().to_string())
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Stable fingerprint over `(page, pos0, pos1, normalize(text))` — the
/// annotation id used for deduplication and duplicate classification
/// (spec §4.6, §8 invariant 6).
pub fn annotation_id(page: u32, pos0: &str, pos1: &str, text: &str) -> String {
    let key = format!("{page}|{pos0}|{pos1}|{}", normalize_text(text));
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_annotation(id: &str, page: u32) -> Annotation {
        Annotation {
            id: id.to_string(),
            page,
            pos0: "p0".into(),
            pos1: "p1".into(),
            datetime: "2026-01-01T00:00:00Z".into(),
            text: "Some highlighted text.".into(),
            note: None,
            chapter: None,
            color: Some("yellow".into()),
            drawer: None,
        }
    }

    #[test]
    fn extract_html_style() {
        let a = sample_annotation("abc", 1);
        let block = render_marker(&a, MarkerStyle::Html).unwrap();
        let result = extract(&block);
        assert_eq!(result.used_style, MarkerStyle::Html);
        assert_eq!(result.annotations.len(), 1);
        assert_eq!(result.annotations[0].id, "abc");
        assert_eq!(result.annotations[0].text, "Some highlighted text.");
    }

    #[test]
    fn extract_markdown_style() {
        let a = sample_annotation("def", 2);
        let block = render_marker(&a, MarkerStyle::Markdown).unwrap();
        let result = extract(&block);
        assert_eq!(result.used_style, MarkerStyle::Markdown);
        assert_eq!(result.annotations.len(), 1);
    }

    #[test]
    fn extract_splits_user_note_lines() {
        let mut a = sample_annotation("ghi", 3);
        a.note = Some("my thought".to_string());
        let block = render_marker(&a, MarkerStyle::Html).unwrap();
        let result = extract(&block);
        assert_eq!(result.annotations[0].note, Some("my thought".to_string()));
        assert_eq!(result.annotations[0].text, "Some highlighted text.");
    }

    #[test]
    fn mixed_styles_prefers_html() {
        let a1 = sample_annotation("one", 1);
        let a2 = sample_annotation("two", 2);
        let html_block = render_marker(&a1, MarkerStyle::Html).unwrap();
        let md_block = render_marker(&a2, MarkerStyle::Markdown).unwrap();
        let content = format!("{html_block}\n\n{md_block}");
        let result = extract(&content);
        assert!(result.has_mixed_styles);
        assert_eq!(result.used_style, MarkerStyle::Html);
    }

    #[test]
    fn fallback_to_other_style_when_preferred_empty() {
        let a = sample_annotation("solo", 1);
        let block = render_marker(&a, MarkerStyle::Markdown).unwrap();
        let result = extract(&block);
        assert_eq!(result.used_style, MarkerStyle::Markdown);
        assert_eq!(result.annotations.len(), 1);
    }

    #[test]
    fn convert_round_trip_a_b_a() {
        let a1 = sample_annotation("rt1", 1);
        let html = render_marker(&a1, MarkerStyle::Html).unwrap();
        let md = convert_style(&html, Some(MarkerStyle::Markdown)).unwrap();
        let back = convert_style(&md, Some(MarkerStyle::Html)).unwrap();
        let direct = convert_style(&html, Some(MarkerStyle::Html)).unwrap();
        assert_eq!(back, direct);
    }

    #[test]
    fn annotation_id_stable_under_whitespace_and_case_changes() {
        let id1 = annotation_id(1, "p0", "p1", "Hello   World");
        let id2 = annotation_id(1, "p0", "p1", "hello world");
        assert_eq!(id1, id2);
    }

    #[test]
    fn annotation_id_differs_on_position() {
        let id1 = annotation_id(1, "p0", "p1", "same text");
        let id2 = annotation_id(1, "p0", "p2", "same text");
        assert_ne!(id1, id2);
    }

    #[test]
    fn malformed_marker_is_skipped_not_fatal() {
        let content = "<!-- KOHL {not json} -->\nsome text";
        let result = extract(content);
        assert_eq!(result.annotations.len(), 0);
        assert_eq!(result.skipped_count, 1);
    }
}
