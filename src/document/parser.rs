//! Two-pass heading detection over a page's text lines: pass one clusters
//! font sizes with k-means to learn the body-text size and the size bands
//! that correspond to H1/H2/H3; pass two scores each line against a set of
//! layout heuristics and classifies it as a heading when the score clears
//! a threshold. The low-level PDF text/font extraction is treated as a
//! black box upstream of this; `LineFeature` is the seam between the two.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::store::blob::asset_path;
use crate::store::models::DocumentId;
use crate::utils::error::ApiError;

#[derive(Debug, Clone)]
pub struct LineFeature {
    pub text: String,
    pub font_size: f32,
    pub bold: bool,
    pub span_count: usize,
    pub block_height: f32,
    pub left_offset_ratio: f32,
    pub page_width: f32,
}

#[derive(Debug, Clone)]
pub struct FigureAsset {
    pub path: String,
    pub figure_id: Option<String>,
    pub caption: Option<String>,
    /// Raw bytes of the extracted image, for the caller to persist at `path`.
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TableAsset {
    pub markdown: String,
    pub caption: Option<String>,
}

#[derive(Debug)]
pub struct ParsedDocument {
    pub markdown: String,
    pub page_count: usize,
    pub figures: Vec<FigureAsset>,
    pub tables: Vec<TableAsset>,
}

/// Section-name vocabulary typical of academic papers; an exact (case
/// insensitive) match is a strong heading signal.
const ACADEMIC_SECTION_NAMES: &[&str] = &[
    "abstract", "introduction", "related work", "background", "methodology",
    "methods", "materials and methods", "experiments", "results", "discussion",
    "conclusion", "conclusions", "acknowledgments", "acknowledgements",
    "references", "appendix", "limitations", "future work",
];

/// Minimum usable lines before falling back to a single raw-text section.
const MIN_USABLE_LINES: usize = 10;

pub struct DocumentParser;

impl DocumentParser {
    pub fn parse_file(file_path: &Path, document_id: DocumentId) -> Result<ParsedDocument, ApiError> {
        let bytes = std::fs::read(file_path)
            .map_err(|e| ApiError::BadRequest(format!("failed to read upload: {e}")))?;
        let extension = file_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match extension.as_str() {
            "pdf" => Self::parse_pdf(&bytes, document_id),
            _ => Self::parse_plain_text(&bytes),
        }
    }

    pub fn parse_bytes(bytes: &[u8], extension: &str, document_id: DocumentId) -> Result<ParsedDocument, ApiError> {
        match extension.to_lowercase().as_str() {
            "pdf" => Self::parse_pdf(bytes, document_id),
            _ => Self::parse_plain_text(bytes),
        }
    }

    fn parse_plain_text(bytes: &[u8]) -> Result<ParsedDocument, ApiError> {
        let (text, _, _) = encoding_rs::UTF_8.decode(bytes);
        Ok(ParsedDocument {
            markdown: text.into_owned(),
            page_count: 1,
            figures: Vec::new(),
            tables: Vec::new(),
        })
    }

    fn parse_pdf(bytes: &[u8], document_id: DocumentId) -> Result<ParsedDocument, ApiError> {
        let doc = lopdf::Document::load_mem(bytes)
            .map_err(|e| ApiError::BadRequest(format!("invalid pdf: {e}")))?;
        let page_ids: Vec<_> = doc.get_pages().into_iter().collect();
        let page_count = page_ids.len();

        let mut all_lines: Vec<(u32, LineFeature)> = Vec::new();
        let mut page_lines: std::collections::BTreeMap<u32, Vec<LineFeature>> = std::collections::BTreeMap::new();
        for (page_num, page_id) in &page_ids {
            let lines = extract_page_lines(&doc, *page_id).unwrap_or_default();
            for line in &lines {
                all_lines.push((*page_num, line.clone()));
            }
            page_lines.insert(*page_num, lines);
        }

        if all_lines.len() < MIN_USABLE_LINES {
            let mut fallback = String::new();
            for (page_num, _page_id) in &page_ids {
                if let Ok(text) = doc.extract_text(&[*page_num]) {
                    fallback.push_str(&format!("## Page {page_num}\n\n{text}\n\n"));
                }
            }
            return Ok(ParsedDocument {
                markdown: fallback,
                page_count,
                figures: Vec::new(),
                tables: Vec::new(),
            });
        }

        let signatures = build_heading_signatures(all_lines.iter().map(|(_, l)| l));
        let mut markdown = String::new();
        let mut figures = Vec::new();
        let mut tables = Vec::new();
        let mut figure_counter = 0usize;

        for (page_num, page_id) in &page_ids {
            markdown.push_str(&format!("## Page {page_num}\n\n"));

            let lines = page_lines.get(page_num).cloned().unwrap_or_default();

            for raw_image in extract_page_figures(&doc, *page_id) {
                let figure_id = format!("fig-{page_num}-{figure_counter}");
                let file_name = format!("{figure_id}.{}", raw_image.extension);
                let path = asset_path(document_id, &file_name);
                let caption = lines.iter().find(|l| is_figure_caption(&l.text)).map(|l| l.text.trim().to_string());
                markdown.push_str(&format!("![{}]({})\n\n", caption.clone().unwrap_or_default(), path));
                figures.push(FigureAsset {
                    path,
                    figure_id: Some(figure_id),
                    caption,
                    bytes: raw_image.bytes,
                });
                figure_counter += 1;
            }

            let table_ranges = detect_table_ranges(&lines);
            let mut idx = 0usize;
            while idx < lines.len() {
                if let Some(&(start, end)) = table_ranges.iter().find(|(start, _)| *start == idx) {
                    let (table_markdown, caption) = render_table(&lines[start..end]);
                    markdown.push_str(&table_markdown);
                    markdown.push('\n');
                    tables.push(TableAsset { markdown: table_markdown, caption });
                    idx = end;
                    continue;
                }
                let line = &lines[idx];
                match classify_heading(line, &signatures) {
                    Some(level) => {
                        let hashes = "#".repeat(level as usize + 2);
                        markdown.push_str(&format!("{hashes} {}\n\n", line.text.trim()));
                    }
                    None => {
                        markdown.push_str(line.text.trim());
                        markdown.push('\n');
                    }
                }
                idx += 1;
            }
        }

        Ok(ParsedDocument { markdown, page_count, figures, tables })
    }
}

struct RawImage {
    bytes: Vec<u8>,
    extension: &'static str,
}

/// Structural scan of a page's `/Resources/XObject` dictionary for
/// Image-subtype streams. Filter-aware only for the common photographic
/// codecs (DCTDecode/JPXDecode come through as already-encoded JPEG/JP2
/// bytes); anything else is emitted as a raw `.bin` blob rather than
/// guessed at, matching this module's general best-effort stance on PDF
/// internals.
fn extract_page_figures(doc: &lopdf::Document, page_id: (u32, u16)) -> Vec<RawImage> {
    let mut out = Vec::new();
    let Ok(page_dict) = doc.get_object(page_id).and_then(|o| o.as_dict()) else {
        return out;
    };
    let Ok(resources_obj) = page_dict.get(b"Resources") else {
        return out;
    };
    let Some(resources) = resolve_dict(doc, resources_obj) else {
        return out;
    };
    let Ok(xobjects_obj) = resources.get(b"XObject") else {
        return out;
    };
    let Some(xobjects) = resolve_dict(doc, xobjects_obj) else {
        return out;
    };

    for (_name, obj) in xobjects.iter() {
        let Ok(xobj_id) = obj.as_reference() else { continue };
        let Ok(object) = doc.get_object(xobj_id) else { continue };
        let lopdf::Object::Stream(stream) = object else { continue };
        let is_image = stream
            .dict
            .get(b"Subtype")
            .ok()
            .and_then(|o| o.as_name().ok())
            .and_then(|b| std::str::from_utf8(b).ok())
            .map(|s| s == "Image")
            .unwrap_or(false);
        if !is_image {
            continue;
        }
        let extension = match stream
            .dict
            .get(b"Filter")
            .ok()
            .and_then(|f| f.as_name().ok())
            .and_then(|b| std::str::from_utf8(b).ok())
        {
            Some("DCTDecode") => "jpg",
            Some("JPXDecode") => "jp2",
            _ => "bin",
        };
        out.push(RawImage { bytes: stream.content.clone(), extension });
    }
    out
}

fn resolve_dict<'a>(doc: &'a lopdf::Document, obj: &'a lopdf::Object) -> Option<&'a lopdf::Dictionary> {
    match obj {
        lopdf::Object::Reference(id) => doc.get_object(*id).ok().and_then(|o| o.as_dict().ok()),
        other => other.as_dict().ok(),
    }
}

static FIGURE_CAPTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^figure\s+\d+").unwrap());

fn is_figure_caption(text: &str) -> bool {
    FIGURE_CAPTION_RE.is_match(text.trim())
}

static TABLE_COLUMN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r" {2,}").unwrap());

fn tabular_columns(text: &str) -> Vec<String> {
    TABLE_COLUMN_RE.split(text.trim()).map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

/// A run of 3+ consecutive lines that each split into 3+ whitespace-aligned
/// columns is treated as a table; this misses single-column tables and
/// tables with ragged spacing, but those are rare in generated PDFs and the
/// cost of a false negative (a table rendered as prose) is low.
fn detect_table_ranges(lines: &[LineFeature]) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let mut j = i;
        while j < lines.len() && tabular_columns(&lines[j].text).len() >= 3 {
            j += 1;
        }
        if j - i >= 3 {
            ranges.push((i, j));
            i = j;
        } else {
            i += 1;
        }
    }
    ranges
}

fn render_table(lines: &[LineFeature]) -> (String, Option<String>) {
    let header_cols = tabular_columns(&lines[0].text);
    let mut out = String::new();
    out.push('|');
    for col in &header_cols {
        out.push_str(&format!(" {col} |"));
    }
    out.push('\n');
    out.push('|');
    for _ in &header_cols {
        out.push_str(" --- |");
    }
    out.push('\n');
    for line in &lines[1..] {
        let cols = tabular_columns(&line.text);
        out.push('|');
        for col in &cols {
            out.push_str(&format!(" {col} |"));
        }
        out.push('\n');
    }
    let caption = Some(header_cols.join(", ")).filter(|c| !c.is_empty());
    (out, caption)
}

/// k-means over a 1-D signal (font size) with k <= 3, small fixed iteration
/// budget. Centroids are seeded from evenly spaced order statistics so the
/// result is deterministic for a given input.
pub fn kmeans(samples: &[f32], k: usize, max_iters: usize) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }
    let k = k.min(samples.len()).max(1);
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let mut centroids: Vec<f32> = (0..k)
        .map(|i| sorted[i * (sorted.len() - 1) / k.max(1).max(1)])
        .collect();

    for _ in 0..max_iters {
        let mut sums = vec![0f32; k];
        let mut counts = vec![0usize; k];
        for &s in samples {
            let (idx, _) = centroids
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| (**a - s).abs().partial_cmp(&(**b - s).abs()).unwrap())
                .unwrap();
            sums[idx] += s;
            counts[idx] += 1;
        }
        let mut moved = false;
        for i in 0..k {
            if counts[i] > 0 {
                let new_centroid = sums[i] / counts[i] as f32;
                if (new_centroid - centroids[i]).abs() > 1e-3 {
                    moved = true;
                }
                centroids[i] = new_centroid;
            }
        }
        if !moved {
            break;
        }
    }
    centroids.sort_by(|a, b| a.partial_cmp(b).unwrap());
    centroids
}

#[derive(Debug, Clone)]
pub struct HeadingSignatures {
    pub body_size: f32,
    /// Size bands, smallest heading level (h3) first, largest (h1) last.
    pub heading_bands: Vec<f32>,
}

/// Pass 1: cluster font sizes document-wide to learn the body text size and
/// the heading size bands above it.
pub fn build_heading_signatures<'a>(lines: impl Iterator<Item = &'a LineFeature>) -> HeadingSignatures {
    let sizes: Vec<f32> = lines.map(|l| l.font_size).collect();
    if sizes.is_empty() {
        return HeadingSignatures { body_size: 11.0, heading_bands: vec![] };
    }
    let centroids = kmeans(&sizes, 3, 50);
    let body_size = *centroids.first().unwrap_or(&11.0);
    let heading_bands: Vec<f32> = centroids.into_iter().filter(|c| *c > body_size + 0.5).collect();
    HeadingSignatures { body_size, heading_bands }
}

fn is_numbered_pattern(text: &str) -> bool {
    let trimmed = text.trim();
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => {
            trimmed.split_whitespace().next().map_or(false, |tok| {
                tok.chars().all(|c| c.is_ascii_digit() || c == '.')
            })
        }
        _ => false,
    }
}

/// Pass 2: layout-heuristic scoring per spec — heading if score >= 3.
pub fn layout_score(line: &LineFeature, signatures: &HeadingSignatures) -> i32 {
    let text = line.text.trim();
    let mut score = 0i32;

    if text.len() < 60 {
        score += 2;
    }
    if line.span_count <= 2 {
        score += 1;
    }
    if line.bold {
        score += 2;
    }
    if line.block_height > 1.5 * line.font_size {
        score += 1;
    }
    if line.left_offset_ratio < 0.2 {
        score += 1;
    }
    if !text.ends_with('.') {
        score += 1;
    }
    if text.ends_with(':') {
        score -= 2;
    }
    if !text.is_empty() && text.chars().filter(|c| c.is_alphabetic()).all(|c| c.is_uppercase()) {
        score += 2;
    }
    let lower = text.to_lowercase();
    let stripped: String = lower
        .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c.is_whitespace())
        .to_string();
    if ACADEMIC_SECTION_NAMES.iter().any(|name| stripped == *name) {
        score += 4;
    }
    if is_numbered_pattern(text) {
        score += 2;
    }
    if line.font_size > signatures.body_size + 0.5 {
        score += 1;
    }
    score
}

/// Returns heading level (1..=3) when the line clears the threshold.
pub fn classify_heading(line: &LineFeature, signatures: &HeadingSignatures) -> Option<u8> {
    let score = layout_score(line, signatures);
    if score < 3 {
        return None;
    }
    let level = signatures
        .heading_bands
        .iter()
        .rev()
        .position(|band| line.font_size >= *band - 0.5)
        .map(|idx| (idx + 1).min(3) as u8)
        .unwrap_or(3);
    Some(level)
}

/// Best-effort extraction of text lines with approximate font metrics from
/// a PDF page's content stream. Real glyph-level metrics are out of scope;
/// this walks `Tf`/`Tj`/`TJ`/`Td` operators to approximate font size, run
/// count per line and bold-ness from the font resource name.
fn extract_page_lines(doc: &lopdf::Document, page_id: (u32, u16)) -> Option<Vec<LineFeature>> {
    let content_data = doc.get_page_content(page_id).ok()?;
    let content = lopdf::content::Content::decode(&content_data).ok()?;
    let page_width = page_width_of(doc, page_id).unwrap_or(612.0);

    let mut lines = Vec::new();
    let mut current_font_size = 11.0f32;
    let mut current_bold = false;
    let mut buffer = String::new();
    let mut span_count = 0usize;
    let mut last_x = 0.0f32;

    let flush = |buffer: &mut String, span_count: &mut usize, lines: &mut Vec<LineFeature>, font_size: f32, bold: bool, x: f32, page_width: f32| {
        let text = buffer.trim();
        if !text.is_empty() {
            lines.push(LineFeature {
                text: text.to_string(),
                font_size,
                bold,
                span_count: (*span_count).max(1),
                block_height: font_size * 1.2,
                left_offset_ratio: if page_width > 0.0 { (x / page_width).clamp(0.0, 1.0) } else { 0.0 },
                page_width,
            });
        }
        buffer.clear();
        *span_count = 0;
    };

    for op in &content.operations {
        match op.operator.as_str() {
            "Tf" => {
                if let Some(size) = op.operands.get(1).and_then(|o| o.as_float().ok()) {
                    current_font_size = size as f32;
                }
                if let Some(name) = op
                    .operands
                    .first()
                    .and_then(|o| o.as_name().ok())
                    .and_then(|b| std::str::from_utf8(b).ok())
                {
                    current_bold = name.to_lowercase().contains("bold");
                }
            }
            "Td" | "TD" => {
                flush(&mut buffer, &mut span_count, &mut lines, current_font_size, current_bold, last_x, page_width);
                if let Some(x) = op.operands.first().and_then(|o| o.as_float().ok()) {
                    last_x = x as f32;
                }
            }
            "T*" => {
                flush(&mut buffer, &mut span_count, &mut lines, current_font_size, current_bold, last_x, page_width);
            }
            "Tj" => {
                if let Some(text) = op.operands.first().and_then(|o| o.as_str().ok()) {
                    buffer.push_str(&String::from_utf8_lossy(text));
                    span_count += 1;
                }
            }
            "TJ" => {
                if let Some(arr) = op.operands.first().and_then(|o| o.as_array().ok()) {
                    for item in arr {
                        if let Ok(text) = item.as_str() {
                            buffer.push_str(&String::from_utf8_lossy(text));
                        }
                    }
                    span_count += 1;
                }
            }
            _ => {}
        }
    }
    flush(&mut buffer, &mut span_count, &mut lines, current_font_size, current_bold, last_x, page_width);

    Some(lines)
}

fn page_width_of(doc: &lopdf::Document, page_id: (u32, u16)) -> Option<f32> {
    let page = doc.get_object(page_id).ok()?.as_dict().ok()?;
    let media_box = page.get(b"MediaBox").ok()?.as_array().ok()?;
    let width = media_box.get(2)?.as_float().ok()? - media_box.get(0)?.as_float().ok()?;
    Some(width as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str, font_size: f32, bold: bool) -> LineFeature {
        LineFeature {
            text: text.to_string(),
            font_size,
            bold,
            span_count: 1,
            block_height: font_size * 1.2,
            left_offset_ratio: 0.05,
            page_width: 612.0,
        }
    }

    #[test]
    fn kmeans_separates_body_from_heading_sizes() {
        let samples: Vec<f32> = [11.0, 11.0, 11.0, 11.2, 18.0, 18.0].to_vec();
        let centroids = kmeans(&samples, 2, 50);
        assert_eq!(centroids.len(), 2);
        assert!(centroids[0] < 13.0);
        assert!(centroids[1] > 16.0);
    }

    #[test]
    fn academic_section_name_is_classified_as_heading() {
        let signatures = HeadingSignatures { body_size: 11.0, heading_bands: vec![14.0] };
        let l = line("Introduction", 14.0, true);
        assert_eq!(classify_heading(&l, &signatures), Some(1));
    }

    #[test]
    fn body_sentence_is_not_a_heading() {
        let signatures = HeadingSignatures { body_size: 11.0, heading_bands: vec![14.0] };
        let l = line(
            "This paper presents a thorough evaluation of the proposed method on three benchmark datasets.",
            11.0,
            false,
        );
        assert_eq!(classify_heading(&l, &signatures), None);
    }

    #[test]
    fn trailing_colon_penalizes_heading_score() {
        let signatures = HeadingSignatures { body_size: 11.0, heading_bands: vec![] };
        let l = line("Note:", 11.0, false);
        assert!(layout_score(&l, &signatures) < 3);
    }

    #[test]
    fn empty_bytes_fall_back_to_plain_text() {
        let parsed = DocumentParser::parse_bytes(b"", "txt", DocumentId::new()).unwrap();
        assert_eq!(parsed.markdown, "");
        assert_eq!(parsed.page_count, 1);
    }

    #[test]
    fn tabular_columns_splits_on_wide_gaps_only() {
        assert_eq!(tabular_columns("Name  Score  Rank"), vec!["Name", "Score", "Rank"]);
        assert_eq!(tabular_columns("a normal sentence with single spaces").len(), 1);
    }

    #[test]
    fn a_run_of_aligned_lines_is_detected_as_a_table() {
        let lines = vec![
            line("Model   Accuracy   Latency", 11.0, false),
            line("A         0.91        12ms", 11.0, false),
            line("B         0.88         9ms", 11.0, false),
            line("C         0.95        15ms", 11.0, false),
        ];
        let ranges = detect_table_ranges(&lines);
        assert_eq!(ranges, vec![(0, 4)]);
        let (markdown, caption) = render_table(&lines[0..4]);
        assert!(markdown.starts_with("| Model | Accuracy | Latency |"));
        assert_eq!(caption.as_deref(), Some("Model, Accuracy, Latency"));
    }

    #[test]
    fn prose_lines_are_not_detected_as_a_table() {
        let lines = vec![
            line("This is a normal sentence.", 11.0, false),
            line("So is this one, also normal.", 11.0, false),
            line("And a third unremarkable line.", 11.0, false),
        ];
        assert!(detect_table_ranges(&lines).is_empty());
    }

    #[test]
    fn figure_caption_pattern_matches_common_forms() {
        assert!(is_figure_caption("Figure 3: Model architecture"));
        assert!(is_figure_caption("figure 12. Overview"));
        assert!(!is_figure_caption("This figure shows the results."));
    }
}
