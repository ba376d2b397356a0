//! Prompts for classification and extraction calls.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth**: changing what the service is asked for
//!    (e.g. a new chart case) means editing exactly one place.
//!
//! 2. **Testability**: unit tests inspect the assembled prompts directly
//!    without a live model.
//!
//! Callers can override the system framing via
//! [`crate::config::ExtractionConfig::system_prompt`].

use crate::model::{BoundingBox, ContentKind, ElementType};

/// System framing sent with every extraction call.
///
/// `{locale}` is replaced with the configured output language.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an extractor of tables and chart data from document images. Return ONLY valid JSON, with no text before or after it.
- A table is {"type":"table","format":"html","title":...,"html":"<table>...</table>","notes":...}.
- Several elements are {"type":"table_set","tables":[...]}; a chart inside the list carries "type":"chart".
- A chart (line, bar, scatter, ternary, ...) is {"type":"chart","chart":{...}} with its numeric series.
- Running text is {"type":"text","sections":[...]}.
Keep categorical axis labels (e.g. dates) as strings. Use null for values you cannot read. Never invent data beyond what is legible.
Write titles and notes exactly as printed; any label you add yourself is written in {locale}."#;

/// System framing for the classifier tier.
pub const CLASSIFY_SYSTEM_PROMPT: &str =
    "You classify document pages. Return ONLY valid JSON, with no text before or after it.";

/// Cheap-model page classification.
pub const CLASSIFY_PROMPT: &str = r#"Look at this page quickly. Return JSON:
{"has_content": true|false, "content_type": "table"|"chart"|"mixed"|"text_only"|"none", "count": number, "rotation": 0|90|180|270, "elements": [{"type": "...", "shape": "...", "merged_cells": true|false, "color_semantics": "...", "legend": "..."}]}

"count" is how many DISTINCT tables and charts the page shows:
- one table → 1
- two separate tables (e.g. Table 3 and Table 4) → 2
- nothing useful → 0

Rules:
- only tables → "table"; only charts → "chart"; tables and charts together → "mixed"
- only running text → has_content=false, content_type="text_only", count=0
- nothing useful → has_content=false, content_type="none", count=0
- "rotation" is the clockwise turn that makes the page text upright
- "elements" lists one object per element with anything that helps reading it: merged cells, colours that carry meaning, the printed legend"#;

/// A crop containing exactly one table.
pub const SEGMENT_TABLE_PROMPT: &str = r#"This image is a crop containing EXACTLY 1 table. Transcribe it exactly as printed and use its legend as reference.

Instructions:
- Use a complete HTML <table>, preserving colspan and rowspan.
- The title is the text printed on the table itself; if there is none, infer a short title from the content.
- Put the legend or note visible in this crop (e.g. "C = green", "Source: ...") in "notes".

Read every cell:
1. Count the rows and columns first.
2. Transcribe each cell on its own. Small letters (C, CL, I) and dashes are content. Only a truly empty cell is <td></td>.
3. Never copy whole rows or assume a pattern; colour is not absence of text.

Required format:
{"type": "table", "format": "html", "title": "exact or inferred title", "html": "<table>...</table>", "notes": "optional notes"}

Return only valid JSON."#;

/// A chart crop, or a page holding only charts.
pub const CHART_PROMPT: &str = r#"Extract the data of this CHART as JSON. Read only what is visible; do not force patterns.

Cases:

1. Ternary diagram (triangle):
   {"type": "chart", "chart": {"ternary": {"axes": {"a": {"label": "Sand (%)", "ticks": [...]}, "b": {...}, "c": {...}}, "regions": [{"name": "Sandy", "a": "70-100", "b": "0-15", "c": "0-30"}]}}}
   Give every class as a full "min-max" range per axis.

2. Chart annotated with equations (Y = a + bX ± cX²):
   Extract ALL visible equations as {"type": "table", "table": {"headers": ["Panel", "a", "b", "c", "R²"], "rows": [...]}}.
   Column "c" is ALWAYS POSITIVE (drop the sign). One row per equation.

3. Data chart (lines, bars, scatter):
   {"type": "chart", "chart": {"x": {"label": "...", "unit": "...", "values": [...]}, "y": {"label": "..."}, "series": [{"name": "...", "values": [...]}]}}
   - Count the x-axis ticks first: with N x values EVERY series has EXACTLY N values.
   - Use null where a series has no point for an x value.
   - "0,4" is ONE number (0.4), never two.

4. Anything else: understand it and use the shape of case 3.

Return only valid JSON."#;

/// Whole page, tables only. `{count_desc}` describes the expected elements.
pub const PAGE_TABLE_PROMPT: &str = r#"This page contains {count_desc}. Extract EACH TABLE as a SEPARATE entry of the "tables" array.

Use HTML <table> to preserve structure: colspan/rowspan for merged cells, several <thead> rows for grouped headers, <sup>/<sub> where printed.

Required format:
{"type": "table_set", "tables": [{"title": "exact title of table 1", "format": "html", "html": "<table>...</table>", "notes": "legend of table 1"}, ...]}

Rules:
- one entry per table; never merge two tables into one HTML
- titles and data exactly as they appear
- notes and legends belong to the table they describe

Return only valid JSON."#;

/// Whole page with tables and charts together.
pub const MIXED_PAGE_PROMPT: &str = r#"This page contains {count_desc}, mixing tables and charts. Return every element as its own entry of a table_set, in reading order.

- Tables: {"title": ..., "format": "html", "html": "<table>...</table>", "notes": ...}
- Charts: {"type": "chart", "title": ..., "chart": {"x": {...}, "series": [...]}} or, for equation panels, a table with headers ["Panel", "a", "b", "c", "R²"] where c is always positive.

Required format:
{"type": "table_set", "tables": [...]}

Return only valid JSON."#;

/// Lightweight notes harvest for text pages.
pub const NOTES_PROMPT: &str = r#"This page contains only running text. Return the notes, legends, footnotes and abbreviation keys printed on it:
{"type": "text", "notes": ["...", "..."], "sections": []}

Return only valid JSON."#;

/// Full transcription of a text page.
pub const TEXT_PROMPT: &str = r#"This page contains ONLY TEXT (no tables or charts). Extract all of it, preserving structure and reading order.

Required format:
{"type": "text", "title": "section title or null", "sections": [
  {"type": "heading", "level": 1, "text": "..."},
  {"type": "paragraph", "text": "..."},
  {"type": "list", "style": "numbered|bullet", "items": ["..."]},
  {"type": "blockquote", "text": "..."},
  {"type": "reference", "text": "..."}
], "notes": ["footnotes"]}

Heading levels run from 1 (most important) to 6. Keep the text verbatim.

Return only valid JSON."#;

/// Render the system framing for `locale`, or the caller's override.
pub fn system_prompt(custom: Option<&str>, locale: &str) -> String {
    custom
        .unwrap_or(DEFAULT_SYSTEM_PROMPT)
        .replace("{locale}", locale)
}

/// Prompt for one crop, with its position among the page's elements.
pub fn segment_prompt(
    element: ElementType,
    order_index: usize,
    total: usize,
    bbox: BoundingBox,
    hint: Option<&str>,
) -> String {
    let base = match element {
        ElementType::Table => SEGMENT_TABLE_PROMPT,
        ElementType::Chart => CHART_PROMPT,
    };
    let mut prompt = format!(
        "{base}\n\nContext: element {order_index} of {total}, expected type: {element}, \
         original bbox: [{}, {}, {}, {}].",
        bbox.x1, bbox.y1, bbox.x2, bbox.y2
    );
    if let Some(hint) = hint {
        prompt.push_str(&format!("\nClassifier notes: {hint}."));
    }
    prompt
}

/// Prompt for a single whole-page call.
pub fn whole_page_prompt(kind: ContentKind, expected: usize) -> String {
    let count_desc = describe_count(kind, expected);
    match kind {
        ContentKind::Chart => CHART_PROMPT.to_string(),
        ContentKind::Mixed => MIXED_PAGE_PROMPT.replace("{count_desc}", &count_desc),
        _ => PAGE_TABLE_PROMPT.replace("{count_desc}", &count_desc),
    }
}

fn describe_count(kind: ContentKind, expected: usize) -> String {
    let noun = match kind {
        ContentKind::Chart => "chart",
        ContentKind::Mixed => "element",
        _ => "table",
    };
    match expected {
        0 | 1 => format!("1 {noun}"),
        n => format!("{n} {noun}s ({n} distinct {noun}s)"),
    }
}

/// Append the escalation notice used on every attempt after the first.
pub fn escalate(prompt: &str, attempt: u32) -> String {
    format!(
        "{prompt}\n\nWARNING: attempt {attempt}. The previous response was incomplete or invalid. \
         Return COMPLETE and VALID JSON containing ALL data visible in the image."
    )
}
