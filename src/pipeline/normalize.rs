//! Normalisation: deterministic conversion of payload entries into
//! [`CanonicalEntry`] values.
//!
//! ## Why is normalisation necessary?
//!
//! The service describes the same table in several ways: structural HTML
//! with `colspan`/`rowspan`, legacy `headers` + `rows` arrays, or a chart
//! that is really a coefficient table. Writers want exactly one thing: a
//! rectangular grid whose first row is the header. Every rule below is a
//! pure function so it can be tested on its own.
//!
//! ## Rule Order
//!
//! 1. Expand the table body into a grid (spans duplicated into every cell
//!    they cover, multi-row `<thead>` collapsed into one header)
//! 2. Clean cell text (entities, invisible characters, whitespace)
//! 3. Drop data rows with no text
//! 4. Widen ragged rows to the widest row
//! 5. Repair transposed symmetric matrices (speculative, always logged)
//! 6. Append quadratic-optimum columns to coefficient tables
//!
//! Entries left without any data row are dropped, never emitted.

use crate::model::{CanonicalEntry, EntryKind, Provenance};
use crate::payload::{PayloadEntry, TableBody};
use crate::pipeline::quadratic;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Page-level context shared by every entry of one page.
#[derive(Debug, Clone, Default)]
pub struct NormalizeOptions {
    pub page: usize,
    /// Legend reported by the classifier; used as notes where none were given.
    pub legend: Option<String>,
    pub quadratic_metrics: bool,
}

/// Normalise `items` in reading order, numbering tables and charts
/// separately (`table-01`, `chart-01`, `table-02`, …).
pub fn normalize_entries(
    items: Vec<(PayloadEntry, Provenance)>,
    options: &NormalizeOptions,
) -> Vec<CanonicalEntry> {
    let mut counters: HashMap<EntryKind, usize> = HashMap::new();
    let mut out = Vec::new();

    for (entry, provenance) in items {
        let Some((kind, title, notes, rows, chart)) = canonical_parts(entry, options) else {
            continue;
        };
        let n = counters.entry(kind).or_insert(0);
        *n += 1;
        out.push(CanonicalEntry {
            name: format!("{}-{:02}", kind.prefix(), n),
            page: options.page,
            kind,
            title,
            notes: notes.or_else(|| options.legend.clone()),
            rows,
            chart,
            provenance,
        });
    }
    out
}

type Parts = (
    EntryKind,
    Option<String>,
    Option<String>,
    Vec<Vec<String>>,
    Option<crate::payload::ChartBody>,
);

fn canonical_parts(entry: PayloadEntry, options: &NormalizeOptions) -> Option<Parts> {
    match entry {
        PayloadEntry::Table(table) => {
            let mut rows = table_rows(&table.body);
            if !finish_grid(&mut rows) {
                debug!("Page {}: dropping empty table {:?}", options.page, table.title);
                return None;
            }
            if let Some(title) = table.title.as_deref() {
                repair_symmetric_matrix(title, &mut rows, options.page);
            }
            append_quadratic_metrics(&mut rows, options);
            Some((EntryKind::Table, table.title, table.notes, rows, None))
        }
        PayloadEntry::Chart(chart) => {
            let mut rows: Vec<Vec<String>> = chart
                .chart
                .to_rows()
                .into_iter()
                .map(|r| r.into_iter().map(|c| clean_cell(&c)).collect())
                .collect();
            if !finish_grid(&mut rows) {
                debug!("Page {}: dropping empty chart {:?}", options.page, chart.title);
                return None;
            }
            append_quadratic_metrics(&mut rows, options);
            Some((
                EntryKind::Chart,
                chart.title,
                chart.notes,
                rows,
                Some(chart.chart),
            ))
        }
    }
}

/// Rule 6, for tables and for charts whose tabular view is a coefficient table.
fn append_quadratic_metrics(rows: &mut Vec<Vec<String>>, options: &NormalizeOptions) {
    if !options.quadratic_metrics {
        return;
    }
    if let Some(augmented) = quadratic::augment(rows) {
        debug!("Page {}: appended quadratic optimum columns", options.page);
        *rows = augmented;
    }
}

/// Rules 3 and 4; `false` when nothing but a header is left.
fn finish_grid(rows: &mut Vec<Vec<String>>) -> bool {
    if rows.is_empty() {
        return false;
    }
    let mut kept = vec![std::mem::take(&mut rows[0])];
    kept.extend(
        rows.drain(1..)
            .filter(|r| r.iter().any(|c| !c.trim().is_empty())),
    );
    *rows = kept;
    if rows.len() < 2 {
        return false;
    }
    rectangularize(rows);
    true
}

// ── Rule 1: Expand the body into a grid ──────────────────────────────────

/// Header row followed by data rows, cells cleaned, not yet widened.
pub fn table_rows(body: &TableBody) -> Vec<Vec<String>> {
    match body {
        TableBody::Html { html } => html_table_rows(html),
        TableBody::Rows { headers, rows } => {
            let clean = |r: &Vec<String>| r.iter().map(|c| clean_cell(c)).collect::<Vec<_>>();
            let mut grid: Vec<Vec<String>> = Vec::with_capacity(rows.len() + 1);
            if let Some(h) = headers.as_ref().filter(|h| !h.is_empty()) {
                grid.push(clean(h));
            }
            grid.extend(rows.iter().map(clean));
            grid
        }
    }
}

static RE_THEAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<thead[^>]*>(.*?)</thead>").expect("valid regex"));
static RE_ROW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<tr[^>]*>(.*?)</tr>").expect("valid regex"));
static RE_CELL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(td|th)([^>]*)>(.*?)</(?:td|th)>").expect("valid regex")
});
static RE_COLSPAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)colspan\s*=\s*["']?(\d+)"#).expect("valid regex"));
static RE_ROWSPAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)rowspan\s*=\s*["']?(\d+)"#).expect("valid regex"));

/// Spans above this are treated as model noise.
const MAX_SPAN: usize = 64;

fn span(attrs: &str, re: &Regex) -> usize {
    re.captures(attrs)
        .and_then(|c| c[1].parse::<usize>().ok())
        .unwrap_or(1)
        .clamp(1, MAX_SPAN)
}

/// Parse an HTML `<table>` into a grid.
///
/// Spanned cells repeat their text in every position they cover. When the
/// table has several `<thead>` rows they are collapsed column-wise into one
/// header, joining distinct labels with a space.
pub fn html_table_rows(html: &str) -> Vec<Vec<String>> {
    let header_rows = RE_THEAD
        .captures(html)
        .map(|c| RE_ROW.find_iter(&c[1]).count())
        .unwrap_or(0);

    // column -> (rows still covered, text)
    let mut carried: HashMap<usize, (usize, String)> = HashMap::new();
    let mut grid: Vec<Vec<String>> = Vec::new();

    for row_caps in RE_ROW.captures_iter(html) {
        let mut row: Vec<String> = Vec::new();
        let mut cells = RE_CELL.captures_iter(&row_caps[1]).peekable();

        loop {
            while let Some((left, text)) = carried.get_mut(&row.len()) {
                row.push(text.clone());
                *left -= 1;
                if *left == 0 {
                    carried.remove(&(row.len() - 1));
                }
            }
            let Some(cell) = cells.next() else {
                break;
            };
            let attrs = &cell[2];
            let text = clean_cell(&cell[3]);
            let (cols, rows) = (span(attrs, &RE_COLSPAN), span(attrs, &RE_ROWSPAN));
            for _ in 0..cols {
                if rows > 1 {
                    carried.insert(row.len(), (rows - 1, text.clone()));
                }
                row.push(text.clone());
            }
        }
        grid.push(row);
    }

    if header_rows > 1 && grid.len() >= header_rows {
        let merged = merge_header_rows(&grid[..header_rows]);
        grid.splice(..header_rows, std::iter::once(merged));
    }
    grid
}

fn merge_header_rows(rows: &[Vec<String>]) -> Vec<String> {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    (0..width)
        .map(|col| {
            let mut parts: Vec<&str> = Vec::new();
            for row in rows {
                if let Some(text) = row.get(col).map(String::as_str) {
                    if !text.is_empty() && !parts.contains(&text) {
                        parts.push(text);
                    }
                }
            }
            parts.join(" ")
        })
        .collect()
}

// ── Rule 2: Clean cell text ──────────────────────────────────────────────

static RE_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").expect("valid regex"));
static RE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));
static RE_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Strip markup, decode common entities, drop invisible characters and
/// collapse whitespace.
pub fn clean_cell(raw: &str) -> String {
    let s = RE_BREAK.replace_all(raw, " ");
    let s = RE_TAG.replace_all(&s, "");
    let s = s
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    let s: String = s
        .chars()
        .filter(|c| {
            !matches!(
                c,
                '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}' | '\u{00AD}' | '\u{2060}'
            )
        })
        .collect();
    RE_SPACES.replace_all(s.trim(), " ").into_owned()
}

// ── Rule 4: Widen ragged rows ────────────────────────────────────────────

/// Pad every row, header included, to the widest row. Nothing is truncated.
pub fn rectangularize(rows: &mut [Vec<String>]) {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    for row in rows.iter_mut() {
        row.resize(width, String::new());
    }
}

// ── Rule 5: Symmetric-matrix repair ──────────────────────────────────────

static RE_MATRIX_TITLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)compatib|symmetr|matri[xz]").expect("valid regex")
});

fn is_row_label(cell: &str) -> bool {
    let t = cell.trim();
    !t.is_empty() && quadratic::parse_coefficient(t).is_none()
}

/// Move the first column to the end when a compatibility/symmetric matrix
/// was transcribed with its label column misplaced. Returns whether the
/// repair was applied.
pub fn repair_symmetric_matrix(title: &str, rows: &mut [Vec<String>], page: usize) -> bool {
    if !RE_MATRIX_TITLE.is_match(title) || rows.len() < 2 {
        return false;
    }
    let header_blank = rows[0].first().is_some_and(|h| h.trim().is_empty());
    let labelled = rows[1..]
        .iter()
        .all(|r| r.first().is_some_and(|c| is_row_label(c)));
    if !header_blank || !labelled || rows[0].len() < 2 {
        return false;
    }
    for row in rows.iter_mut() {
        row.rotate_left(1);
    }
    warn!(
        "Page {}: moved the first column of '{}' to the end (suspected transposed matrix)",
        page, title
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{ChartBody, ChartEntry, ChartSeries, TableEntry};

    fn html_entry(title: &str, html: &str) -> PayloadEntry {
        PayloadEntry::Table(TableEntry {
            title: Some(title.into()),
            notes: None,
            body: TableBody::Html { html: html.into() },
        })
    }

    fn opts() -> NormalizeOptions {
        NormalizeOptions {
            page: 4,
            legend: None,
            quadratic_metrics: true,
        }
    }

    #[test]
    fn spans_are_expanded() {
        let rows = html_table_rows(
            "<table><tr><th rowspan=2>Soil</th><th colspan=\"2\">Depth</th></tr>\
             <tr><th>0-20</th><th>20-40</th></tr>\
             <tr><td>Clay</td><td>1,2</td><td>3</td></tr></table>",
        );
        assert_eq!(rows[0], vec!["Soil", "Depth", "Depth"]);
        assert_eq!(rows[1], vec!["Soil", "0-20", "20-40"]);
        assert_eq!(rows[2], vec!["Clay", "1,2", "3"]);
    }

    #[test]
    fn multi_row_thead_collapses() {
        let rows = html_table_rows(
            "<table><thead><tr><th rowspan='2'>Site</th><th colspan='2'>Yield</th></tr>\
             <tr><th>2019</th><th>2020</th></tr></thead>\
             <tbody><tr><td>A</td><td>1</td><td>2</td></tr></tbody></table>",
        );
        assert_eq!(rows[0], vec!["Site", "Yield 2019", "Yield 2020"]);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn cell_cleaning() {
        assert_eq!(clean_cell(" kg ha<sup>-1</sup>&nbsp;"), "kg ha-1");
        assert_eq!(clean_cell("a<br/>b\u{200B}"), "a b");
        assert_eq!(clean_cell("P &amp; K"), "P & K");
    }

    #[test]
    fn ragged_rows_are_widened_not_truncated() {
        let items = vec![(
            html_entry(
                "T",
                "<table><tr><th>A</th><th>B</th></tr><tr><td>1</td><td>2</td><td>3</td></tr>\
                 <tr><td>4</td></tr></table>",
            ),
            Provenance::whole_page(),
        )];
        let out = normalize_entries(items, &opts());
        assert_eq!(out.len(), 1);
        assert!(out[0].is_rectangular());
        assert_eq!(out[0].header(), &["A", "B", ""]);
        assert_eq!(out[0].rows[2], vec!["4", "", ""]);
    }

    #[test]
    fn empty_entries_are_dropped_and_numbering_is_per_kind() {
        let chart = PayloadEntry::Chart(ChartEntry {
            title: Some("Yield".into()),
            notes: None,
            chart: ChartBody::Series {
                x_label: "Year".into(),
                x_unit: None,
                x_values: vec!["2019".into(), "2020".into()],
                y_label: None,
                series: vec![ChartSeries {
                    name: Some("Maize".into()),
                    values: vec![Some("3.1".into()), None],
                }],
            },
        });
        let items = vec![
            (
                html_entry("A", "<table><tr><th>X</th></tr><tr><td>1</td></tr></table>"),
                Provenance::whole_page(),
            ),
            (
                html_entry("empty", "<table><tr><th>X</th></tr><tr><td> </td></tr></table>"),
                Provenance::whole_page(),
            ),
            (chart, Provenance::whole_page()),
            (
                html_entry("B", "<table><tr><th>Y</th></tr><tr><td>2</td></tr></table>"),
                Provenance::whole_page(),
            ),
        ];
        let out = normalize_entries(items, &opts());
        let names: Vec<&str> = out.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["table-01", "chart-01", "table-02"]);
        assert_eq!(out[1].rows[0], vec!["Year", "Maize"]);
        assert!(out[1].chart.is_some());
        assert!(out.iter().all(|e| e.page == 4));
    }

    #[test]
    fn legend_fills_missing_notes() {
        let mut o = opts();
        o.legend = Some("C = compatible".into());
        let out = normalize_entries(
            vec![(
                html_entry("T", "<table><tr><th>X</th></tr><tr><td>1</td></tr></table>"),
                Provenance::whole_page(),
            )],
            &o,
        );
        assert_eq!(out[0].notes.as_deref(), Some("C = compatible"));
    }

    #[test]
    fn symmetric_matrix_repair() {
        let mut rows = vec![
            vec!["".to_string(), "Urea".into(), "KCl".into()],
            vec!["Urea".to_string(), "C".into(), "CL".into()],
            vec!["KCl".to_string(), "CL".into(), "C".into()],
        ];
        assert!(repair_symmetric_matrix("Fertiliser compatibility", &mut rows, 1));
        assert_eq!(rows[0], vec!["Urea", "KCl", ""]);
        assert_eq!(rows[1], vec!["C", "CL", "Urea"]);

        let mut plain = vec![vec!["".to_string(), "x".into()], vec!["a".to_string(), "1".into()]];
        assert!(!repair_symmetric_matrix("Yield by site", &mut plain, 1));
    }

    #[test]
    fn numeric_first_column_is_not_repaired() {
        let mut rows = vec![
            vec!["".to_string(), "A".into()],
            vec!["1.5".to_string(), "x".into()],
        ];
        assert!(!repair_symmetric_matrix("Correlation matrix", &mut rows, 1));
    }

    #[test]
    fn coefficient_tables_gain_optimum_columns() {
        let entry = PayloadEntry::Table(TableEntry {
            title: Some("Response".into()),
            notes: None,
            body: TableBody::Rows {
                headers: Some(vec!["Panel".into(), "a".into(), "b".into(), "c".into()]),
                rows: vec![vec!["A".into(), "100".into(), "2".into(), "0.01".into()]],
            },
        });
        let out = normalize_entries(vec![(entry.clone(), Provenance::whole_page())], &opts());
        assert_eq!(out[0].header().len(), 8);
        assert_eq!(out[0].rows[1][4], "100.0");

        let mut no_quad = opts();
        no_quad.quadratic_metrics = false;
        let out = normalize_entries(vec![(entry, Provenance::whole_page())], &no_quad);
        assert_eq!(out[0].header().len(), 4);
    }

    #[test]
    fn coefficient_charts_gain_optimum_columns() {
        let chart = PayloadEntry::Chart(ChartEntry {
            title: Some("Fitted curves".into()),
            notes: None,
            chart: ChartBody::Records {
                labels: vec!["Site".into(), "a".into(), "b".into(), "c".into()],
                rows: vec![vec!["North".into(), "100".into(), "2".into(), "0.01".into()]],
            },
        });
        let out = normalize_entries(vec![(chart, Provenance::whole_page())], &opts());
        assert_eq!(out[0].kind, EntryKind::Chart);
        assert_eq!(out[0].header().len(), 8);
        assert_eq!(out[0].rows[1][..4], ["North", "100", "2", "0.01"]);
        assert_eq!(out[0].rows[1][4], "100.0");
        assert!(out[0].chart.is_some());
    }
}
