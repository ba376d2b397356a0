//! Schema boundary between the vision service and the rest of the pipeline.
//!
//! ## Why a typed payload?
//!
//! The inference service answers with loosely-typed JSON that is frequently
//! wrapped in Markdown fences, truncated, or shaped slightly differently from
//! what the prompt asked for. Everything downstream (validation,
//! normalisation, artifact writing) works on [`ExtractionPayload`] instead, so
//! shape checks happen exactly once, here, and business logic never touches a
//! raw `serde_json::Value`.
//!
//! Accepted top-level shapes:
//!
//! | `type`      | Body                                                        |
//! |-------------|-------------------------------------------------------------|
//! | `table`     | `{format:"html", html}` or legacy `{table:{headers?, rows}}` |
//! | `table_set` | `{tables:[table \| {type:"chart", chart}]}`                 |
//! | `chart`     | `{chart:{x, series}}`, `{chart:{labels, series}}`, ternary   |
//! | `text`      | `{title?, sections:[…], notes?}`                            |
//!
//! Anything else becomes [`ExtractionPayload::Invalid`] with a reason.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Minimum length of an HTML table body worth keeping.
const MIN_HTML_LEN: usize = 10;

/// One decoded response from the vision service.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionPayload {
    Table(TableEntry),
    TableSet(Vec<PayloadEntry>),
    Chart(ChartEntry),
    Text(TextPayload),
    /// Decoded JSON that violates the schema; kept for audit.
    Invalid { reason: String },
}

/// One element inside a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayloadEntry {
    Table(TableEntry),
    Chart(ChartEntry),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableEntry {
    pub title: Option<String>,
    pub notes: Option<String>,
    pub body: TableBody,
}

/// The two table encodings the service may use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum TableBody {
    /// Structural HTML preserving `colspan`/`rowspan`.
    Html { html: String },
    /// Legacy row arrays.
    Rows {
        headers: Option<Vec<String>>,
        rows: Vec<Vec<String>>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartEntry {
    pub title: Option<String>,
    pub notes: Option<String>,
    pub chart: ChartBody,
}

/// Chart data in one of the three structures the service produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum ChartBody {
    /// Categorical or numeric x axis with one or more y series.
    Series {
        x_label: String,
        x_unit: Option<String>,
        x_values: Vec<String>,
        y_label: Option<String>,
        series: Vec<ChartSeries>,
    },
    /// Column labels plus one object per row.
    Records {
        labels: Vec<String>,
        rows: Vec<Vec<String>>,
    },
    /// Ternary diagram: three axes and named regions.
    Ternary {
        axes: Vec<TernaryAxis>,
        regions: Vec<TernaryRegion>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSeries {
    pub name: Option<String>,
    pub values: Vec<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TernaryAxis {
    pub key: String,
    pub label: String,
    pub ticks: Vec<String>,
}

/// A named region; `values` is aligned with the diagram's axes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TernaryRegion {
    pub name: String,
    pub values: Vec<Option<String>>,
}

/// Running text of a page without tables or charts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextPayload {
    pub title: Option<String>,
    pub notes: Vec<String>,
    pub sections: Vec<TextSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextSection {
    Heading { level: u8, text: String },
    Paragraph { text: String },
    List { ordered: bool, items: Vec<String> },
    Blockquote { text: String },
    Reference { text: String },
}

// ── Decoding ─────────────────────────────────────────────────────────────

static JSON_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^\s*```[a-zA-Z]*[ \t]*\n?(.*?)\n?```\s*$").expect("valid regex")
});

/// Remove a Markdown code fence wrapping the whole response.
pub fn strip_json_fences(raw: &str) -> &str {
    match JSON_FENCE.captures(raw).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => raw,
    }
}

/// Decode a service response into a JSON object.
///
/// Tolerates fences and leading/trailing chatter around a single object.
/// Returns `None` for empty text, non-JSON text, and JSON that is not an
/// object.
pub fn decode_json_object(raw: &str) -> Option<Value> {
    let text = strip_json_fences(raw).trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(text) {
        return Some(v);
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    }
}

impl ExtractionPayload {
    /// Convert a decoded JSON object into a typed payload.
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::invalid("payload is not a JSON object");
        };
        if obj.is_empty() {
            return Self::invalid("payload is empty");
        }
        let Some(kind) = obj.get("type").and_then(Value::as_str) else {
            return Self::invalid("missing 'type' field");
        };

        match kind {
            "table" => match parse_table(obj) {
                Ok(t) => ExtractionPayload::Table(t),
                Err(reason) => Self::invalid(reason),
            },
            "table_set" => parse_table_set(obj),
            "chart" => match parse_chart(obj) {
                Ok(c) => ExtractionPayload::Chart(c),
                Err(reason) => Self::invalid(reason),
            },
            "text" => match parse_text(obj) {
                Ok(t) => ExtractionPayload::Text(t),
                Err(reason) => Self::invalid(reason),
            },
            other => Self::invalid(format!("unrecognised type '{other}'")),
        }
    }

    fn invalid(reason: impl Into<String>) -> Self {
        ExtractionPayload::Invalid {
            reason: reason.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, ExtractionPayload::Invalid { .. })
    }

    /// Schema violation message, if any.
    pub fn invalid_reason(&self) -> Option<&str> {
        match self {
            ExtractionPayload::Invalid { reason } => Some(reason),
            _ => None,
        }
    }

    /// Table and chart elements carried by this payload, in order.
    pub fn into_entries(self) -> Vec<PayloadEntry> {
        match self {
            ExtractionPayload::Table(t) => vec![PayloadEntry::Table(t)],
            ExtractionPayload::TableSet(entries) => entries,
            ExtractionPayload::Chart(c) => vec![PayloadEntry::Chart(c)],
            ExtractionPayload::Text(_) | ExtractionPayload::Invalid { .. } => Vec::new(),
        }
    }

    /// The `type` tag as the service spells it.
    pub fn type_label(&self) -> &'static str {
        match self {
            ExtractionPayload::Table(_) => "table",
            ExtractionPayload::TableSet(_) => "table_set",
            ExtractionPayload::Chart(_) => "chart",
            ExtractionPayload::Text(_) => "text",
            ExtractionPayload::Invalid { .. } => "invalid",
        }
    }
}

impl PayloadEntry {
    pub fn title(&self) -> Option<&str> {
        match self {
            PayloadEntry::Table(t) => t.title.as_deref(),
            PayloadEntry::Chart(c) => c.title.as_deref(),
        }
    }

    pub fn notes(&self) -> Option<&str> {
        match self {
            PayloadEntry::Table(t) => t.notes.as_deref(),
            PayloadEntry::Chart(c) => c.notes.as_deref(),
        }
    }

    pub fn set_notes(&mut self, notes: String) {
        match self {
            PayloadEntry::Table(t) => t.notes = Some(notes),
            PayloadEntry::Chart(c) => c.notes = Some(notes),
        }
    }
}

fn parse_table_set(obj: &Map<String, Value>) -> ExtractionPayload {
    let Some(tables) = obj.get("tables").and_then(Value::as_array) else {
        return ExtractionPayload::invalid("table_set without a 'tables' array");
    };
    if tables.is_empty() {
        return ExtractionPayload::invalid("table_set with an empty 'tables' array");
    }

    let mut entries = Vec::with_capacity(tables.len());
    let mut rejected = Vec::new();
    for (idx, raw) in tables.iter().enumerate() {
        let parsed = match raw.as_object() {
            None => Err("not an object".to_string()),
            Some(entry) if entry.get("type").and_then(Value::as_str) == Some("chart") => {
                parse_chart(entry).map(PayloadEntry::Chart)
            }
            Some(entry) => parse_table(entry).map(PayloadEntry::Table),
        };
        match parsed {
            Ok(e) => entries.push(e),
            Err(reason) => rejected.push(format!("entry {}: {}", idx + 1, reason)),
        }
    }

    if entries.is_empty() {
        return ExtractionPayload::invalid(rejected.join("; "));
    }
    for reason in &rejected {
        warn!("Dropping table_set {}", reason);
    }
    ExtractionPayload::TableSet(entries)
}

fn parse_table(obj: &Map<String, Value>) -> Result<TableEntry, String> {
    let title = text_field(obj, "title");
    let notes = text_field(obj, "notes");

    let is_html = obj.get("format").and_then(Value::as_str) == Some("html")
        || (obj.get("html").is_some() && obj.get("table").is_none() && obj.get("rows").is_none());

    if is_html {
        let html = obj
            .get("html")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if html.len() < MIN_HTML_LEN {
            return Err("'html' missing or too short".into());
        }
        if !html.to_lowercase().contains("<table") {
            return Err("'html' does not contain a <table>".into());
        }
        return Ok(TableEntry {
            title,
            notes,
            body: TableBody::Html {
                html: html.to_string(),
            },
        });
    }

    // Legacy: {table:{headers, rows}} or the same fields inline.
    let table = match obj.get("table") {
        Some(Value::Object(t)) => t,
        Some(_) => return Err("'table' is not an object".into()),
        None if obj.contains_key("rows") => obj,
        None => return Err("neither 'table' nor 'html' present".into()),
    };
    let rows = match table.get("rows") {
        Some(Value::Array(rows)) if !rows.is_empty() => rows,
        _ => return Err("'rows' missing or empty".into()),
    };
    let rows: Vec<Vec<String>> = rows.iter().map(row_cells).collect();
    if !rows.iter().flatten().any(|c| !c.trim().is_empty()) {
        return Err("every row is empty".into());
    }
    let headers = table
        .get("headers")
        .and_then(Value::as_array)
        .filter(|h| !h.is_empty())
        .map(|h| h.iter().map(scalar_text).collect());

    Ok(TableEntry {
        title,
        notes,
        body: TableBody::Rows { headers, rows },
    })
}

fn parse_chart(obj: &Map<String, Value>) -> Result<ChartEntry, String> {
    let title = text_field(obj, "title");
    let notes = text_field(obj, "notes");
    let chart = match obj.get("chart") {
        Some(Value::Object(c)) if !c.is_empty() => c,
        _ => return Err("'chart' missing".into()),
    };

    if let Some(ternary) = chart.get("ternary") {
        let Some(ternary) = ternary.as_object() else {
            return Err("'ternary' is not an object".into());
        };
        return parse_ternary(chart, ternary).map(|chart| ChartEntry { title, notes, chart });
    }

    if let Some(x) = chart.get("x") {
        let x = x.as_object().ok_or("'x' is not an object")?;
        let x_values: Vec<String> = x
            .get("values")
            .and_then(Value::as_array)
            .map(|v| v.iter().map(scalar_text).collect())
            .unwrap_or_default();
        let series: Vec<ChartSeries> = chart
            .get("series")
            .and_then(Value::as_array)
            .map(|s| s.iter().filter_map(Value::as_object).map(parse_series).collect())
            .unwrap_or_default();
        if x_values.is_empty() || series.is_empty() {
            return Err("chart with empty x or series".into());
        }
        if series.iter().all(|s| s.values.is_empty()) {
            return Err("no series carries values".into());
        }
        let y_label = chart
            .get("y")
            .and_then(Value::as_object)
            .and_then(|y| text_field(y, "label"));
        return Ok(ChartEntry {
            title,
            notes,
            chart: ChartBody::Series {
                x_label: text_field(x, "label").unwrap_or_else(|| "x".to_string()),
                x_unit: text_field(x, "unit"),
                x_values,
                y_label,
                series,
            },
        });
    }

    let labels = chart.get("labels").and_then(Value::as_array);
    let rows = chart.get("series").and_then(Value::as_array);
    if let (Some(labels), Some(rows)) = (labels, rows) {
        if labels.is_empty() || rows.is_empty() {
            return Err("labels or series empty".into());
        }
        let labels: Vec<String> = labels.iter().map(scalar_text).collect();
        let rows = rows
            .iter()
            .filter_map(Value::as_object)
            .map(|row| {
                labels
                    .iter()
                    .map(|l| row.get(l).map(scalar_text).unwrap_or_default())
                    .collect()
            })
            .collect();
        return Ok(ChartEntry {
            title,
            notes,
            chart: ChartBody::Records { labels, rows },
        });
    }

    Err("unrecognised chart structure".into())
}

fn parse_series(obj: &Map<String, Value>) -> ChartSeries {
    ChartSeries {
        name: text_field(obj, "name"),
        values: obj
            .get("values")
            .and_then(Value::as_array)
            .map(|v| {
                v.iter()
                    .map(|cell| match cell {
                        Value::Null => None,
                        other => Some(scalar_text(other)),
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn parse_ternary(
    chart: &Map<String, Value>,
    ternary: &Map<String, Value>,
) -> Result<ChartBody, String> {
    let mut axes = Vec::new();
    match ternary.get("axes") {
        Some(Value::Object(map)) => {
            for (key, spec) in map {
                axes.push(parse_axis(key, spec));
            }
        }
        Some(Value::Array(list)) => {
            for (i, spec) in list.iter().enumerate() {
                let key = spec
                    .as_object()
                    .and_then(|o| text_field(o, "key"))
                    .unwrap_or_else(|| ["a", "b", "c"].get(i).copied().unwrap_or("axis").into());
                axes.push(parse_axis(&key, spec));
            }
        }
        _ => {
            for key in ["a", "b", "c"] {
                if let Some(spec) = ternary.get(key).filter(|v| !v.is_null()) {
                    axes.push(parse_axis(key, spec));
                }
            }
        }
    }

    let region_list = ternary
        .get("regions")
        .or_else(|| chart.get("regions"))
        .and_then(Value::as_array);
    let mut regions: Vec<TernaryRegion> = region_list
        .map(|list| {
            list.iter()
                .filter_map(Value::as_object)
                .map(|r| TernaryRegion {
                    name: text_field(r, "name").unwrap_or_default(),
                    values: axes
                        .iter()
                        .map(|axis| {
                            r.get(&axis.key)
                                .or_else(|| r.get(&axis.label))
                                .map(scalar_text)
                                .filter(|s| !s.is_empty())
                        })
                        .collect(),
                })
                .collect()
        })
        .unwrap_or_default();

    // Some responses list classes as series names instead of regions.
    if regions.is_empty() {
        if let Some(series) = chart.get("series").and_then(Value::as_array) {
            regions = series
                .iter()
                .filter_map(Value::as_object)
                .filter_map(|s| text_field(s, "name"))
                .map(|name| TernaryRegion {
                    name,
                    values: vec![None; axes.len()],
                })
                .collect();
        }
    }

    if axes.is_empty() && regions.is_empty() {
        return Err("ternary chart without axes or regions".into());
    }
    Ok(ChartBody::Ternary { axes, regions })
}

fn parse_axis(key: &str, spec: &Value) -> TernaryAxis {
    let obj = spec.as_object();
    let ticks = obj
        .and_then(|o| o.get("ticks").or_else(|| o.get("values")))
        .and_then(Value::as_array)
        .map(|t| t.iter().map(scalar_text).collect())
        .unwrap_or_default();
    let label = obj
        .and_then(|o| text_field(o, "label"))
        .or_else(|| spec.as_str().map(str::to_string))
        .unwrap_or_else(|| key.to_string());
    TernaryAxis {
        key: key.to_string(),
        label,
        ticks,
    }
}

fn parse_text(obj: &Map<String, Value>) -> Result<TextPayload, String> {
    let notes = match obj.get("notes") {
        Some(Value::Array(items)) => items
            .iter()
            .map(scalar_text)
            .filter(|s| !s.trim().is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    };
    let sections: Vec<TextSection> = obj
        .get("sections")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(Value::as_object).filter_map(parse_section).collect())
        .unwrap_or_default();

    if sections.is_empty() && notes.is_empty() {
        return Err("text payload without sections or notes".into());
    }
    Ok(TextPayload {
        title: text_field(obj, "title"),
        notes,
        sections,
    })
}

fn parse_section(obj: &Map<String, Value>) -> Option<TextSection> {
    let text = text_field(obj, "text");
    match obj.get("type").and_then(Value::as_str)? {
        "heading" => Some(TextSection::Heading {
            level: obj
                .get("level")
                .and_then(Value::as_u64)
                .map(|l| l.clamp(1, 6) as u8)
                .unwrap_or(2),
            text: text?,
        }),
        "paragraph" => Some(TextSection::Paragraph { text: text? }),
        "list" => Some(TextSection::List {
            ordered: obj.get("style").and_then(Value::as_str) == Some("numbered"),
            items: obj
                .get("items")
                .and_then(Value::as_array)
                .map(|i| i.iter().map(scalar_text).collect())
                .unwrap_or_default(),
        }),
        "blockquote" => Some(TextSection::Blockquote { text: text? }),
        "reference" => Some(TextSection::Reference { text: text? }),
        _ => text.map(|text| TextSection::Paragraph { text }),
    }
}

// ── Value helpers ────────────────────────────────────────────────────────

/// Render a JSON scalar as cell text. `null` becomes an empty cell.
pub fn scalar_text(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn row_cells(row: &Value) -> Vec<String> {
    match row {
        Value::Array(cells) => cells.iter().map(scalar_text).collect(),
        Value::Object(map) => map.values().map(scalar_text).collect(),
        scalar => vec![scalar_text(scalar)],
    }
}

/// Non-empty text field; arrays of strings are joined with newlines.
fn text_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    let text = match obj.get(key)? {
        Value::String(s) => s.trim().to_string(),
        Value::Array(items) => items
            .iter()
            .map(scalar_text)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => return None,
        other => scalar_text(other),
    };
    (!text.is_empty()).then_some(text)
}

// ── Tabular view of charts ───────────────────────────────────────────────

impl ChartBody {
    /// Header row followed by data rows.
    pub fn to_rows(&self) -> Vec<Vec<String>> {
        match self {
            ChartBody::Series {
                x_label,
                x_unit,
                x_values,
                series,
                ..
            } => {
                let x_header = match x_unit {
                    Some(unit) => format!("{x_label} ({unit})"),
                    None => x_label.clone(),
                };
                let mut header = vec![x_header];
                header.extend(series.iter().enumerate().map(|(i, s)| {
                    s.name.clone().unwrap_or_else(|| format!("series_{}", i + 1))
                }));

                let len = series
                    .iter()
                    .map(|s| s.values.len())
                    .chain(std::iter::once(x_values.len()))
                    .max()
                    .unwrap_or(0);
                let mut table = vec![header];
                for i in 0..len {
                    let mut row = vec![x_values.get(i).cloned().unwrap_or_default()];
                    row.extend(
                        series
                            .iter()
                            .map(|s| s.values.get(i).cloned().flatten().unwrap_or_default()),
                    );
                    if row.iter().any(|c| !c.trim().is_empty()) {
                        table.push(row);
                    }
                }
                table
            }
            ChartBody::Records { labels, rows } => {
                let mut table = vec![labels.clone()];
                table.extend(rows.iter().cloned());
                table
            }
            ChartBody::Ternary { axes, regions } => {
                let mut header = vec!["Region".to_string()];
                header.extend(axes.iter().map(|a| a.label.clone()));
                let width = header.len();
                let mut table = vec![header];
                if regions.is_empty() {
                    for axis in axes {
                        let mut row = vec![axis.label.clone(), tick_range(&axis.ticks)];
                        row.resize(width.max(2), String::new());
                        table.push(row);
                    }
                } else {
                    for region in regions {
                        let mut row = vec![region.name.clone()];
                        row.extend(region.values.iter().map(|v| v.clone().unwrap_or_default()));
                        row.resize(width, String::new());
                        table.push(row);
                    }
                }
                table
            }
        }
    }

    /// `(x categories, longest series)` for series charts.
    pub fn series_lengths(&self) -> Option<(usize, usize)> {
        match self {
            ChartBody::Series {
                x_values, series, ..
            } => Some((
                x_values.len(),
                series.iter().map(|s| s.values.len()).max().unwrap_or(0),
            )),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_rows().len() < 2
    }
}

fn tick_range(ticks: &[String]) -> String {
    let nums: Vec<f64> = ticks
        .iter()
        .filter_map(|t| t.trim().trim_end_matches('%').replace(',', ".").parse().ok())
        .collect();
    if !nums.is_empty() {
        let min = nums.iter().copied().fold(f64::INFINITY, f64::min);
        let max = nums.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        return format!("{min:.0}-{max:.0}");
    }
    match (ticks.first(), ticks.last()) {
        (Some(first), Some(last)) => format!("{first}-{last}"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_fences() {
        assert_eq!(strip_json_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_json_fences("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn decode_tolerates_chatter() {
        let v = decode_json_object("Here you go:\n{\"type\":\"table\"}\nThanks").unwrap();
        assert_eq!(v["type"], "table");
        assert!(decode_json_object("").is_none());
        assert!(decode_json_object("I cannot read this image.").is_none());
        assert!(decode_json_object("[1,2,3]").is_none());
    }

    #[test]
    fn html_table_accepted() {
        let p = ExtractionPayload::from_value(&json!({
            "type": "table", "format": "html", "title": "Table 3",
            "html": "<table><tr><td>1</td></tr></table>"
        }));
        match p {
            ExtractionPayload::Table(t) => {
                assert_eq!(t.title.as_deref(), Some("Table 3"));
                assert!(matches!(t.body, TableBody::Html { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn html_without_table_tag_rejected() {
        let p = ExtractionPayload::from_value(&json!({
            "type": "table", "format": "html", "html": "<div>nothing here</div>"
        }));
        assert!(p.invalid_reason().unwrap().contains("<table>"));
    }

    #[test]
    fn legacy_rows_need_content() {
        let ok = ExtractionPayload::from_value(&json!({
            "type": "table", "table": {"headers": ["a", "b"], "rows": [["1", 2]]}
        }));
        assert!(ok.is_valid());

        let empty = ExtractionPayload::from_value(&json!({
            "type": "table", "table": {"rows": [["", " "]]}
        }));
        assert!(!empty.is_valid());
    }

    #[test]
    fn table_set_mixes_tables_and_charts() {
        let p = ExtractionPayload::from_value(&json!({
            "type": "table_set",
            "tables": [
                {"title": "T1", "format": "html", "html": "<table><tr><td>x</td></tr></table>"},
                {"title": "G1", "type": "chart", "chart": {
                    "x": {"label": "Dose", "values": [0, 50]},
                    "series": [{"name": "Yield", "values": [1.5, null]}]
                }}
            ]
        }));
        let entries = p.into_entries();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0], PayloadEntry::Table(_)));
        assert!(matches!(entries[1], PayloadEntry::Chart(_)));
    }

    #[test]
    fn table_set_with_only_bad_entries_is_invalid() {
        let p = ExtractionPayload::from_value(&json!({
            "type": "table_set",
            "tables": [{"title": "T1"}, "junk"]
        }));
        let reason = p.invalid_reason().unwrap();
        assert!(reason.starts_with("entry 1"));
        assert!(reason.contains("entry 2: not an object"));
    }

    #[test]
    fn table_set_keeps_good_siblings_of_a_bad_entry() {
        let p = ExtractionPayload::from_value(&json!({
            "type": "table_set",
            "tables": [
                {"title": "Good", "table": {"headers": ["A"], "rows": [["1"]]}},
                {"title": "Bad"}
            ]
        }));
        assert!(p.is_valid());
        let entries = p.into_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title(), Some("Good"));
    }

    #[test]
    fn unknown_type_is_invalid() {
        let p = ExtractionPayload::from_value(&json!({"type": "poem"}));
        assert_eq!(p.type_label(), "invalid");
    }

    #[test]
    fn series_chart_to_rows() {
        let p = ExtractionPayload::from_value(&json!({
            "type": "chart",
            "chart": {
                "x": {"label": "N rate", "unit": "kg/ha", "values": [0, 60, 120]},
                "series": [{"name": "2019", "values": [1, 2, 3]}, {"values": [4, null]}]
            }
        }));
        let ExtractionPayload::Chart(c) = p else { panic!("expected chart") };
        let rows = c.chart.to_rows();
        assert_eq!(rows[0], vec!["N rate (kg/ha)", "2019", "series_2"]);
        assert_eq!(rows[2], vec!["60", "2", ""]);
        assert_eq!(rows.len(), 4);
    }

    #[test]
    fn records_chart_to_rows() {
        let p = ExtractionPayload::from_value(&json!({
            "type": "chart",
            "chart": {"labels": ["Year", "Yield"], "series": [{"Year": 2020, "Yield": "3,4"}]}
        }));
        let ExtractionPayload::Chart(c) = p else { panic!("expected chart") };
        assert_eq!(c.chart.to_rows()[1], vec!["2020", "3,4"]);
    }

    #[test]
    fn ternary_axes_and_regions() {
        let p = ExtractionPayload::from_value(&json!({
            "type": "chart",
            "chart": {"ternary": {
                "axes": {"sand": {"label": "Sand (%)"}, "clay": {"label": "Clay (%)"}},
                "regions": [{"name": "Sandy", "sand": "70-100", "clay": "0-15"}]
            }}
        }));
        let ExtractionPayload::Chart(c) = p else { panic!("expected chart") };
        let rows = c.chart.to_rows();
        assert_eq!(rows[0][0], "Region");
        assert_eq!(rows[1][0], "Sandy");
        assert_eq!(rows[1].len(), rows[0].len());
    }

    #[test]
    fn ternary_abc_without_regions_summarises_ticks() {
        let p = ExtractionPayload::from_value(&json!({
            "type": "chart",
            "chart": {"ternary": {
                "a": {"label": "Sand", "ticks": [0, 50, 100]},
                "b": {"label": "Silt"},
                "c": {"label": "Clay"}
            }}
        }));
        let ExtractionPayload::Chart(c) = p else { panic!("expected chart") };
        let rows = c.chart.to_rows();
        assert_eq!(rows[1][0], "Sand");
        assert_eq!(rows[1][1], "0-100");
    }

    #[test]
    fn text_payload_sections() {
        let p = ExtractionPayload::from_value(&json!({
            "type": "text",
            "title": "Intro",
            "sections": [
                {"type": "heading", "level": 1, "text": "Intro"},
                {"type": "list", "style": "numbered", "items": ["a", "b"]}
            ]
        }));
        let ExtractionPayload::Text(t) = p else { panic!("expected text") };
        assert_eq!(t.sections.len(), 2);
        assert!(matches!(t.sections[1], TextSection::List { ordered: true, .. }));
    }

    #[test]
    fn series_lengths_reports_longest() {
        let body = ChartBody::Series {
            x_label: "x".into(),
            x_unit: None,
            x_values: vec!["1".into(), "2".into()],
            y_label: None,
            series: vec![ChartSeries {
                name: None,
                values: vec![Some("1".into()); 4],
            }],
        };
        assert_eq!(body.series_lengths(), Some((2, 4)));
    }
}
