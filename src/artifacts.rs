//! Per-page artifact layout and writers.
//!
//! ```text
//! <output>/page-007/
//!   page-full.png            upright page image
//!   classification.json      classifier verdict
//!   segment-01.png/.json     crop + raw response, one pair per segment
//!   segments-manifest.json   crop index with boxes and scores
//!   page-full.json           merged payload (mode, provenance, entries)
//!   table-01.json/.html      canonical entries, tables and charts
//!   chart-01.json/.html      numbered separately
//!   REVIEW-MANUALLY.txt      present only when validation raised flags
//!   review.json
//! ```
//!
//! Canonical entry files double as the checkpoint, so they are always
//! written atomically (temp file + rename): a crash never leaves a
//! half-written entry that a later run would mistake for a finished page.

use crate::error::PageError;
use crate::model::{CanonicalEntry, ReviewFlag};
use crate::payload::{TextPayload, TextSection};
use crate::pipeline::encode::png_bytes;
use image::DynamicImage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const PAGE_IMAGE: &str = "page-full.png";
pub const CLASSIFICATION: &str = "classification.json";
pub const SEGMENTS_MANIFEST: &str = "segments-manifest.json";
pub const PAGE_PAYLOAD: &str = "page-full.json";
pub const REVIEW_TEXT: &str = "REVIEW-MANUALLY.txt";
pub const REVIEW_JSON: &str = "review.json";
pub const PAGE_NOTES: &str = "page-notes.json";
pub const PAGE_TEXT_JSON: &str = "page-text.json";
pub const PAGE_TEXT_HTML: &str = "page-text.html";

static RE_ENTRY_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(table|chart)-\d{2,}\.(json|html)$").expect("valid regex"));

/// `page-NNN` directory for `page` under `root`.
pub fn page_dir(root: &Path, page: usize) -> PathBuf {
    root.join(page_dir_name(page))
}

pub fn page_dir_name(page: usize) -> String {
    format!("page-{page:03}")
}

/// `true` for canonical entry files (`table-01.json`, `chart-02.html`, …).
pub fn is_entry_artifact(file_name: &str) -> bool {
    RE_ENTRY_FILE.is_match(file_name)
}

/// Write `bytes` to `path` through a sibling temp file and a rename.
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Writer bound to one page directory.
#[derive(Debug, Clone)]
pub struct PageArtifacts {
    page: usize,
    dir: PathBuf,
}

impl PageArtifacts {
    pub fn new(page: usize, dir: impl Into<PathBuf>) -> Self {
        Self {
            page,
            dir: dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn write_error(&self, path: &Path, err: impl std::fmt::Display) -> PageError {
        PageError::ArtifactWrite {
            page: self.page,
            path: path.to_path_buf(),
            detail: err.to_string(),
        }
    }

    pub async fn write_bytes(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, PageError> {
        let path = self.path(name);
        atomic_write(&path, bytes)
            .await
            .map_err(|e| self.write_error(&path, e))?;
        debug!("Page {}: wrote {}", self.page, path.display());
        Ok(path)
    }

    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        name: &str,
        value: &T,
    ) -> Result<PathBuf, PageError> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| self.write_error(&self.path(name), e))?;
        self.write_bytes(name, &bytes).await
    }

    pub async fn write_image(&self, name: &str, image: &DynamicImage) -> Result<PathBuf, PageError> {
        let bytes = png_bytes(image).map_err(|e| PageError::Image {
            page: self.page,
            detail: format!("{name}: {e}"),
        })?;
        self.write_bytes(name, &bytes).await
    }

    /// `<name>.json` and `<name>.html` for one canonical entry.
    pub async fn write_entry(&self, entry: &CanonicalEntry) -> Result<(), PageError> {
        self.write_json(&format!("{}.json", entry.name), entry).await?;
        self.write_bytes(&format!("{}.html", entry.name), entry_html(entry).as_bytes())
            .await?;
        Ok(())
    }

    /// Persist review flags, or remove stale review files when there are none.
    pub async fn write_review(&self, flags: &[ReviewFlag]) -> Result<(), PageError> {
        if flags.is_empty() {
            for name in [REVIEW_TEXT, REVIEW_JSON] {
                let _ = tokio::fs::remove_file(self.path(name)).await;
            }
            return Ok(());
        }
        self.write_bytes(REVIEW_TEXT, review_text(self.page, flags).as_bytes())
            .await?;
        self.write_json(REVIEW_JSON, flags).await?;
        Ok(())
    }

    /// Remove canonical entries left by a previous run of this page.
    pub async fn clear_entries(&self) -> Result<(), PageError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(self.write_error(&self.dir, e)),
        };
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| self.write_error(&self.dir, e))?
        {
            let name = item.file_name().to_string_lossy().into_owned();
            if is_entry_artifact(&name) {
                tokio::fs::remove_file(item.path())
                    .await
                    .map_err(|e| self.write_error(&item.path(), e))?;
            }
        }
        Ok(())
    }
}

/// Canonical entries previously written to `dir`, in (kind, index) order.
pub async fn load_entries(dir: &Path) -> Vec<CanonicalEntry> {
    let mut entries = Vec::new();
    let Ok(mut read) = tokio::fs::read_dir(dir).await else {
        return entries;
    };
    while let Ok(Some(item)) = read.next_entry().await {
        let name = item.file_name().to_string_lossy().into_owned();
        if !is_entry_artifact(&name) || !name.ends_with(".json") {
            continue;
        }
        let parsed = tokio::fs::read(item.path())
            .await
            .map_err(|e| e.to_string())
            .and_then(|bytes| {
                serde_json::from_slice::<CanonicalEntry>(&bytes).map_err(|e| e.to_string())
            });
        match parsed {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!("Ignoring unreadable entry {}: {}", item.path().display(), e),
        }
    }
    entries.sort_by_key(|e| (e.kind, e.index()));
    entries
}

// ── HTML rendering ───────────────────────────────────────────────────────

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

const STYLE: &str = "body{font-family:sans-serif;margin:2em;color:#222}\
table{border-collapse:collapse;margin:1em 0}\
th,td{border:1px solid #999;padding:4px 8px;text-align:left}\
th{background:#eef2f5}\
.title{font-size:1.3em;font-weight:bold;margin-bottom:.5em}\
.notes{margin-top:1em;padding:.6em;background:#fff3cd;border-left:4px solid #ffc107}\
.source{color:#777;font-size:.85em}";

fn html_document(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n<style>{}</style>\n</head>\n<body>\n{}</body>\n</html>\n",
        escape_html(title),
        STYLE,
        body
    )
}

/// Render `rows` (header first) as an HTML table.
pub fn rows_html(rows: &[Vec<String>]) -> String {
    let mut html = String::from("<table>\n");
    if let Some(header) = rows.first() {
        html.push_str("<thead><tr>");
        for cell in header {
            html.push_str(&format!("<th>{}</th>", escape_html(cell)));
        }
        html.push_str("</tr></thead>\n<tbody>\n");
    }
    for row in rows.iter().skip(1) {
        html.push_str("<tr>");
        for cell in row {
            html.push_str(&format!("<td>{}</td>", escape_html(cell)));
        }
        html.push_str("</tr>\n");
    }
    html.push_str("</tbody>\n</table>\n");
    html
}

/// Standalone viewer for one entry.
pub fn entry_html(entry: &CanonicalEntry) -> String {
    let title = entry.title.clone().unwrap_or_else(|| entry.name.clone());
    let mut body = format!("<div class=\"title\">{}</div>\n", escape_html(&title));
    body.push_str(&rows_html(&entry.rows));
    if let Some(notes) = entry.notes.as_deref().filter(|n| !n.trim().is_empty()) {
        body.push_str(&format!(
            "<div class=\"notes\"><strong>Notes:</strong> {}</div>\n",
            escape_html(notes)
        ));
    }
    body.push_str(&format!(
        "<p class=\"source\">Page {} · {}</p>\n",
        entry.page,
        escape_html(&entry.provenance.source)
    ));
    html_document(&title, &body)
}

static RE_BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*(.+?)\*\*").expect("valid regex"));
static RE_ITALIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*(.+?)\*").expect("valid regex"));

/// Escape, then render `**bold**` and `*italic*`.
fn inline_html(text: &str) -> String {
    let escaped = escape_html(text);
    let bold = RE_BOLD.replace_all(&escaped, "<strong>$1</strong>");
    RE_ITALIC.replace_all(&bold, "<em>$1</em>").into_owned()
}

/// Readable rendering of a transcribed text page.
pub fn text_html(page: usize, text: &TextPayload) -> String {
    let title = text
        .title
        .clone()
        .unwrap_or_else(|| format!("Page {page}"));
    let mut body = format!("<div class=\"title\">{}</div>\n", escape_html(&title));
    for section in &text.sections {
        match section {
            TextSection::Heading { level, text } => {
                let l = (*level).clamp(1, 6);
                body.push_str(&format!("<h{l}>{}</h{l}>\n", inline_html(text)));
            }
            TextSection::Paragraph { text } => {
                body.push_str(&format!("<p>{}</p>\n", inline_html(text)));
            }
            TextSection::List { ordered, items } => {
                let tag = if *ordered { "ol" } else { "ul" };
                body.push_str(&format!("<{tag}>\n"));
                for item in items {
                    body.push_str(&format!("<li>{}</li>\n", inline_html(item)));
                }
                body.push_str(&format!("</{tag}>\n"));
            }
            TextSection::Blockquote { text } => {
                body.push_str(&format!("<blockquote>{}</blockquote>\n", inline_html(text)));
            }
            TextSection::Reference { text } => {
                body.push_str(&format!("<p class=\"source\">{}</p>\n", inline_html(text)));
            }
        }
    }
    if !text.notes.is_empty() {
        body.push_str("<div class=\"notes\"><strong>Notes:</strong><ul>\n");
        for note in &text.notes {
            body.push_str(&format!("<li>{}</li>\n", inline_html(note)));
        }
        body.push_str("</ul></div>\n");
    }
    html_document(&title, &body)
}

fn review_text(page: usize, flags: &[ReviewFlag]) -> String {
    let mut out = format!("Page {page} needs manual review.\n");
    if let Some(first) = flags.first() {
        out.push_str(&format!(
            "Expected elements: {}\nExtracted elements: {}\n",
            first.expected_count, first.extracted_count
        ));
    }
    out.push('\n');
    for flag in flags {
        let kind = serde_json::to_value(flag.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        out.push_str(&format!("- [{}] {}\n", kind, flag.reason));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryKind, Provenance, ReviewKind};

    fn entry(name: &str, kind: EntryKind) -> CanonicalEntry {
        CanonicalEntry {
            name: name.into(),
            page: 3,
            kind,
            title: Some("Yield <t/ha>".into()),
            notes: Some("ns = not significant".into()),
            rows: vec![
                vec!["Site".into(), "Yield".into()],
                vec!["A & B".into(), "3.1".into()],
            ],
            chart: None,
            provenance: Provenance::whole_page(),
        }
    }

    #[test]
    fn entry_file_pattern() {
        assert!(is_entry_artifact("table-01.json"));
        assert!(is_entry_artifact("chart-12.html"));
        assert!(!is_entry_artifact("segment-01.json"));
        assert!(!is_entry_artifact("table-01.json.tmp"));
        assert!(!is_entry_artifact("page-full.json"));
    }

    #[test]
    fn page_dirs_are_zero_padded() {
        assert_eq!(page_dir(Path::new("/out"), 7), PathBuf::from("/out/page-007"));
    }

    #[test]
    fn entry_html_escapes() {
        let html = entry_html(&entry("table-01", EntryKind::Table));
        assert!(html.contains("Yield &lt;t/ha&gt;"));
        assert!(html.contains("<td>A &amp; B</td>"));
        assert!(html.contains("ns = not significant"));
    }

    #[test]
    fn text_html_renders_emphasis() {
        let text = TextPayload {
            title: None,
            notes: vec![],
            sections: vec![
                TextSection::Heading {
                    level: 9,
                    text: "Methods".into(),
                },
                TextSection::Paragraph {
                    text: "**Bold** and *italic* <x>".into(),
                },
            ],
        };
        let html = text_html(2, &text);
        assert!(html.contains("<h6>Methods</h6>"));
        assert!(html.contains("<strong>Bold</strong> and <em>italic</em> &lt;x&gt;"));
    }

    #[tokio::test]
    async fn entries_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PageArtifacts::new(3, dir.path());
        writer.write_entry(&entry("table-02", EntryKind::Table)).await.unwrap();
        writer.write_entry(&entry("chart-01", EntryKind::Chart)).await.unwrap();
        writer.write_entry(&entry("table-01", EntryKind::Table)).await.unwrap();

        let loaded = load_entries(dir.path()).await;
        let names: Vec<&str> = loaded.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["table-01", "table-02", "chart-01"]);
        assert!(!dir.path().join("table-01.json.tmp").exists());

        writer.clear_entries().await.unwrap();
        assert!(load_entries(dir.path()).await.is_empty());
    }

    #[tokio::test]
    async fn review_files_appear_and_disappear() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PageArtifacts::new(5, dir.path());
        let flag = ReviewFlag {
            page: 5,
            expected_count: 4,
            extracted_count: 2,
            kind: ReviewKind::CountMismatch,
            reason: "expected 4 elements, extracted 2".into(),
        };
        writer.write_review(&[flag]).await.unwrap();
        let text = std::fs::read_to_string(dir.path().join(REVIEW_TEXT)).unwrap();
        assert!(text.contains("Expected elements: 4"));
        assert!(text.contains("[count_mismatch]"));
        writer.write_review(&[]).await.unwrap();
        assert!(!dir.path().join(REVIEW_JSON).exists());
    }
}
